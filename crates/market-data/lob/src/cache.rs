//! Per-instrument analysis cache

use crate::analyzer::AnalysisResult;
use common::{InstrumentId, Snapshot};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CachedAnalysis {
    result: Arc<AnalysisResult>,
    source: Arc<Snapshot>,
    computed: Instant,
}

/// Keeps the last analysis of each instrument.
///
/// A cached result is reused while it is younger than the interval, and
/// also for as long as no newer snapshot has been applied.
pub struct AnalysisCache {
    interval: Duration,
    entries: Mutex<FxHashMap<InstrumentId, CachedAnalysis>>,
}

impl AnalysisCache {
    /// Create a cache that recomputes at most once per `interval`
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Cached analysis for `latest`, computing a fresh one when stale.
    ///
    /// `compute` runs without the cache lock held. The result is only
    /// kept if `live` still holds for the instrument once it is ready, so
    /// a computation racing an unsubscribe leaves nothing behind.
    pub fn get_or_compute<F, L>(
        &self,
        latest: &Arc<Snapshot>,
        now: Instant,
        compute: F,
        live: L,
    ) -> Arc<AnalysisResult>
    where
        F: FnOnce() -> AnalysisResult,
        L: FnOnce(InstrumentId) -> bool,
    {
        if let Some(cached) = self.entries.lock().get(&latest.instrument) {
            let same_source = Arc::ptr_eq(&cached.source, latest);
            let young = now.saturating_duration_since(cached.computed) < self.interval;
            if same_source || young {
                return Arc::clone(&cached.result);
            }
        }
        self.refresh(latest, now, compute, live)
    }

    /// Compute a fresh analysis for `latest` and cache it, ignoring any
    /// cached result. Same `live` rule as [`Self::get_or_compute`].
    pub fn refresh<F, L>(
        &self,
        latest: &Arc<Snapshot>,
        now: Instant,
        compute: F,
        live: L,
    ) -> Arc<AnalysisResult>
    where
        F: FnOnce() -> AnalysisResult,
        L: FnOnce(InstrumentId) -> bool,
    {
        let instrument = latest.instrument;
        let result = Arc::new(compute());

        // Checked under the lock: an invalidate that follows removal from
        // the store then runs after this insert
        let mut entries = self.entries.lock();
        if live(instrument) {
            entries.insert(
                instrument,
                CachedAnalysis {
                    result: Arc::clone(&result),
                    source: Arc::clone(latest),
                    computed: now,
                },
            );
        }
        result
    }

    /// Forget one instrument
    pub fn invalidate(&self, instrument: InstrumentId) {
        self.entries.lock().remove(&instrument);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached analyses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::DepthAnalyzer;
    use common::{ExchangeSegment, Side, SideDepth, Ts};
    use std::cell::Cell;

    fn snap(sequence: u32) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            1333,
            ExchangeSegment::NseEq,
            SideDepth::empty(Side::Bid),
            SideDepth::empty(Side::Ask),
            sequence,
            Ts::from_nanos(u64::from(sequence)),
        ))
    }

    fn always(_: InstrumentId) -> bool {
        true
    }

    #[test]
    fn test_reuses_within_interval_and_for_same_snapshot() {
        let cache = AnalysisCache::new(Duration::from_millis(100));
        let analyzer = DepthAnalyzer::default();
        let runs = Cell::new(0);
        let compute = |s: &Arc<Snapshot>| {
            runs.set(runs.get() + 1);
            analyzer.analyze(s, &[])
        };

        let t0 = Instant::now();
        let first = snap(1);
        cache.get_or_compute(&first, t0, || compute(&first), always);
        assert_eq!(runs.get(), 1);

        // Newer snapshot inside the interval: cached
        let second = snap(2);
        let r = cache.get_or_compute(&second, t0 + Duration::from_millis(50), || compute(&second), always);
        assert_eq!(runs.get(), 1);
        assert_eq!(r.snapshot_sequence, 1);

        // Interval passed but nothing new: still cached
        cache.get_or_compute(&first, t0 + Duration::from_secs(5), || compute(&first), always);
        assert_eq!(runs.get(), 1);

        // Interval passed and a newer snapshot exists: recompute
        let r = cache.get_or_compute(&second, t0 + Duration::from_millis(150), || compute(&second), always);
        assert_eq!(runs.get(), 2);
        assert_eq!(r.snapshot_sequence, 2);
    }

    #[test]
    fn test_refresh_bypasses_cached_result() {
        let cache = AnalysisCache::new(Duration::from_millis(100));
        let analyzer = DepthAnalyzer::default();
        let t0 = Instant::now();
        let first = snap(1);
        let cached = cache.get_or_compute(&first, t0, || analyzer.analyze(&first, &[]), always);

        // Same instant and same snapshot, still recomputed
        let fresh = cache.refresh(&first, t0, || analyzer.analyze(&first, &[]), always);
        assert!(!Arc::ptr_eq(&cached, &fresh));

        // The refreshed result is what later reads get
        let again = cache.get_or_compute(&first, t0, || analyzer.analyze(&first, &[]), always);
        assert!(Arc::ptr_eq(&fresh, &again));
    }

    #[test]
    fn test_result_for_removed_instrument_is_not_kept() {
        let cache = AnalysisCache::new(Duration::from_millis(100));
        let s = snap(1);
        let result = cache.get_or_compute(
            &s,
            Instant::now(),
            || DepthAnalyzer::default().analyze(&s, &[]),
            |_| false,
        );
        assert_eq!(result.instrument, 1333);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_drops_entry() {
        let cache = AnalysisCache::new(Duration::from_millis(100));
        let s = snap(1);
        cache.get_or_compute(&s, Instant::now(), || DepthAnalyzer::default().analyze(&s, &[]), always);
        assert_eq!(cache.len(), 1);
        cache.invalidate(1333);
        assert!(cache.is_empty());
    }
}
