//! Depth feed context object and its ingest task
//!
//! [`DepthFeed`] owns the shared state (store, analyzer, cache, metrics) and
//! a handle to the ingest task. The task owns the upstream connection and
//! drives [`FeedState`] through connect, subscribe and stream phases,
//! reconnecting with backoff whenever the connection is lost.

use super::adapter::{DepthConnection, DepthConnector};
use super::health::{ErrorBudget, FeedMetrics, IngestLimiter, MetricsSnapshot};
use super::pairing::{PairedDepth, PairingBuffer, Throttle, ThrottleDecision};
use super::state::{Backoff, FeedState, Outage, StateMachine};
use crate::config::DepthFeedConfig;
use crate::dhan::codec::{DepthFrame, DepthPacket, decode_frame, split_frames};
use crate::dhan::control::{ControlMessage, InstrumentRef, subscribe_batches, unsubscribe_batches};
use crate::error::FeedError;
use common::{
    ExchangeSegment, InstrumentId, Side, SideDepth, Snapshot, StaleMarker, StaleReason,
    Subscription, Ts,
};
use lob::{AnalysisCache, AnalysisResult, DepthAnalyzer, DepthStore, Registration};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// State shared between the handle and the ingest task
struct FeedShared {
    config: DepthFeedConfig,
    store: DepthStore,
    analyzer: DepthAnalyzer,
    cache: AnalysisCache,
    metrics: FeedMetrics,
}

impl FeedShared {
    fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.store.applied(), self.store.dropped_updates())
    }
}

type Reply<T> = oneshot::Sender<Result<T, FeedError>>;

enum Command {
    Subscribe {
        instrument: InstrumentId,
        segment: ExchangeSegment,
        reply: Reply<()>,
    },
    Unsubscribe {
        instrument: InstrumentId,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Report a failed control send as an upstream rejection
fn rejected(e: FeedError) -> FeedError {
    match e {
        FeedError::UpstreamRejected(_) => e,
        other => FeedError::UpstreamRejected(other.to_string()),
    }
}

/// Twenty-level depth feed.
///
/// Reads (`get_*`, `watch`, `metrics`) go straight to shared state and
/// never wait on the ingest task. Subscription changes are serialised
/// through it.
pub struct DepthFeed {
    shared: Arc<FeedShared>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<FeedState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DepthFeed {
    /// Validate `config` and spawn the ingest task on the current runtime.
    ///
    /// The task starts connecting right away; subscriptions made before
    /// the stream is up are replayed once it is.
    ///
    /// # Errors
    /// [`FeedError::Config`] when `config` fails validation
    pub fn start(
        config: DepthFeedConfig,
        connector: Arc<dyn DepthConnector>,
    ) -> Result<Self, FeedError> {
        config.validate()?;

        let shared = Arc::new(FeedShared {
            store: DepthStore::new(config.store.clone()),
            analyzer: DepthAnalyzer::new(config.analyzer.clone()),
            cache: AnalysisCache::new(Duration::from_millis(config.analyzer.recompute_interval_ms)),
            metrics: FeedMetrics::default(),
            config,
        });

        let (commands, rx) = mpsc::channel(shared.config.transport.command_queue);
        let (machine, state) = StateMachine::new();
        let task = IngestTask::new(Arc::clone(&shared), connector, rx, machine)?;
        let handle = tokio::spawn(task.run());

        info!(
            "Depth feed started (max {} subscriptions)",
            shared.config.transport.max_subscriptions
        );
        Ok(Self {
            shared,
            commands,
            state,
            task: Mutex::new(Some(handle)),
        })
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| FeedError::TransportClosed)?;
        rx.await.map_err(|_| FeedError::TransportClosed)?
    }

    /// Start depth for an instrument; a no-op if already subscribed.
    ///
    /// # Errors
    /// - [`FeedError::UnsupportedSegment`] for segments without twenty-level depth
    /// - [`FeedError::CapacityExceeded`] when the subscription table is full
    /// - [`FeedError::UpstreamRejected`] when the subscribe request could not be sent
    /// - [`FeedError::TransportClosed`] after shutdown
    pub async fn subscribe(
        &self,
        instrument: InstrumentId,
        segment: ExchangeSegment,
    ) -> Result<(), FeedError> {
        if !segment.supports_twenty_depth() {
            return Err(FeedError::UnsupportedSegment(segment));
        }
        self.request(|reply| Command::Subscribe {
            instrument,
            segment,
            reply,
        })
        .await
    }

    /// Stop depth for an instrument and drop its state; a no-op if not subscribed.
    ///
    /// # Errors
    /// [`FeedError::TransportClosed`] after shutdown
    pub async fn unsubscribe(&self, instrument: InstrumentId) -> Result<(), FeedError> {
        self.request(|reply| Command::Unsubscribe { instrument, reply })
            .await
    }

    /// Subscribed instrument ids
    #[must_use]
    pub fn list_subscriptions(&self) -> BTreeSet<InstrumentId> {
        self.shared.store.instruments().into_iter().collect()
    }

    /// Active subscriptions with their segments
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.store.subscriptions()
    }

    /// Latest snapshot
    ///
    /// # Errors
    /// [`FeedError::NotSubscribed`] or [`FeedError::NoDataYet`]
    pub fn get_snapshot(&self, instrument: InstrumentId) -> Result<Arc<Snapshot>, FeedError> {
        Ok(self.shared.store.snapshot(instrument)?)
    }

    /// Recent snapshots, oldest first
    ///
    /// # Errors
    /// [`FeedError::NotSubscribed`]
    pub fn get_history(&self, instrument: InstrumentId) -> Result<Vec<Arc<Snapshot>>, FeedError> {
        Ok(self.shared.store.history(instrument)?)
    }

    /// Analysis of the latest snapshot, cached per instrument
    ///
    /// # Errors
    /// [`FeedError::NotSubscribed`] or [`FeedError::NoDataYet`]
    pub fn get_analysis(&self, instrument: InstrumentId) -> Result<Arc<AnalysisResult>, FeedError> {
        let shared = &self.shared;
        let (latest, history) = shared.store.latest_with_history(instrument)?;
        let now = Instant::now().into_std();
        Ok(shared.cache.get_or_compute(
            &latest,
            now,
            || shared.analyzer.analyze(&latest, &history),
            |id| shared.store.contains(id),
        ))
    }

    /// Fresh analysis of the latest snapshot, bypassing the cache.
    ///
    /// The result replaces the cached one.
    ///
    /// # Errors
    /// [`FeedError::NotSubscribed`] or [`FeedError::NoDataYet`]
    pub fn refresh_analysis(&self, instrument: InstrumentId) -> Result<Arc<AnalysisResult>, FeedError> {
        let shared = &self.shared;
        let (latest, history) = shared.store.latest_with_history(instrument)?;
        let now = Instant::now().into_std();
        Ok(shared.cache.refresh(
            &latest,
            now,
            || shared.analyzer.analyze(&latest, &history),
            |id| shared.store.contains(id),
        ))
    }

    /// Channel receiving every snapshot applied for `instrument`
    ///
    /// # Errors
    /// [`FeedError::NotSubscribed`]
    pub fn watch(&self, instrument: InstrumentId) -> Result<bus::Receiver<Arc<Snapshot>>, FeedError> {
        Ok(self.shared.store.watch(instrument)?)
    }

    /// Current transport state
    #[must_use]
    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics()
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &DepthFeedConfig {
        &self.shared.config
    }

    /// Send the disconnect request, drop every subscription and stop the
    /// ingest task. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            // A dropped reply means the task already exited
            let _ = rx.await;
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Depth ingest task failed: {}", e);
            }
        }
    }
}

impl Drop for DepthFeed {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Why a connection ended
enum Exit {
    Lost(StaleReason),
    Shutdown,
}

struct IngestTask {
    shared: Arc<FeedShared>,
    connector: Arc<dyn DepthConnector>,
    commands: mpsc::Receiver<Command>,
    machine: StateMachine,
    backoff: Backoff,
    budget: ErrorBudget,
    limiter: IngestLimiter,
    pairing: PairingBuffer,
    throttle: Throttle,
    outage: Option<Outage>,
    stale_pending: FxHashMap<InstrumentId, StaleMarker>,
    last_metrics_log: Instant,
}

impl IngestTask {
    fn new(
        shared: Arc<FeedShared>,
        connector: Arc<dyn DepthConnector>,
        commands: mpsc::Receiver<Command>,
        machine: StateMachine,
    ) -> Result<Self, FeedError> {
        let t = &shared.config.transport;
        let per_second = NonZeroU32::new(t.max_frames_per_second).ok_or_else(|| {
            FeedError::Config("transport.max_frames_per_second is out of range".to_string())
        })?;
        Ok(Self {
            backoff: Backoff::new(
                Duration::from_millis(t.backoff_initial_ms),
                Duration::from_millis(t.backoff_max_ms),
                t.backoff_jitter,
            ),
            budget: ErrorBudget::new(t.error_budget, t.error_window()),
            limiter: IngestLimiter::new(per_second),
            pairing: PairingBuffer::new(t.pairing_window()),
            throttle: Throttle::new(t.throttle_interval()),
            outage: None,
            stale_pending: FxHashMap::default(),
            last_metrics_log: Instant::now(),
            shared,
            connector,
            commands,
            machine,
        })
    }

    async fn run(mut self) {
        loop {
            let Some(mut conn) = self.connect().await else {
                break;
            };

            let exit = match self.replay_subscriptions(conn.as_mut()).await {
                Ok(()) => self.stream(&mut conn).await,
                Err(e) => {
                    warn!("Depth subscription replay failed: {}", e);
                    Exit::Lost(StaleReason::ConnectionLost)
                }
            };

            match exit {
                Exit::Shutdown => {
                    self.teardown(Some(conn.as_mut())).await;
                    break;
                }
                Exit::Lost(reason) => {
                    if let Err(e) = conn.close().await {
                        debug!("Closing lost depth connection: {}", e);
                    }
                    self.degrade(reason);
                    if !self.wait_backoff().await {
                        break;
                    }
                }
            }
        }
        info!("Depth ingest task stopped");
    }

    /// Open a connection, serving commands meanwhile. `None` on shutdown.
    async fn connect(&mut self) -> Option<Box<dyn DepthConnection>> {
        loop {
            self.machine.transition(FeedState::Connecting);
            let connector = Arc::clone(&self.connector);
            let connecting = connector.connect();
            tokio::pin!(connecting);

            let result = loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    cmd = self.commands.recv() => {
                        if !self.handle_offline(cmd) {
                            return None;
                        }
                    }
                }
            };

            match result {
                Ok(conn) => {
                    self.machine.transition(FeedState::Subscribing);
                    return Some(conn);
                }
                Err(e) => {
                    error!("Depth connect failed: {}", e);
                    self.machine.transition(FeedState::Degraded);
                    if !self.wait_backoff().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep out the next backoff delay; false on shutdown
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        info!(
            "Reconnecting depth feed in {:?} (attempt {})",
            delay,
            self.backoff.attempts()
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if !self.handle_offline(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    async fn replay_subscriptions(&mut self, conn: &mut dyn DepthConnection) -> Result<(), FeedError> {
        let refs: Vec<InstrumentRef> = self
            .shared
            .store
            .subscriptions()
            .iter()
            .map(|s| InstrumentRef::new(s.instrument, s.segment))
            .collect();
        for msg in subscribe_batches(&refs) {
            conn.send_control(&msg).await?;
        }
        if !refs.is_empty() {
            info!("Subscribed {} instruments to depth", refs.len());
        }

        self.budget.reset();
        self.backoff.reset();
        if let Some(outage) = self.outage.take() {
            let marker = outage.marker(Ts::now());
            for id in self.shared.store.instruments() {
                if self.shared.store.snapshot(id).is_ok() {
                    self.stale_pending.insert(id, marker);
                }
            }
            self.shared.metrics.reconnected();
            info!(
                "Depth stream restored after {} ms",
                marker.restored_at.as_millis().saturating_sub(marker.outage_started.as_millis())
            );
        }
        self.machine.transition(FeedState::Streaming);
        Ok(())
    }

    async fn stream(&mut self, conn: &mut Box<dyn DepthConnection>) -> Exit {
        let mut tick = tokio::time::interval(self.shared.config.transport.maintenance_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = conn.next_frame() => match frame {
                    Ok(Some(data)) => {
                        if let Some(reason) = self.on_message(&data) {
                            return Exit::Lost(reason);
                        }
                    }
                    Ok(None) => {
                        warn!("Depth connection closed by peer");
                        return Exit::Lost(StaleReason::ConnectionLost);
                    }
                    Err(e) => {
                        warn!("Depth connection error: {}", e);
                        return Exit::Lost(StaleReason::ConnectionLost);
                    }
                },
                cmd = self.commands.recv() => {
                    if let Some(exit) = self.handle_online(cmd, conn.as_mut()).await {
                        return exit;
                    }
                }
                _ = tick.tick() => self.maintain(Instant::now()),
            }
        }
    }

    /// Process one binary message; `Some` when the connection must be recycled
    fn on_message(&mut self, data: &[u8]) -> Option<StaleReason> {
        let now = Instant::now();
        for frame in split_frames(data) {
            self.shared.metrics.frame_received(Ts::now());
            if !self.limiter.allow() {
                self.shared.metrics.frame_rate_limited();
                continue;
            }

            match frame.and_then(decode_frame) {
                Ok(DepthFrame::Bid(packet)) => self.on_packet(Side::Bid, packet, now),
                Ok(DepthFrame::Ask(packet)) => self.on_packet(Side::Ask, packet, now),
                Ok(DepthFrame::Disconnect(notice)) => {
                    self.shared.metrics.disconnect_notice();
                    warn!("Depth server disconnect notice, reason code {}", notice.reason);
                    return Some(StaleReason::ConnectionLost);
                }
                Err(e) => {
                    self.shared.metrics.frame_malformed();
                    warn!("Dropping malformed depth frame: {}", e);
                    if self.budget.record(now) {
                        error!(
                            "More than {} malformed frames in {:?}, recycling connection",
                            self.shared.config.transport.error_budget,
                            self.shared.config.transport.error_window()
                        );
                        return Some(StaleReason::ErrorBudgetExceeded);
                    }
                }
            }
        }
        None
    }

    fn on_packet(&mut self, side: Side, packet: DepthPacket, now: Instant) {
        self.shared.metrics.frame_decoded();
        if !self.shared.store.contains(packet.instrument) {
            debug!("Ignoring depth for unsubscribed instrument {}", packet.instrument);
            return;
        }
        for paired in self.pairing.offer(side, packet, now) {
            self.emit(paired, now);
        }
    }

    /// Turn a pair into a snapshot and pass it through the throttle
    fn emit(&mut self, paired: PairedDepth, now: Instant) {
        let instrument = paired.instrument;
        let previous = self.shared.store.snapshot(instrument).ok();
        let carry = |side: Side| {
            previous
                .as_ref()
                .map_or_else(|| SideDepth::empty(side), |s| s.side(side).clone())
        };
        let bids = paired.bids.unwrap_or_else(|| carry(Side::Bid));
        let asks = paired.asks.unwrap_or_else(|| carry(Side::Ask));
        let assembled_at = Ts::now();

        let mut snapshot = Snapshot::new(
            instrument,
            paired.segment,
            bids,
            asks,
            paired.sequence,
            assembled_at,
        );
        if paired.forced {
            self.shared.metrics.forced_pairing();
            snapshot.stale = Some(StaleMarker {
                outage_started: paired.opened_at,
                restored_at: assembled_at,
                reason: StaleReason::PairingTimeout,
            });
        }
        if let Some(marker) = self.stale_pending.remove(&instrument) {
            snapshot.stale = Some(marker);
        }

        match self.throttle.offer(snapshot, now) {
            ThrottleDecision::Deliver(snapshot) => self.deliver(snapshot),
            ThrottleDecision::Deferred => self.shared.metrics.snapshot_throttled(),
        }
    }

    fn deliver(&self, snapshot: Snapshot) {
        let instrument = snapshot.instrument;
        match self.shared.store.apply(snapshot) {
            Ok(_) => self.shared.metrics.snapshot_emitted(),
            Err(e) => debug!("Discarding snapshot for {}: {}", instrument, e),
        }
    }

    fn maintain(&mut self, now: Instant) {
        for paired in self.pairing.expire(now) {
            debug!(
                "Pairing window expired for {}, emitting one-sided depth",
                paired.instrument
            );
            self.emit(paired, now);
        }
        for snapshot in self.throttle.flush(now) {
            self.deliver(snapshot);
        }

        let every = Duration::from_secs(self.shared.config.transport.metrics_interval_secs);
        if !every.is_zero() && now.saturating_duration_since(self.last_metrics_log) >= every {
            self.last_metrics_log = now;
            self.shared.metrics().log();
        }
    }

    /// Leave the stream: flush what is held, forget partial pairs and
    /// open an outage
    fn degrade(&mut self, reason: StaleReason) {
        for snapshot in self.throttle.drain() {
            self.deliver(snapshot);
        }
        self.pairing.clear();
        self.outage.get_or_insert_with(|| Outage::begin(reason));
        self.machine.transition(FeedState::Degraded);
    }

    fn register(
        &self,
        instrument: InstrumentId,
        segment: ExchangeSegment,
    ) -> Result<Registration, FeedError> {
        if !segment.supports_twenty_depth() {
            return Err(FeedError::UnsupportedSegment(segment));
        }
        let max = self.shared.config.transport.max_subscriptions;
        Ok(self.shared.store.register(instrument, segment, max)?)
    }

    /// Drop local state of an instrument, returning its segment if it was subscribed
    fn forget(&mut self, instrument: InstrumentId) -> Option<ExchangeSegment> {
        let segment = self.shared.store.segment(instrument)?;
        self.shared.store.remove(instrument);
        self.shared.cache.invalidate(instrument);
        self.pairing.remove(instrument);
        self.throttle.remove(instrument);
        self.stale_pending.remove(&instrument);
        info!("Removed depth subscription for {}", instrument);
        Some(segment)
    }

    /// Commands while no stream is up: registrations are local and get
    /// replayed on the next connection. False on shutdown.
    fn handle_offline(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Subscribe {
                instrument,
                segment,
                reply,
            }) => {
                let result = self.register(instrument, segment).map(|registration| {
                    if registration.is_new() {
                        info!(
                            "Depth subscription for {} on {} deferred until the stream is up",
                            instrument,
                            registration.subscription().segment
                        );
                    }
                });
                let _ = reply.send(result);
                true
            }
            Some(Command::Unsubscribe { instrument, reply }) => {
                self.forget(instrument);
                let _ = reply.send(Ok(()));
                true
            }
            Some(Command::Shutdown { reply }) => {
                self.clear_state();
                let _ = reply.send(());
                false
            }
            None => {
                self.clear_state();
                false
            }
        }
    }

    /// Commands while streaming; `Some` ends the stream
    async fn handle_online(
        &mut self,
        cmd: Option<Command>,
        conn: &mut dyn DepthConnection,
    ) -> Option<Exit> {
        // Every handle is gone
        let Some(cmd) = cmd else {
            return Some(Exit::Shutdown);
        };
        match cmd {
            Command::Subscribe {
                instrument,
                segment,
                reply,
            } => {
                let subscription = match self.register(instrument, segment) {
                    Ok(Registration::Added(sub)) => sub,
                    Ok(Registration::Existing(_)) => {
                        let _ = reply.send(Ok(()));
                        return None;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return None;
                    }
                };

                let msg = ControlMessage::Subscribe(vec![InstrumentRef::new(instrument, segment)]);
                match conn.send_control(&msg).await {
                    Ok(()) => {
                        info!(
                            "Subscribed depth for {} on {}",
                            subscription.instrument, subscription.segment
                        );
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => {
                        error!("Depth subscribe for {} not delivered: {}", instrument, e);
                        self.shared.store.remove(instrument);
                        let _ = reply.send(Err(rejected(e)));
                        Some(Exit::Lost(StaleReason::ConnectionLost))
                    }
                }
            }
            Command::Unsubscribe { instrument, reply } => {
                let Some(segment) = self.forget(instrument) else {
                    let _ = reply.send(Ok(()));
                    return None;
                };
                for msg in unsubscribe_batches(&[InstrumentRef::new(instrument, segment)]) {
                    if let Err(e) = conn.send_control(&msg).await {
                        warn!("Depth unsubscribe for {} not delivered: {}", instrument, e);
                        let _ = reply.send(Err(rejected(e)));
                        return Some(Exit::Lost(StaleReason::ConnectionLost));
                    }
                }
                let _ = reply.send(Ok(()));
                None
            }
            Command::Shutdown { reply } => {
                self.teardown(Some(conn)).await;
                let _ = reply.send(());
                Some(Exit::Shutdown)
            }
        }
    }

    /// Disconnect politely, then drop every subscription
    async fn teardown(&mut self, conn: Option<&mut dyn DepthConnection>) {
        if self.machine.current() == FeedState::Disconnected {
            return;
        }
        if let Some(conn) = conn {
            let refs: Vec<InstrumentRef> = self
                .shared
                .store
                .subscriptions()
                .iter()
                .map(|s| InstrumentRef::new(s.instrument, s.segment))
                .collect();
            for msg in unsubscribe_batches(&refs) {
                if let Err(e) = conn.send_control(&msg).await {
                    warn!("Depth unsubscribe on shutdown not delivered: {}", e);
                    break;
                }
            }
            if let Err(e) = conn.send_control(&ControlMessage::Disconnect).await {
                warn!("Depth disconnect request not delivered: {}", e);
            }
            if let Err(e) = conn.close().await {
                debug!("Closing depth connection: {}", e);
            }
        }
        self.clear_state();
    }

    fn clear_state(&mut self) {
        self.shared.store.clear();
        self.shared.cache.clear();
        self.pairing.clear();
        self.throttle.drain();
        self.stale_pending.clear();
        self.outage = None;
        self.shared.metrics().log();
        self.machine.transition(FeedState::Disconnected);
    }
}
