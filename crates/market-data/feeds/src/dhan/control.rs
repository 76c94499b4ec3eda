//! JSON control messages sent to the depth server

use common::{ExchangeSegment, InstrumentId};
use serde::Serialize;

/// Request code for a twenty-depth subscription
pub const SUBSCRIBE_CODE: u8 = 23;
/// Request code for dropping a twenty-depth subscription
pub const UNSUBSCRIBE_CODE: u8 = 25;
/// Request code for closing the feed
pub const DISCONNECT_CODE: u8 = 12;
/// Instruments per subscribe/unsubscribe message
pub const MAX_BATCH: usize = 50;

/// Instrument reference in a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentRef {
    /// Security id
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
}

impl InstrumentRef {
    /// Create a reference
    #[must_use]
    pub const fn new(instrument: InstrumentId, segment: ExchangeSegment) -> Self {
        Self {
            instrument,
            segment,
        }
    }
}

/// Control message to the depth server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Start depth for these instruments
    Subscribe(Vec<InstrumentRef>),
    /// Stop depth for these instruments
    Unsubscribe(Vec<InstrumentRef>),
    /// Close the feed
    Disconnect,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireInstrument {
    exchange_segment: ExchangeSegment,
    security_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireRequest {
    request_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    instrument_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instrument_list: Option<Vec<WireInstrument>>,
}

impl ControlMessage {
    /// Vendor request code
    #[must_use]
    pub const fn request_code(&self) -> u8 {
        match self {
            Self::Subscribe(_) => SUBSCRIBE_CODE,
            Self::Unsubscribe(_) => UNSUBSCRIBE_CODE,
            Self::Disconnect => DISCONNECT_CODE,
        }
    }

    /// Instruments carried
    #[must_use]
    pub fn instruments(&self) -> &[InstrumentRef] {
        match self {
            Self::Subscribe(list) | Self::Unsubscribe(list) => list,
            Self::Disconnect => &[],
        }
    }

    /// Serialise to the JSON text frame
    ///
    /// # Errors
    /// Propagates serializer failures
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let list = match self {
            Self::Subscribe(list) | Self::Unsubscribe(list) => Some(list),
            Self::Disconnect => None,
        };
        let request = WireRequest {
            request_code: self.request_code(),
            instrument_count: list.map(Vec::len),
            instrument_list: list.map(|l| {
                l.iter()
                    .map(|r| WireInstrument {
                        exchange_segment: r.segment,
                        security_id: r.instrument.to_string(),
                    })
                    .collect()
            }),
        };
        serde_json::to_string(&request)
    }
}

fn batches(refs: &[InstrumentRef], make: fn(Vec<InstrumentRef>) -> ControlMessage) -> Vec<ControlMessage> {
    refs.chunks(MAX_BATCH).map(|c| make(c.to_vec())).collect()
}

/// Subscribe messages of at most [`MAX_BATCH`] instruments each
#[must_use]
pub fn subscribe_batches(refs: &[InstrumentRef]) -> Vec<ControlMessage> {
    batches(refs, ControlMessage::Subscribe)
}

/// Unsubscribe messages of at most [`MAX_BATCH`] instruments each
#[must_use]
pub fn unsubscribe_batches(refs: &[InstrumentRef]) -> Vec<ControlMessage> {
    batches(refs, ControlMessage::Unsubscribe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_subscribe_json_shape() -> Result<(), serde_json::Error> {
        let msg = ControlMessage::Subscribe(vec![
            InstrumentRef::new(1333, ExchangeSegment::NseEq),
            InstrumentRef::new(52175, ExchangeSegment::NseFno),
        ]);
        let value: Value = serde_json::from_str(&msg.to_json()?)?;
        assert_eq!(
            value,
            json!({
                "RequestCode": 23,
                "InstrumentCount": 2,
                "InstrumentList": [
                    {"ExchangeSegment": "NSE_EQ", "SecurityId": "1333"},
                    {"ExchangeSegment": "NSE_FNO", "SecurityId": "52175"}
                ]
            })
        );
        Ok(())
    }

    #[test]
    fn test_unsubscribe_and_disconnect_codes() -> Result<(), serde_json::Error> {
        let unsub = ControlMessage::Unsubscribe(vec![InstrumentRef::new(1, ExchangeSegment::NseEq)]);
        let value: Value = serde_json::from_str(&unsub.to_json()?)?;
        assert_eq!(value["RequestCode"], 25);

        let value: Value = serde_json::from_str(&ControlMessage::Disconnect.to_json()?)?;
        assert_eq!(value, json!({"RequestCode": 12}));
        Ok(())
    }

    #[test]
    fn test_batches_split_at_fifty() {
        let refs: Vec<InstrumentRef> = (0..120)
            .map(|i| InstrumentRef::new(i, ExchangeSegment::NseFno))
            .collect();
        let msgs = subscribe_batches(&refs);
        let sizes: Vec<usize> = msgs.iter().map(|m| m.instruments().len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert!(subscribe_batches(&[]).is_empty());
        assert_eq!(unsubscribe_batches(&refs[..3])[0].request_code(), UNSUBSCRIBE_CODE);
    }

    #[test]
    fn test_unsubscribe_batch_json() -> Result<(), serde_json::Error> {
        let refs = [InstrumentRef::new(1333, ExchangeSegment::NseEq)];
        let msgs = unsubscribe_batches(&refs);
        assert_eq!(msgs.len(), 1);
        let value: Value = serde_json::from_str(&msgs[0].to_json()?)?;
        assert_eq!(
            value,
            json!({
                "RequestCode": 25,
                "InstrumentCount": 1,
                "InstrumentList": [{"ExchangeSegment": "NSE_EQ", "SecurityId": "1333"}]
            })
        );
        Ok(())
    }
}
