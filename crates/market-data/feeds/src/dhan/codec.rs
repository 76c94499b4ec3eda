//! Binary codec for Dhan twenty-level depth frames
//!
//! Layout (version [`WIRE_VERSION`]), all integers big-endian:
//!
//! ```text
//! header (12 bytes)
//!   0..2   u16  frame length in bytes, header included
//!   2      u8   response code: 41 bid, 51 ask, 50 disconnect
//!   3      u8   exchange segment code
//!   4..8   u32  security id
//!   8..12  u32  message sequence
//! depth body: N x 16 byte levels, N <= 20
//!   0..8   f64  price
//!   8..12  u32  quantity
//!   12..16 u32  order count
//! disconnect body: u16 reason code
//! ```

use byteorder::{BigEndian, ByteOrder};
use common::{DEPTH_LEVELS, DepthLevel, ExchangeSegment, InstrumentId, Px, Side, SideDepth};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the byte layout above
pub const WIRE_VERSION: u8 = 1;
/// Header size
pub const HEADER_LEN: usize = 12;
/// Size of one depth level
pub const LEVEL_LEN: usize = 16;
/// Size of a disconnect frame
pub const DISCONNECT_LEN: usize = HEADER_LEN + 2;
/// Largest valid depth frame
pub const MAX_FRAME_LEN: usize = HEADER_LEN + DEPTH_LEVELS * LEVEL_LEN;

/// Response code of a bid depth packet
pub const BID_CODE: u8 = 41;
/// Response code of a feed disconnect notice
pub const DISCONNECT_CODE: u8 = 50;
/// Response code of an ask depth packet
pub const ASK_CODE: u8 = 51;

/// Frame rejected by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the structure needs
    #[error("frame too short: need {needed} bytes, got {actual}")]
    TooShort {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared length disagrees with the bytes present
    #[error("declared length {declared} does not match {actual} bytes")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Length observed
        actual: usize,
    },

    /// Depth body is not a whole number of levels
    #[error("depth body of {body} bytes is not a multiple of {LEVEL_LEN}")]
    UnalignedBody {
        /// Body size in bytes
        body: usize,
    },

    /// More than twenty levels in one packet
    #[error("{levels} levels exceed the depth of {DEPTH_LEVELS}")]
    TooManyLevels {
        /// Levels carried
        levels: usize,
    },

    /// Response code outside 41/50/51
    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),

    /// Segment code with no known segment
    #[error("unknown exchange segment code {0}")]
    UnknownSegment(u8),

    /// NaN or infinite price
    #[error("non-finite price at level {level}")]
    NonFinitePrice {
        /// Level index within the packet
        level: usize,
    },

    /// Negative price, or one too large to hold exactly in ticks
    #[error("price out of range at level {level}")]
    PriceOutOfRange {
        /// Level index within the packet
        level: usize,
    },
}

/// One side of depth for one instrument, as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthPacket {
    /// Security id
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
    /// Feed sequence number
    pub sequence: u32,
    /// Levels in wire order (zero-filled slots included)
    pub levels: Vec<DepthLevel>,
}

impl DepthPacket {
    /// Normalised side view: empty slots dropped, best first, zero-filled
    #[must_use]
    pub fn side_depth(&self, side: Side) -> SideDepth {
        SideDepth::from_levels(side, &self.levels)
    }
}

/// Server notice that the feed is closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    /// Security id field of the header (usually 0)
    pub instrument: InstrumentId,
    /// Raw segment code from the header
    pub segment_code: u8,
    /// Sequence field of the header
    pub sequence: u32,
    /// Vendor reason code
    pub reason: u16,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "frame")]
pub enum DepthFrame {
    /// Bid side packet
    Bid(DepthPacket),
    /// Ask side packet
    Ask(DepthPacket),
    /// Feed disconnect notice
    Disconnect(DisconnectNotice),
}

impl DepthFrame {
    /// Book side for depth packets
    #[must_use]
    pub const fn side(&self) -> Option<Side> {
        match self {
            Self::Bid(_) => Some(Side::Bid),
            Self::Ask(_) => Some(Side::Ask),
            Self::Disconnect(_) => None,
        }
    }
}

/// Decode exactly one frame.
///
/// # Errors
/// Any structural problem yields a [`DecodeError`]; nothing is returned
/// partially.
pub fn decode_frame(buf: &[u8]) -> Result<DepthFrame, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::TooShort {
            needed: HEADER_LEN,
            actual: buf.len(),
        });
    }

    let declared = usize::from(BigEndian::read_u16(&buf[0..2]));
    if declared != buf.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let code = buf[2];
    let segment_code = buf[3];
    let instrument = BigEndian::read_u32(&buf[4..8]);
    let sequence = BigEndian::read_u32(&buf[8..12]);

    match code {
        BID_CODE | ASK_CODE => {
            let segment = ExchangeSegment::from_code(segment_code)
                .ok_or(DecodeError::UnknownSegment(segment_code))?;
            let levels = decode_levels(&buf[HEADER_LEN..])?;
            let packet = DepthPacket {
                instrument,
                segment,
                sequence,
                levels,
            };
            Ok(if code == BID_CODE {
                DepthFrame::Bid(packet)
            } else {
                DepthFrame::Ask(packet)
            })
        }
        DISCONNECT_CODE => {
            if buf.len() != DISCONNECT_LEN {
                return Err(DecodeError::LengthMismatch {
                    declared: DISCONNECT_LEN,
                    actual: buf.len(),
                });
            }
            Ok(DepthFrame::Disconnect(DisconnectNotice {
                instrument,
                segment_code,
                sequence,
                reason: BigEndian::read_u16(&buf[HEADER_LEN..DISCONNECT_LEN]),
            }))
        }
        other => Err(DecodeError::UnknownResponseCode(other)),
    }
}

fn decode_levels(body: &[u8]) -> Result<Vec<DepthLevel>, DecodeError> {
    if body.len() % LEVEL_LEN != 0 {
        return Err(DecodeError::UnalignedBody { body: body.len() });
    }
    let count = body.len() / LEVEL_LEN;
    if count > DEPTH_LEVELS {
        return Err(DecodeError::TooManyLevels { levels: count });
    }

    body.chunks_exact(LEVEL_LEN)
        .enumerate()
        .map(|(level, chunk)| {
            let price = BigEndian::read_f64(&chunk[0..8]);
            if !price.is_finite() {
                return Err(DecodeError::NonFinitePrice { level });
            }
            let price = Px::try_new(price).ok_or(DecodeError::PriceOutOfRange { level })?;
            Ok(DepthLevel::new(
                price,
                BigEndian::read_u32(&chunk[8..12]),
                BigEndian::read_u32(&chunk[12..16]),
            ))
        })
        .collect()
}

fn write_header(buf: &mut [u8], code: u8, segment_code: u8, instrument: u32, sequence: u32) {
    // Callers size the buffer from MAX_FRAME_LEN at most, which fits u16
    #[allow(clippy::cast_possible_truncation)]
    let length = buf.len() as u16;
    BigEndian::write_u16(&mut buf[0..2], length);
    buf[2] = code;
    buf[3] = segment_code;
    BigEndian::write_u32(&mut buf[4..8], instrument);
    BigEndian::write_u32(&mut buf[8..12], sequence);
}

/// Encode a depth packet for `side`.
///
/// # Errors
/// [`DecodeError::TooManyLevels`] when the packet carries more than twenty
/// levels.
pub fn encode_packet(side: Side, packet: &DepthPacket) -> Result<Vec<u8>, DecodeError> {
    if packet.levels.len() > DEPTH_LEVELS {
        return Err(DecodeError::TooManyLevels {
            levels: packet.levels.len(),
        });
    }

    let mut buf = vec![0_u8; HEADER_LEN + packet.levels.len() * LEVEL_LEN];
    let code = match side {
        Side::Bid => BID_CODE,
        Side::Ask => ASK_CODE,
    };
    write_header(
        &mut buf,
        code,
        packet.segment.code(),
        packet.instrument,
        packet.sequence,
    );

    for (chunk, level) in buf[HEADER_LEN..]
        .chunks_exact_mut(LEVEL_LEN)
        .zip(&packet.levels)
    {
        BigEndian::write_f64(&mut chunk[0..8], level.price.as_f64());
        BigEndian::write_u32(&mut chunk[8..12], level.quantity);
        BigEndian::write_u32(&mut chunk[12..16], level.orders);
    }
    Ok(buf)
}

/// Encode a disconnect notice
#[must_use]
pub fn encode_disconnect(notice: &DisconnectNotice) -> Vec<u8> {
    let mut buf = vec![0_u8; DISCONNECT_LEN];
    write_header(
        &mut buf,
        DISCONNECT_CODE,
        notice.segment_code,
        notice.instrument,
        notice.sequence,
    );
    BigEndian::write_u16(&mut buf[HEADER_LEN..DISCONNECT_LEN], notice.reason);
    buf
}

/// Iterator over length-prefixed frames packed back to back
pub struct FrameIter<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let rest = &self.buf[self.offset..];
        if rest.len() < 2 {
            self.failed = true;
            return Some(Err(DecodeError::TooShort {
                needed: 2,
                actual: rest.len(),
            }));
        }

        let declared = usize::from(BigEndian::read_u16(&rest[0..2]));
        if declared < HEADER_LEN {
            self.failed = true;
            return Some(Err(DecodeError::TooShort {
                needed: HEADER_LEN,
                actual: declared,
            }));
        }
        if declared > rest.len() {
            self.failed = true;
            return Some(Err(DecodeError::LengthMismatch {
                declared,
                actual: rest.len(),
            }));
        }

        self.offset += declared;
        Some(Ok(&rest[..declared]))
    }
}

/// Split a message holding one or more frames.
///
/// A truncated or corrupt tail yields a single error and ends iteration.
#[must_use]
pub const fn split_frames(buf: &[u8]) -> FrameIter<'_> {
    FrameIter {
        buf,
        offset: 0,
        failed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn packet(levels: usize) -> DepthPacket {
        DepthPacket {
            instrument: 1333,
            segment: ExchangeSegment::NseEq,
            sequence: 42,
            levels: (0..levels)
                .map(|i| {
                    #[allow(clippy::cast_precision_loss)]
                    let price = 1500.0 - 0.05 * i as f64;
                    DepthLevel::new(Px::new(price), 100 + u32::try_from(i).unwrap_or(0), 3)
                })
                .collect(),
        }
    }

    #[test]
    fn test_round_trip_bid_and_ask() -> Result<(), DecodeError> {
        let bid = packet(20);
        let bytes = encode_packet(Side::Bid, &bid)?;
        assert_eq!(bytes.len(), MAX_FRAME_LEN);
        assert_eq!(decode_frame(&bytes)?, DepthFrame::Bid(bid.clone()));

        let ask_bytes = encode_packet(Side::Ask, &bid)?;
        assert_eq!(decode_frame(&ask_bytes)?, DepthFrame::Ask(bid));
        Ok(())
    }

    #[test]
    fn test_header_layout() -> Result<(), DecodeError> {
        let bytes = encode_packet(Side::Ask, &packet(1))?;
        assert_eq!(&bytes[0..2], &[0, 28]);
        assert_eq!(bytes[2], ASK_CODE);
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[4..8], &1333_u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &42_u32.to_be_bytes());
        assert_eq!(&bytes[12..20], &1500.0_f64.to_be_bytes());
        Ok(())
    }

    #[test]
    fn test_empty_depth_is_valid() -> Result<(), DecodeError> {
        let bytes = encode_packet(Side::Bid, &packet(0))?;
        assert_eq!(bytes.len(), HEADER_LEN);
        match decode_frame(&bytes)? {
            DepthFrame::Bid(p) => assert!(p.levels.is_empty()),
            other => panic!("unexpected frame {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_disconnect_round_trip() -> Result<(), DecodeError> {
        let notice = DisconnectNotice {
            instrument: 0,
            segment_code: 0,
            sequence: 0,
            reason: 807,
        };
        let bytes = encode_disconnect(&notice);
        assert_eq!(bytes.len(), DISCONNECT_LEN);
        assert_eq!(decode_frame(&bytes)?, DepthFrame::Disconnect(notice));
        Ok(())
    }

    #[test]
    fn test_rejects_short_frame() {
        assert_eq!(
            decode_frame(&[0, 12, 41]),
            Err(DecodeError::TooShort {
                needed: HEADER_LEN,
                actual: 3
            })
        );
    }

    #[test]
    fn test_rejects_length_mismatch() -> Result<(), DecodeError> {
        let mut bytes = encode_packet(Side::Bid, &packet(2))?;
        bytes.pop();
        assert_eq!(
            decode_frame(&bytes),
            Err(DecodeError::LengthMismatch {
                declared: 44,
                actual: 43
            })
        );
        Ok(())
    }

    #[test]
    fn test_rejects_unaligned_body() -> Result<(), DecodeError> {
        let mut bytes = encode_packet(Side::Bid, &packet(1))?;
        bytes.truncate(20);
        BigEndian::write_u16(&mut bytes[0..2], 20);
        assert_eq!(decode_frame(&bytes), Err(DecodeError::UnalignedBody { body: 8 }));
        Ok(())
    }

    #[test]
    fn test_rejects_too_many_levels() {
        let mut bytes = vec![0_u8; HEADER_LEN + 21 * LEVEL_LEN];
        write_header(&mut bytes, BID_CODE, 1, 1, 1);
        assert_eq!(
            decode_frame(&bytes),
            Err(DecodeError::TooManyLevels { levels: 21 })
        );
        assert_eq!(
            encode_packet(Side::Bid, &packet(21)),
            Err(DecodeError::TooManyLevels { levels: 21 })
        );
    }

    #[test]
    fn test_rejects_unknown_codes() -> Result<(), DecodeError> {
        let mut bytes = encode_packet(Side::Bid, &packet(1))?;
        bytes[2] = 99;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::UnknownResponseCode(99)));

        bytes[2] = BID_CODE;
        bytes[3] = 0;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::UnknownSegment(0)));
        Ok(())
    }

    #[test]
    fn test_rejects_nan_price() -> Result<(), DecodeError> {
        let mut bytes = encode_packet(Side::Ask, &packet(2))?;
        BigEndian::write_f64(&mut bytes[28..36], f64::NAN);
        assert_eq!(decode_frame(&bytes), Err(DecodeError::NonFinitePrice { level: 1 }));
        Ok(())
    }

    #[test]
    fn test_rejects_out_of_range_prices() -> Result<(), DecodeError> {
        for (price, level) in [(1e300, 0), (-1e300, 1), (-0.05, 1), (Px::MAX_PRICE, 0)] {
            let mut bytes = encode_packet(Side::Bid, &packet(2))?;
            let at = HEADER_LEN + level * LEVEL_LEN;
            BigEndian::write_f64(&mut bytes[at..at + 8], price);
            assert_eq!(decode_frame(&bytes), Err(DecodeError::PriceOutOfRange { level }));
        }
        Ok(())
    }

    #[test]
    fn test_split_frames_walks_concatenated_frames() -> Result<(), DecodeError> {
        let mut buf = encode_packet(Side::Bid, &packet(3))?;
        buf.extend(encode_packet(Side::Ask, &packet(5))?);
        let frames: Vec<&[u8]> = split_frames(&buf).collect::<Result<_, _>>()?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), HEADER_LEN + 3 * LEVEL_LEN);
        assert_eq!(frames[1].len(), HEADER_LEN + 5 * LEVEL_LEN);
        Ok(())
    }

    #[test]
    fn test_split_frames_stops_at_truncated_tail() -> Result<(), DecodeError> {
        let mut buf = encode_packet(Side::Bid, &packet(1))?;
        let second = encode_packet(Side::Ask, &packet(1))?;
        buf.extend(&second[..10]);

        let items: Vec<Result<&[u8], DecodeError>> = split_frames(&buf).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1],
            Err(DecodeError::LengthMismatch {
                declared: 28,
                actual: 10
            })
        );
        Ok(())
    }

    #[test]
    fn test_side_depth_normalises_wire_levels() {
        let mut p = packet(3);
        p.levels.push(DepthLevel::EMPTY);
        p.levels.reverse();
        let side = p.side_depth(Side::Bid);
        assert_eq!(side.non_empty_count(), 3);
        assert_eq!(side.best().map(|l| l.price), Some(Px::new(1500.0)));
    }
}
