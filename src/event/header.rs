//! Fixed event header layout.
//!
//! Every framed event is `header || payload`. The header is 19 bytes,
//! little-endian:
//!
//! ```text
//! offset 0   timestamp    u32  seconds since the epoch
//! offset 4   type         u8
//! offset 5   server_id    u32
//! offset 9   event_len    u32  total length, header included
//! offset 13  end_log_pos  u32  offset of the byte after this event
//! offset 17  flags        u16
//! ```
//!
//! A log file starts with a 4-byte magic, then a format-description
//! event whose flags carry the in-use bit while the file is the active
//! log.

use std::io;

/// First four bytes of every log file.
pub const LOG_MAGIC: [u8; 4] = [0xFE, 0x62, 0x69, 0x6E];

/// Size of the fixed event header.
pub const EVENT_HEADER_LEN: usize = 19;

/// Byte offset of `event_len` within the header.
pub const EVENT_LEN_OFFSET: usize = 9;

/// Byte offset of `end_log_pos` within the header.
pub const END_POS_OFFSET: usize = 13;

/// Byte offset of `flags` within the header.
pub const FLAGS_OFFSET: usize = 17;

/// Flag bit set on the format-description event of the active log file,
/// cleared by a positional write at clean close and by recovery.
pub const FLAG_IN_USE: u16 = 0x0001;

/// Event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// SQL statement text plus metadata. The core itself only matches
    /// the literal BEGIN and COMMIT strings during recovery framing.
    Query = 2,
    /// Clean shutdown marker, last event of a cleanly closed log.
    Stop = 3,
    /// Names the successor file; last event before a rotation.
    Rotate = 4,
    /// First event after the magic: version and creation time.
    FormatDescription = 15,
    /// Two-phase-commit marker carrying the 8-byte transaction id.
    Xid = 16,
    /// Row images accumulated by a session; payload is opaque here.
    Rows = 23,
    /// Out-of-band marker that changes were lost; replicas halt.
    Incident = 26,
}

impl EventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(EventType::Query),
            3 => Some(EventType::Stop),
            4 => Some(EventType::Rotate),
            15 => Some(EventType::FormatDescription),
            16 => Some(EventType::Xid),
            23 => Some(EventType::Rows),
            26 => Some(EventType::Incident),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    /// Total event length, header included.
    pub event_len: u32,
    /// Absolute offset of the byte following this event in the log
    /// file. While an event sits in a session cache this is relative to
    /// the start of the transaction group instead.
    pub end_log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn encode(&self) -> [u8; EVENT_HEADER_LEN] {
        let mut buf = [0u8; EVENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[4] = self.event_type.as_u8();
        buf[5..9].copy_from_slice(&self.server_id.to_le_bytes());
        buf[9..13].copy_from_slice(&self.event_len.to_le_bytes());
        buf[13..17].copy_from_slice(&self.end_log_pos.to_le_bytes());
        buf[17..19].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; EVENT_HEADER_LEN]) -> io::Result<Self> {
        let raw_type = buf[4];
        let event_type = EventType::from_u8(raw_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown event type {}", raw_type),
            )
        })?;

        let event_len = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        if (event_len as usize) < EVENT_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("event length {} shorter than header", event_len),
            ));
        }

        Ok(Self {
            timestamp: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            event_type,
            server_id: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
            event_len,
            end_log_pos: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[17..19].try_into().unwrap()),
        })
    }

    /// Payload length implied by `event_len`.
    pub fn payload_len(&self) -> usize {
        self.event_len as usize - EVENT_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> EventHeader {
        EventHeader {
            timestamp: 1_700_000_000,
            event_type: EventType::Query,
            server_id: 3,
            event_len: 42,
            end_log_pos: 1234,
            flags: 0,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let header = sample_header();
        let decoded = EventHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_field_offsets() {
        let header = sample_header();
        let buf = header.encode();

        assert_eq!(
            u32::from_le_bytes(buf[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4].try_into().unwrap()),
            42
        );
        assert_eq!(
            u32::from_le_bytes(buf[END_POS_OFFSET..END_POS_OFFSET + 4].try_into().unwrap()),
            1234
        );
        assert_eq!(buf[4], EventType::Query.as_u8());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = sample_header().encode();
        buf[4] = 0xEE;
        assert!(EventHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_short_event_len() {
        let mut buf = sample_header().encode();
        buf[9..13].copy_from_slice(&5u32.to_le_bytes());
        assert!(EventHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_in_use_flag_is_low_byte_bit_zero() {
        let mut header = sample_header();
        header.flags = FLAG_IN_USE;
        let buf = header.encode();
        assert_eq!(buf[FLAGS_OFFSET], 0x01);
        assert_eq!(buf[FLAGS_OFFSET + 1], 0x00);
    }
}
