//! Framed log events.
//!
//! The core treats payloads as opaque bytes past the fixed header; the
//! constructors here produce the handful of event kinds the log itself
//! emits, and the decoders in [`payload`] are used by recovery and by
//! readers.

pub mod copy;
pub mod header;
pub mod payload;
pub mod reader;

use std::time::{SystemTime, UNIX_EPOCH};

pub use header::{
    EventHeader, EventType, EVENT_HEADER_LEN, EVENT_LEN_OFFSET, END_POS_OFFSET, FLAGS_OFFSET,
    FLAG_IN_USE, LOG_MAGIC,
};

/// Current wall-clock time as the header timestamp.
pub(crate) fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// One framed event: fixed header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Vec<u8>,
}

impl Event {
    /// Build an event of `event_type` around an already-encoded payload.
    pub fn with_payload(event_type: EventType, server_id: u32, payload: Vec<u8>) -> Self {
        let event_len = (EVENT_HEADER_LEN + payload.len()) as u32;
        Self {
            header: EventHeader {
                timestamp: now_unix(),
                event_type,
                server_id,
                event_len,
                end_log_pos: 0,
                flags: 0,
            },
            payload,
        }
    }

    pub fn format_description(server_id: u32, server_version: &str) -> Self {
        let body = payload::FormatDescription::new(server_version, now_unix());
        Self::with_payload(EventType::FormatDescription, server_id, body.encode())
    }

    pub fn query(server_id: u32, thread_id: u32, db: &str, sql: &str) -> Self {
        let body = payload::Query {
            thread_id,
            db: db.to_string(),
            query: sql.to_string(),
        };
        Self::with_payload(EventType::Query, server_id, body.encode())
    }

    pub fn xid(server_id: u32, xid: u64) -> Self {
        Self::with_payload(EventType::Xid, server_id, payload::encode_xid(xid))
    }

    pub fn rotate(server_id: u32, next_file: &str) -> Self {
        let body = payload::Rotate {
            // Readers resume after the magic of the successor file.
            position: LOG_MAGIC.len() as u64,
            next_file: next_file.to_string(),
        };
        Self::with_payload(EventType::Rotate, server_id, body.encode())
    }

    pub fn stop(server_id: u32) -> Self {
        Self::with_payload(EventType::Stop, server_id, Vec::new())
    }

    pub fn incident(server_id: u32, message: &str) -> Self {
        let body = payload::Incident::lost_events(message);
        Self::with_payload(EventType::Incident, server_id, body.encode())
    }

    /// Total serialized length.
    pub fn len(&self) -> u64 {
        self.header.event_len as u64
    }

    /// Serialize with `end_log_pos` stamped as `base + len`, i.e. the
    /// offset of the byte following this event relative to `base` zero.
    pub fn to_bytes_at(&self, base: u64) -> Vec<u8> {
        let mut header = self.header;
        header.end_log_pos = (base + self.len()) as u32;
        let mut buf = Vec::with_capacity(self.header.event_len as usize);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}
