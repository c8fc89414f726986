//! Payload layouts for the event types the core itself produces and
//! inspects. Row payloads are opaque and have no decoder here.

use std::io;

fn short_payload(kind: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{} payload too short", kind),
    )
}

/// Version of the on-disk event format.
pub const FORMAT_VERSION: u16 = 4;

/// Length of the fixed server-version field in the format description.
pub const SERVER_VERSION_LEN: usize = 50;

/// Format-description payload: format version, padded server version
/// string, creation time, header length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub format_version: u16,
    pub server_version: String,
    pub created: u32,
    pub header_len: u8,
}

impl FormatDescription {
    pub fn new(server_version: &str, created: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            server_version: server_version.to_string(),
            created,
            header_len: super::header::EVENT_HEADER_LEN as u8,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + SERVER_VERSION_LEN + 4 + 1);
        buf.extend_from_slice(&self.format_version.to_le_bytes());

        let mut version = [0u8; SERVER_VERSION_LEN];
        let bytes = self.server_version.as_bytes();
        let n = bytes.len().min(SERVER_VERSION_LEN - 1);
        version[..n].copy_from_slice(&bytes[..n]);
        buf.extend_from_slice(&version);

        buf.extend_from_slice(&self.created.to_le_bytes());
        buf.push(self.header_len);
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 2 + SERVER_VERSION_LEN + 4 + 1 {
            return Err(short_payload("format description"));
        }
        let format_version = u16::from_le_bytes(data[0..2].try_into().unwrap());
        let raw = &data[2..2 + SERVER_VERSION_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(SERVER_VERSION_LEN);
        let server_version = String::from_utf8_lossy(&raw[..end]).into_owned();
        let base = 2 + SERVER_VERSION_LEN;
        let created = u32::from_le_bytes(data[base..base + 4].try_into().unwrap());
        let header_len = data[base + 4];
        Ok(Self {
            format_version,
            server_version,
            created,
            header_len,
        })
    }
}

/// Query payload: issuing thread, default database, statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub thread_id: u32,
    pub db: String,
    pub query: String,
}

impl Query {
    pub fn encode(&self) -> Vec<u8> {
        let db = self.db.as_bytes();
        debug_assert!(db.len() <= u8::MAX as usize);
        let mut buf = Vec::with_capacity(4 + 1 + db.len() + self.query.len());
        buf.extend_from_slice(&self.thread_id.to_le_bytes());
        buf.push(db.len() as u8);
        buf.extend_from_slice(db);
        buf.extend_from_slice(self.query.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(short_payload("query"));
        }
        let thread_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let db_len = data[4] as usize;
        if data.len() < 5 + db_len {
            return Err(short_payload("query"));
        }
        let db = String::from_utf8_lossy(&data[5..5 + db_len]).into_owned();
        let query = String::from_utf8_lossy(&data[5 + db_len..]).into_owned();
        Ok(Self {
            thread_id,
            db,
            query,
        })
    }
}

/// Xid payload: the 8-byte transaction id.
pub fn encode_xid(xid: u64) -> Vec<u8> {
    xid.to_le_bytes().to_vec()
}

pub fn decode_xid(data: &[u8]) -> io::Result<u64> {
    if data.len() < 8 {
        return Err(short_payload("xid"));
    }
    Ok(u64::from_le_bytes(data[0..8].try_into().unwrap()))
}

/// Rotate payload: resume position in the successor file, then its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotate {
    pub position: u64,
    pub next_file: String,
}

impl Rotate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.next_file.len());
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(self.next_file.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 8 {
            return Err(short_payload("rotate"));
        }
        let position = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let next_file = String::from_utf8_lossy(&data[8..]).into_owned();
        Ok(Self {
            position,
            next_file,
        })
    }
}

/// Incident codes. Only lost-events exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IncidentKind {
    LostEvents = 1,
}

/// Incident payload: code plus a short human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub code: u16,
    pub message: String,
}

impl Incident {
    pub fn lost_events(message: &str) -> Self {
        Self {
            code: IncidentKind::LostEvents as u16,
            message: message.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let msg = self.message.as_bytes();
        debug_assert!(msg.len() <= u8::MAX as usize);
        let mut buf = Vec::with_capacity(2 + 1 + msg.len());
        buf.extend_from_slice(&self.code.to_le_bytes());
        buf.push(msg.len() as u8);
        buf.extend_from_slice(msg);
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 3 {
            return Err(short_payload("incident"));
        }
        let code = u16::from_le_bytes(data[0..2].try_into().unwrap());
        let msg_len = data[2] as usize;
        if data.len() < 3 + msg_len {
            return Err(short_payload("incident"));
        }
        let message = String::from_utf8_lossy(&data[3..3 + msg_len]).into_owned();
        Ok(Self { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_description_round_trip() {
        let fde = FormatDescription::new("replog-0.3.0", 1_700_000_000);
        let decoded = FormatDescription::decode(&fde.encode()).unwrap();
        assert_eq!(decoded, fde);
        assert_eq!(decoded.header_len as usize, super::super::header::EVENT_HEADER_LEN);
    }

    #[test]
    fn test_format_description_truncates_long_version() {
        let long = "x".repeat(80);
        let fde = FormatDescription::new(&long, 0);
        let decoded = FormatDescription::decode(&fde.encode()).unwrap();
        assert_eq!(decoded.server_version.len(), SERVER_VERSION_LEN - 1);
    }

    #[test]
    fn test_query_round_trip() {
        let query = Query {
            thread_id: 9,
            db: "shop".into(),
            query: "BEGIN".into(),
        };
        assert_eq!(Query::decode(&query.encode()).unwrap(), query);
    }

    #[test]
    fn test_query_empty_db() {
        let query = Query {
            thread_id: 1,
            db: String::new(),
            query: "COMMIT".into(),
        };
        assert_eq!(Query::decode(&query.encode()).unwrap(), query);
    }

    #[test]
    fn test_xid_round_trip() {
        assert_eq!(decode_xid(&encode_xid(0xDEAD_BEEF_CAFE)).unwrap(), 0xDEAD_BEEF_CAFE);
    }

    #[test]
    fn test_rotate_round_trip() {
        let rotate = Rotate {
            position: 4,
            next_file: "log.000002".into(),
        };
        assert_eq!(Rotate::decode(&rotate.encode()).unwrap(), rotate);
    }

    #[test]
    fn test_incident_round_trip() {
        let incident = Incident::lost_events("error writing to the log");
        assert_eq!(Incident::decode(&incident.encode()).unwrap(), incident);
    }

    #[test]
    fn test_short_payloads_rejected() {
        assert!(FormatDescription::decode(&[0; 10]).is_err());
        assert!(Query::decode(&[0; 3]).is_err());
        assert!(decode_xid(&[0; 4]).is_err());
        assert!(Rotate::decode(&[0; 2]).is_err());
        assert!(Incident::decode(&[0; 1]).is_err());
    }
}
