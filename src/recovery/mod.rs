//! Startup recovery.
//!
//! Only the newest indexed log file can hold unresolved transactions:
//! rotation waits for every prepared XID to be acknowledged before it
//! switches files, so recovery scans exactly one file. If that file's
//! format description still carries the in-use flag the server died
//! with the log open; the scan then collects prepared XIDs, finds the
//! last offset not inside an unfinished transaction, hands the XID set
//! to the engines, and trims the tail.

use std::fs::OpenOptions;
use std::io;

use thiserror::Error;

use crate::engine::{EngineError, EngineRecovery, EngineRegistry, XidSet};
use crate::event::payload::{self, Query};
use crate::event::reader::EventReader;
use crate::event::{EventType, FLAG_IN_USE};
use crate::log::index::LogIndex;
use crate::log::writer::LogWriter;
use crate::observability::Logger;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Recovery failures abort startup; the log is left exactly as found
/// apart from any trim already proven safe.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery: the log index is unreadable: {0}")]
    Index(String),

    #[error("recovery: cannot read {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("recovery: {file} does not start with a format description event")]
    MissingFormatDescription { file: String },

    #[error("recovery: engine resolution failed: {0}; manual intervention required")]
    Engine(#[from] EngineError),

    #[error("recovery: failed to trim {file} to {valid_pos}: {source}")]
    Trim {
        file: String,
        valid_pos: u64,
        #[source]
        source: io::Error,
    },
}

/// What recovery found and did.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// The scanned log file.
    pub log_file: String,
    /// True when the in-use flag was already clear: clean shutdown,
    /// nothing to do.
    pub clean_shutdown: bool,
    /// Prepared XIDs handed to the engines.
    pub prepared: usize,
    /// Last byte offset not inside an unfinished transaction.
    pub valid_pos: u64,
    /// Bytes trimmed off the tail.
    pub truncated_bytes: u64,
    /// Aggregate of what the engines committed and rolled back.
    pub engines: EngineRecovery,
}

/// Scan the newest indexed log file and drive engine resolution.
/// Returns `None` when the index lists no files at all.
pub fn recover_at_startup(
    index: &LogIndex,
    engines: &EngineRegistry,
) -> RecoveryResult<Option<RecoveryReport>> {
    let last = index
        .last()
        .map_err(|e| RecoveryError::Index(e.to_string()))?;
    let log_file = match last {
        Some(name) => name,
        None => return Ok(None),
    };

    let io_err = |source| RecoveryError::Io {
        file: log_file.clone(),
        source,
    };

    let mut reader = EventReader::open(log_file.as_ref()).map_err(&io_err)?;

    let first = reader.next_event().map_err(&io_err)?;
    let fde = match first {
        Some(ev) if ev.header.event_type == EventType::FormatDescription => ev,
        _ => {
            return Err(RecoveryError::MissingFormatDescription {
                file: log_file.clone(),
            })
        }
    };

    if fde.header.flags & FLAG_IN_USE == 0 {
        return Ok(Some(RecoveryReport {
            log_file,
            clean_shutdown: true,
            prepared: 0,
            valid_pos: reader.offset(),
            truncated_bytes: 0,
            engines: EngineRecovery::default(),
        }));
    }

    Logger::warn("RECOVERY_STARTED", &[("file", &log_file)]);

    let (xids, valid_pos) = scan(&mut reader, &log_file)?;
    let prepared = xids.len();

    let engine_outcome = engines.recover_all(&xids)?;

    let truncated_bytes = trim_tail(&log_file, valid_pos)?;

    LogWriter::clear_in_use_at(log_file.as_ref()).map_err(|e| RecoveryError::Trim {
        file: log_file.clone(),
        valid_pos,
        source: io::Error::new(io::ErrorKind::Other, e.to_string()),
    })?;

    Logger::info(
        "RECOVERY_FINISHED",
        &[
            ("file", &log_file),
            ("prepared", &prepared.to_string()),
            ("truncated_bytes", &truncated_bytes.to_string()),
            ("valid_pos", &valid_pos.to_string()),
        ],
    );

    Ok(Some(RecoveryReport {
        log_file,
        clean_shutdown: false,
        prepared,
        valid_pos,
        truncated_bytes,
        engines: engine_outcome,
    }))
}

/// Walk the events after the format description. Tracks transaction
/// framing on BEGIN/COMMIT query events and XID events; `valid_pos`
/// only advances while outside a transaction, so a crash mid-group is
/// rolled back by the trim. A corrupt or partial tail ends the scan.
fn scan<R: io::Read>(
    reader: &mut EventReader<R>,
    log_file: &str,
) -> RecoveryResult<(XidSet, u64)> {
    let mut xids = XidSet::new();
    let mut in_transaction = false;
    let mut valid_pos = reader.offset();

    loop {
        let event = match reader.next_event() {
            Ok(Some(ev)) => ev,
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Logger::warn(
                    "RECOVERY_CORRUPT_TAIL",
                    &[("file", log_file), ("offset", &valid_pos.to_string())],
                );
                break;
            }
            Err(e) => {
                return Err(RecoveryError::Io {
                    file: log_file.to_string(),
                    source: e,
                })
            }
        };

        match event.header.event_type {
            EventType::Query => match Query::decode(&event.payload) {
                Ok(q) if q.query == "BEGIN" => in_transaction = true,
                Ok(q) if q.query == "COMMIT" => in_transaction = false,
                Ok(_) => {}
                Err(_) => {
                    Logger::warn(
                        "RECOVERY_CORRUPT_TAIL",
                        &[("file", log_file), ("offset", &valid_pos.to_string())],
                    );
                    break;
                }
            },
            EventType::Xid => {
                in_transaction = false;
                match payload::decode_xid(&event.payload) {
                    Ok(xid) => {
                        xids.insert(xid);
                    }
                    Err(_) => {
                        Logger::warn(
                            "RECOVERY_CORRUPT_TAIL",
                            &[("file", log_file), ("offset", &valid_pos.to_string())],
                        );
                        break;
                    }
                }
            }
            _ => {}
        }

        if !in_transaction {
            valid_pos = reader.offset();
        }
    }

    Ok((xids, valid_pos))
}

/// Shorten the file to `valid_pos` when it is strictly smaller than the
/// current size. Returns the number of bytes removed.
fn trim_tail(log_file: &str, valid_pos: u64) -> RecoveryResult<u64> {
    let trim_err = |source| RecoveryError::Trim {
        file: log_file.to_string(),
        valid_pos,
        source,
    };

    let file = OpenOptions::new()
        .write(true)
        .open(log_file)
        .map_err(&trim_err)?;
    let size = file.metadata().map_err(&trim_err)?.len();

    if valid_pos >= size {
        return Ok(0);
    }

    file.set_len(valid_pos).map_err(&trim_err)?;
    file.sync_data().map_err(&trim_err)?;

    Logger::warn(
        "RECOVERY_TRIMMED_LOG",
        &[
            ("file", log_file),
            ("from", &size.to_string()),
            ("to", &valid_pos.to_string()),
        ],
    );

    Ok(size - valid_pos)
}
