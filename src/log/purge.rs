//! Deletion of obsolete log files.
//!
//! Purge walks the index from the head and stops at the first file it
//! must keep: the active file, a file a live reader still holds, or
//! (for time-based purge) a file newer than the cutoff. The victims go
//! through the index's shadow-file protocol so an interrupted purge is
//! finished by startup replay. A victim already missing from disk is a
//! warning; any other stat or unlink failure aborts the purge.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::observability::Logger;

use super::errors::{LogError, LogResult};
use super::index::LogIndex;

/// Which log files readers currently hold open. Purge never deletes a
/// held file.
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    held: Mutex<HashMap<String, usize>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        *held.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn release(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        if let Some(count) = held.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                held.remove(name);
            }
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().unwrap().contains_key(name)
    }
}

/// What a purge run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub removed: Vec<String>,
    /// Victims that were already gone from disk.
    pub missing: u64,
    /// Bytes freed, for the caller's log-space accounting.
    pub bytes_reclaimed: u64,
}

/// Purge files from the head of the index up to `to_log`.
pub(crate) fn purge_logs(
    index: &LogIndex,
    readers: &ReaderRegistry,
    active: &str,
    to_log: &str,
    inclusive: bool,
) -> LogResult<PurgeOutcome> {
    if index.find_by_name(to_log)?.is_none() {
        return Err(LogError::UnknownLogFile {
            file: to_log.to_string(),
        });
    }

    let mut victims = Vec::new();
    for entry in index.entries()? {
        let boundary = entry == to_log;
        if boundary && !inclusive {
            break;
        }
        if entry == active || readers.is_held(&entry) {
            break;
        }
        victims.push(entry);
        if boundary {
            break;
        }
    }

    execute(index, victims)
}

/// Purge files whose last modification is older than `cutoff`.
pub(crate) fn purge_logs_before(
    index: &LogIndex,
    readers: &ReaderRegistry,
    active: &str,
    cutoff: SystemTime,
) -> LogResult<PurgeOutcome> {
    let mut victims = Vec::new();
    for entry in index.entries()? {
        if entry == active || readers.is_held(&entry) {
            break;
        }
        match fs::metadata(&entry) {
            Ok(meta) => {
                let mtime = meta.modified()?;
                if mtime >= cutoff {
                    break;
                }
                victims.push(entry);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Still listed but already gone; let the purge pass
                // clean it out of the index.
                victims.push(entry);
            }
            Err(e) => {
                return Err(LogError::PurgeFailed {
                    file: entry,
                    source: e,
                })
            }
        }
    }

    execute(index, victims)
}

/// Run the crash-safe deletion protocol over the chosen victims.
fn execute(index: &LogIndex, victims: Vec<String>) -> LogResult<PurgeOutcome> {
    if victims.is_empty() {
        return Ok(PurgeOutcome::default());
    }

    index.register_pending(&victims)?;

    let mut outcome = PurgeOutcome::default();
    for victim in &victims {
        match fs::metadata(victim) {
            Ok(meta) => {
                let size = meta.len();
                match fs::remove_file(victim) {
                    Ok(()) => outcome.bytes_reclaimed += size,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn_missing(victim);
                        outcome.missing += 1;
                    }
                    Err(e) => {
                        return Err(LogError::PurgeFailed {
                            file: victim.clone(),
                            source: e,
                        })
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn_missing(victim);
                outcome.missing += 1;
            }
            Err(e) => {
                return Err(LogError::PurgeFailed {
                    file: victim.clone(),
                    source: e,
                })
            }
        }
        outcome.removed.push(victim.clone());
    }

    index.remove_entries(&victims)?;
    index.clear_pending()?;
    Ok(outcome)
}

fn warn_missing(victim: &str) {
    Logger::warn("PURGE_MISSING_FILE", &[("file", victim)]);
}

/// mtime helper for tests that need to age files artificially.
#[cfg(test)]
pub(crate) fn file_mtime(path: &std::path::Path) -> io::Result<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        index: LogIndex,
        readers: ReaderRegistry,
        files: Vec<String>,
    }

    fn fixture(count: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let index = LogIndex::open(&dir.path().join("log")).unwrap();
        let mut files = Vec::new();
        for i in 1..=count {
            let path = dir.path().join(format!("log.{:06}", i));
            fs::write(&path, vec![0u8; 100]).unwrap();
            let name = path.to_str().unwrap().to_string();
            index.append(&name).unwrap();
            files.push(name);
        }
        Fixture {
            _dir: dir,
            index,
            readers: ReaderRegistry::new(),
            files,
        }
    }

    #[test]
    fn test_purge_upto_exclusive() {
        let f = fixture(3);
        let active = f.files[2].clone();

        let outcome =
            purge_logs(&f.index, &f.readers, &active, &f.files[1], false).unwrap();
        assert_eq!(outcome.removed, vec![f.files[0].clone()]);
        assert_eq!(outcome.bytes_reclaimed, 100);
        assert!(!Path::new(&f.files[0]).exists());
        assert!(Path::new(&f.files[1]).exists());
        assert_eq!(f.index.entries().unwrap(), f.files[1..].to_vec());
        assert!(!f.index.has_pending());
    }

    #[test]
    fn test_purge_upto_inclusive() {
        let f = fixture(3);
        let active = f.files[2].clone();

        let outcome =
            purge_logs(&f.index, &f.readers, &active, &f.files[1], true).unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(f.index.entries().unwrap(), vec![f.files[2].clone()]);
    }

    #[test]
    fn test_purge_never_touches_active_file() {
        let f = fixture(2);
        let active = f.files[0].clone();

        let outcome =
            purge_logs(&f.index, &f.readers, &active, &f.files[1], true).unwrap();
        assert!(outcome.removed.is_empty());
        assert_eq!(f.index.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_purge_stops_at_reader_held_file() {
        let f = fixture(3);
        let active = f.files[2].clone();
        f.readers.register(&f.files[1]);

        let outcome =
            purge_logs(&f.index, &f.readers, &active, &f.files[1], true).unwrap();
        assert_eq!(outcome.removed, vec![f.files[0].clone()]);
        assert!(Path::new(&f.files[1]).exists());

        f.readers.release(&f.files[1]);
        assert!(!f.readers.is_held(&f.files[1]));
    }

    #[test]
    fn test_purge_unknown_target_is_an_error() {
        let f = fixture(1);
        let err = purge_logs(&f.index, &f.readers, &f.files[0], "nope", true).unwrap_err();
        assert!(matches!(err, LogError::UnknownLogFile { .. }));
    }

    #[test]
    fn test_purge_missing_file_is_a_warning() {
        let f = fixture(3);
        let active = f.files[2].clone();
        fs::remove_file(&f.files[0]).unwrap();

        let outcome =
            purge_logs(&f.index, &f.readers, &active, &f.files[1], true).unwrap();
        assert_eq!(outcome.missing, 1);
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(outcome.bytes_reclaimed, 100);
        assert_eq!(f.index.entries().unwrap(), vec![active]);
    }

    #[test]
    fn test_purge_before_date() {
        let f = fixture(3);
        let active = f.files[2].clone();

        // Everything was just written; a cutoff in the past removes
        // nothing.
        let old_cutoff = SystemTime::now() - Duration::from_secs(3600);
        let outcome =
            purge_logs_before(&f.index, &f.readers, &active, old_cutoff).unwrap();
        assert!(outcome.removed.is_empty());

        // A cutoff in the future removes everything but the active
        // file.
        let future_cutoff = SystemTime::now() + Duration::from_secs(3600);
        let outcome =
            purge_logs_before(&f.index, &f.readers, &active, future_cutoff).unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(f.index.entries().unwrap(), vec![active]);
        assert!(!f.index.has_pending());
    }

    #[test]
    fn test_mtime_helper_reads_clock() {
        let f = fixture(1);
        let mtime = file_mtime(Path::new(&f.files[0])).unwrap();
        assert!(mtime <= SystemTime::now());
    }
}
