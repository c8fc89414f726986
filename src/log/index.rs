//! Index of log files, with crash-safe mutation.
//!
//! The index is a text file listing active log file paths in creation
//! order, one per line, LF-terminated. Every mutation is made
//! crash-safe by a sibling purge-pending file (`.~rec~` suffix): the
//! intended change is written there and synced first, then the index is
//! mutated and synced, then the pending file is unlinked. If the
//! pending file exists at startup its deletions are replayed before
//! anything else runs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::observability::Logger;

use super::errors::{LogError, LogResult};

/// Suffix of the purge-pending shadow file.
pub const PENDING_SUFFIX: &str = ".~rec~";

pub struct LogIndex {
    path: PathBuf,
    pending_path: PathBuf,
}

impl LogIndex {
    /// Open (creating if needed) the index for a log base path, e.g.
    /// `/data/log` -> `/data/log.index` and `/data/log.~rec~`. Replays
    /// the pending file if one was left behind by a crash.
    pub fn open(base: &Path) -> LogResult<Self> {
        let mut path = base.as_os_str().to_owned();
        path.push(".index");
        let mut pending = base.as_os_str().to_owned();
        pending.push(PENDING_SUFFIX);

        let index = Self {
            path: PathBuf::from(path),
            pending_path: PathBuf::from(pending),
        };

        if !index.path.exists() {
            let file = File::create(&index.path)?;
            file.sync_data()?;
        }

        if index.pending_path.exists() {
            index.replay_pending()?;
        }

        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending_path(&self) -> &Path {
        &self.pending_path
    }

    pub fn has_pending(&self) -> bool {
        self.pending_path.exists()
    }

    /// Re-apply the deletions recorded in the pending file, then remove
    /// it. Missing victims are fine; anything else is an index
    /// inconsistency.
    fn replay_pending(&self) -> LogResult<()> {
        let names = read_lines(&self.pending_path)?;
        Logger::warn(
            "LOG_INDEX_REPLAY",
            &[("pending", &names.len().to_string())],
        );

        for name in &names {
            match fs::remove_file(name) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LogError::IndexInconsistency {
                        reason: format!("replay could not remove {}: {}", name, e),
                    })
                }
            }
        }

        self.remove_entries(&names).map_err(|e| LogError::IndexInconsistency {
            reason: format!("replay could not update the index: {}", e),
        })?;
        self.clear_pending()?;
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> LogResult<Vec<String>> {
        read_lines(&self.path)
    }

    /// Position of an entry, or None.
    pub fn find_by_name(&self, name: &str) -> LogResult<Option<usize>> {
        Ok(self.entries()?.iter().position(|e| e == name))
    }

    /// The entry following `position`, or None at the tail.
    pub fn next_after(&self, position: usize) -> LogResult<Option<String>> {
        Ok(self.entries()?.into_iter().nth(position + 1))
    }

    /// The newest entry, or None when the index is empty.
    pub fn last(&self) -> LogResult<Option<String>> {
        Ok(self.entries()?.pop())
    }

    /// Add an entry with the shadow-file protocol, running `create`
    /// between registering the intent and appending. If the process
    /// dies anywhere in between, startup replay removes whatever
    /// `create` left behind.
    pub fn append_with<F>(&self, name: &str, create: F) -> LogResult<()>
    where
        F: FnOnce() -> LogResult<()>,
    {
        self.register_pending(&[name.to_string()])?;
        create()?;
        self.append_entry(name)?;
        self.clear_pending()
    }

    /// Add an entry (no file creation involved).
    pub fn append(&self, name: &str) -> LogResult<()> {
        self.append_with(name, || Ok(()))
    }

    /// Write the victim list to the pending file and sync it.
    pub(crate) fn register_pending(&self, names: &[String]) -> LogResult<()> {
        let mut file = File::create(&self.pending_path)?;
        for name in names {
            file.write_all(name.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        Ok(())
    }

    pub(crate) fn append_entry(&self, name: &str) -> LogResult<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(name.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrite the index without the given entries and sync it.
    pub(crate) fn remove_entries(&self, victims: &[String]) -> LogResult<()> {
        let survivors: Vec<String> = self
            .entries()?
            .into_iter()
            .filter(|e| !victims.contains(e))
            .collect();

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for name in &survivors {
            file.write_all(name.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        Ok(())
    }

    pub(crate) fn clear_pending(&self) -> LogResult<()> {
        match fs::remove_file(&self.pending_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::Io(e)),
        }
    }
}

fn read_lines(path: &Path) -> LogResult<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index_in(dir: &TempDir) -> LogIndex {
        LogIndex::open(&dir.path().join("log")).unwrap()
    }

    #[test]
    fn test_open_creates_empty_index() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        assert!(index.path().exists());
        assert!(index.entries().unwrap().is_empty());
        assert!(!index.has_pending());
    }

    #[test]
    fn test_append_and_lookup() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        index.append("log.000001").unwrap();
        index.append("log.000002").unwrap();

        assert_eq!(index.entries().unwrap(), vec!["log.000001", "log.000002"]);
        assert_eq!(index.find_by_name("log.000002").unwrap(), Some(1));
        assert_eq!(index.find_by_name("log.000009").unwrap(), None);
        assert_eq!(index.next_after(0).unwrap().as_deref(), Some("log.000002"));
        assert_eq!(index.next_after(1).unwrap(), None);
        assert_eq!(index.last().unwrap().as_deref(), Some("log.000002"));
    }

    #[test]
    fn test_index_file_is_lf_terminated() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        index.append("log.000001").unwrap();
        let raw = fs::read_to_string(index.path()).unwrap();
        assert_eq!(raw, "log.000001\n");
    }

    #[test]
    fn test_append_leaves_no_pending_file() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        index.append("log.000001").unwrap();
        assert!(!index.has_pending());
    }

    #[test]
    fn test_remove_entries_keeps_order() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        for name in ["a", "b", "c", "d"] {
            index.append(name).unwrap();
        }
        index.remove_entries(&["a".into(), "c".into()]).unwrap();
        assert_eq!(index.entries().unwrap(), vec!["b", "d"]);
    }

    #[test]
    fn test_pending_replay_deletes_files_and_entries() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("log.000001");
        let survivor = dir.path().join("log.000002");
        fs::write(&victim, b"old").unwrap();
        fs::write(&survivor, b"new").unwrap();

        {
            let index = index_in(&dir);
            index.append(victim.to_str().unwrap()).unwrap();
            index.append(survivor.to_str().unwrap()).unwrap();
            // Simulate a crash between file deletion and index update.
            index
                .register_pending(&[victim.to_str().unwrap().to_string()])
                .unwrap();
        }

        let index = index_in(&dir);
        assert!(!victim.exists());
        assert!(survivor.exists());
        assert_eq!(
            index.entries().unwrap(),
            vec![survivor.to_str().unwrap().to_string()]
        );
        assert!(!index.has_pending());
    }

    #[test]
    fn test_pending_replay_tolerates_missing_victims() {
        let dir = TempDir::new().unwrap();
        {
            let index = index_in(&dir);
            index.append("gone.000001").unwrap();
            index
                .register_pending(&["gone.000001".to_string()])
                .unwrap();
        }

        let index = index_in(&dir);
        assert!(index.entries().unwrap().is_empty());
        assert!(!index.has_pending());
    }

    #[test]
    fn test_interrupted_create_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let half_made = dir.path().join("log.000003");
        {
            let index = index_in(&dir);
            // append_with crashed after creating the file but before
            // the index append: only the pending record survives.
            index
                .register_pending(&[half_made.to_str().unwrap().to_string()])
                .unwrap();
            fs::write(&half_made, b"partial").unwrap();
        }

        let index = index_in(&dir);
        assert!(!half_made.exists());
        assert!(index.entries().unwrap().is_empty());
    }
}
