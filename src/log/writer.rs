//! Append I/O for one log file.
//!
//! A file begins with the magic and a format-description event whose
//! in-use flag stays set while this is the active log. The flag is
//! cleared by a one-byte positional write at clean close, at rotation,
//! and by recovery after a crash.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::event::copy::{copy_with_base, SegmentSource};
use crate::event::{Event, FLAGS_OFFSET, FLAG_IN_USE, LOG_MAGIC};

use super::errors::{LogError, LogResult};

/// Writer over the active log file.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    /// Current append offset; also the next event's base position.
    pos: u64,
    server_id: u32,
}

impl LogWriter {
    /// Create a fresh log file: magic, then the format description with
    /// the in-use flag set.
    pub fn create(path: &Path, server_id: u32, server_version: &str) -> LogResult<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .map_err(|e| LogError::WriteFailed {
                file: path.display().to_string(),
                source: e,
            })?;

        let mut writer = Self {
            file,
            path: path.to_path_buf(),
            pos: 0,
            server_id,
        };

        writer.write_all(&LOG_MAGIC)?;
        writer.pos = LOG_MAGIC.len() as u64;

        let mut fde = Event::format_description(server_id, server_version);
        fde.header.flags |= FLAG_IN_USE;
        writer.append_event(&fde)?;
        writer.sync()?;

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    fn write_all(&mut self, bytes: &[u8]) -> LogResult<()> {
        self.file.write_all(bytes).map_err(|e| LogError::WriteFailed {
            file: self.path.display().to_string(),
            source: e,
        })
    }

    /// Append one event, stamping its absolute end position. Returns
    /// the offset of the byte after the event.
    pub fn append_event(&mut self, event: &Event) -> LogResult<u64> {
        let bytes = event.to_bytes_at(self.pos);
        self.write_all(&bytes)?;
        self.pos += bytes.len() as u64;
        Ok(self.pos)
    }

    /// Copy a session cache into the log, rebasing every event's end
    /// position onto the current file offset.
    pub fn append_cache<S: SegmentSource>(&mut self, cache: &mut S) -> LogResult<u64> {
        let base = self.pos;
        let written =
            copy_with_base(cache, base, &mut self.file).map_err(|e| LogError::WriteFailed {
                file: self.path.display().to_string(),
                source: e,
            })?;
        self.pos += written;
        Ok(written)
    }

    pub fn sync(&mut self) -> LogResult<()> {
        self.sync_io().map_err(|e| LogError::SyncFailed {
            file: self.path.display().to_string(),
            source: e,
        })
    }

    pub(crate) fn sync_io(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Clear the in-use flag on this file via a positional write, then
    /// sync. The write offset is the flags byte of the format
    /// description event.
    fn clear_in_use(&mut self) -> LogResult<()> {
        let offset = (LOG_MAGIC.len() + FLAGS_OFFSET) as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&[0u8]))
            .and_then(|_| self.file.seek(SeekFrom::Start(self.pos)).map(|_| ()))
            .map_err(|e| LogError::WriteFailed {
                file: self.path.display().to_string(),
                source: e,
            })?;
        self.sync()
    }

    /// Close the file cleanly: optional stop event, clear the in-use
    /// flag, final sync.
    pub fn close(mut self, write_stop: bool) -> LogResult<()> {
        if write_stop {
            let stop = Event::stop(self.server_id);
            self.append_event(&stop)?;
        }
        self.clear_in_use()?;
        Ok(())
    }

    /// Clear the in-use flag of a log file that is not open for append;
    /// used by recovery after trimming a crashed file.
    pub fn clear_in_use_at(path: &Path) -> LogResult<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start((LOG_MAGIC.len() + FLAGS_OFFSET) as u64))?;
        file.write_all(&[0u8])?;
        file.sync_data()?;
        Ok(())
    }
}

/// Whether the file's format description still carries the in-use flag.
pub fn is_in_use(path: &Path) -> LogResult<bool> {
    use std::io::Read;

    let mut file = File::open(path)?;
    let mut head = [0u8; 4];
    file.read_exact(&mut head)?;
    if head != LOG_MAGIC {
        return Err(LogError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad magic in {}", path.display()),
        )));
    }
    file.seek(SeekFrom::Start((LOG_MAGIC.len() + FLAGS_OFFSET) as u64))?;
    let mut flag = [0u8; 1];
    file.read_exact(&mut flag)?;
    Ok(flag[0] & FLAG_IN_USE as u8 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::reader::EventReader;
    use crate::event::EventType;
    use tempfile::TempDir;

    fn new_writer(dir: &TempDir) -> LogWriter {
        LogWriter::create(&dir.path().join("log.000001"), 3, "replog-test").unwrap()
    }

    #[test]
    fn test_create_writes_magic_and_fde() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir);
        let path = writer.path().to_path_buf();
        drop(writer);

        let mut reader = EventReader::open(&path).unwrap();
        let fde = reader.next_event().unwrap().unwrap();
        assert_eq!(fde.header.event_type, EventType::FormatDescription);
        assert_eq!(fde.header.flags & FLAG_IN_USE, FLAG_IN_USE);
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");
        std::fs::write(&path, b"existing").unwrap();
        assert!(LogWriter::create(&path, 1, "v").is_err());
    }

    #[test]
    fn test_append_event_advances_pos() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir);
        let before = writer.pos();

        let event = Event::query(3, 1, "", "BEGIN");
        let end = writer.append_event(&event).unwrap();
        assert_eq!(end, before + event.len());
        assert_eq!(writer.pos(), end);
    }

    #[test]
    fn test_end_log_pos_is_absolute() {
        let dir = TempDir::new().unwrap();
        let mut writer = new_writer(&dir);
        writer.append_event(&Event::query(3, 1, "", "BEGIN")).unwrap();
        let end = writer.append_event(&Event::xid(3, 5)).unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        let mut reader = EventReader::open(&path).unwrap();
        let mut last = None;
        while let Some(event) = reader.next_event().unwrap() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().header.end_log_pos as u64, end);
    }

    #[test]
    fn test_close_clears_in_use_and_writes_stop() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir);
        let path = writer.path().to_path_buf();

        assert!(is_in_use(&path).unwrap());
        writer.close(true).unwrap();
        assert!(!is_in_use(&path).unwrap());

        let mut reader = EventReader::open(&path).unwrap();
        let mut last = None;
        while let Some(event) = reader.next_event().unwrap() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().header.event_type, EventType::Stop);
    }

    #[test]
    fn test_clear_in_use_at_path() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir);
        let path = writer.path().to_path_buf();
        drop(writer); // dropped without clean close, flag stays set

        assert!(is_in_use(&path).unwrap());
        LogWriter::clear_in_use_at(&path).unwrap();
        assert!(!is_in_use(&path).unwrap());
    }
}
