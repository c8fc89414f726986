//! Spillable byte buffer backing a session's transaction cache.
//!
//! Bytes accumulate in memory up to a soft cap, then overflow into an
//! anonymous temporary file. A hard cap bounds the total; hitting it is
//! the cache-full condition. The buffer is written append-only, can be
//! truncated back to any earlier position, and is read back in
//! fixed-size segments for the copy to the log.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::event::copy::SegmentSource;

use super::errors::{CacheError, CacheResult};

pub struct SpillBuffer {
    mem: Vec<u8>,
    /// Soft cap: bytes beyond this go to the spill file.
    mem_limit: usize,
    /// Hard cap on the total logical size.
    max_size: u64,
    spill: Option<File>,
    /// Logical bytes in the spill file. The file itself may be longer
    /// after a truncate; bytes past this are dead.
    spill_len: u64,
    read_cursor: u64,
    /// Write operations that touched the spill file since the last
    /// reset of the counter.
    disk_writes: u64,
}

impl SpillBuffer {
    pub fn with_limits(mem_limit: usize, max_size: u64) -> Self {
        Self {
            mem: Vec::new(),
            mem_limit,
            max_size,
            spill: None,
            spill_len: 0,
            read_cursor: 0,
            disk_writes: 0,
        }
    }

    /// Total logical bytes buffered.
    pub fn position(&self) -> u64 {
        self.mem.len() as u64 + self.spill_len
    }

    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
    }

    pub fn write(&mut self, data: &[u8]) -> CacheResult<()> {
        let requested = data.len() as u64;
        if self.position() + requested > self.max_size {
            return Err(CacheError::CacheFull {
                requested,
                limit: self.max_size,
            });
        }

        let mut rest = data;
        if self.spill_len == 0 && self.mem.len() < self.mem_limit {
            let room = self.mem_limit - self.mem.len();
            let take = room.min(rest.len());
            self.mem.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }

        if !rest.is_empty() {
            let offset = self.spill_len;
            let file = self.spill_file()?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(rest)?;
            self.spill_len += rest.len() as u64;
            self.disk_writes += 1;
        }

        Ok(())
    }

    fn spill_file(&mut self) -> io::Result<&mut File> {
        if self.spill.is_none() {
            self.spill = Some(tempfile::tempfile()?);
        }
        Ok(self.spill.as_mut().unwrap())
    }

    /// Discard everything past `pos`. `pos` must not exceed the current
    /// position.
    pub fn truncate(&mut self, pos: u64) {
        debug_assert!(pos <= self.position());
        let mem_len = self.mem.len() as u64;
        if pos <= mem_len {
            self.mem.truncate(pos as usize);
            self.spill_len = 0;
        } else {
            self.spill_len = pos - mem_len;
        }
        self.read_cursor = 0;
    }

    /// Position the read cursor at the start of the buffer.
    pub fn start_read(&mut self) {
        self.read_cursor = 0;
    }

    pub fn spilled(&self) -> bool {
        self.disk_writes > 0
    }

    /// Spill-write count since the last take; used for cache metrics.
    pub fn take_disk_writes(&mut self) -> u64 {
        std::mem::take(&mut self.disk_writes)
    }
}

impl SegmentSource for SpillBuffer {
    fn read_segment(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mem_len = self.mem.len() as u64;

        if self.read_cursor < mem_len {
            let at = self.read_cursor as usize;
            let n = buf.len().min(self.mem.len() - at);
            buf[..n].copy_from_slice(&self.mem[at..at + n]);
            self.read_cursor += n as u64;
            return Ok(n);
        }

        let offset = self.read_cursor - mem_len;
        if offset >= self.spill_len {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.spill_len - offset) as usize;
        let file = match self.spill.as_mut() {
            Some(f) => f,
            None => return Ok(0),
        };
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..n])?;
        self.read_cursor += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(buf: &mut SpillBuffer) -> Vec<u8> {
        buf.start_read();
        let mut out = Vec::new();
        let mut seg = [0u8; 16];
        loop {
            let n = buf.read_segment(&mut seg).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&seg[..n]);
        }
        out
    }

    #[test]
    fn test_write_within_memory() {
        let mut buf = SpillBuffer::with_limits(64, 1024);
        buf.write(b"hello").unwrap();
        assert_eq!(buf.position(), 5);
        assert!(!buf.spilled());
        assert_eq!(read_all(&mut buf), b"hello");
    }

    #[test]
    fn test_overflow_spills_to_disk() {
        let mut buf = SpillBuffer::with_limits(8, 1024);
        buf.write(b"0123456789abcdef").unwrap();
        assert_eq!(buf.position(), 16);
        assert!(buf.spilled());
        assert_eq!(read_all(&mut buf), b"0123456789abcdef");
    }

    #[test]
    fn test_read_spans_memory_and_spill() {
        let mut buf = SpillBuffer::with_limits(4, 1024);
        buf.write(b"abcd").unwrap();
        buf.write(b"efgh").unwrap();
        buf.write(b"ijkl").unwrap();
        assert_eq!(read_all(&mut buf), b"abcdefghijkl");
    }

    #[test]
    fn test_hard_cap_boundary() {
        let mut buf = SpillBuffer::with_limits(4, 10);
        buf.write(b"0123456789").unwrap();
        assert_eq!(buf.position(), 10);

        let err = buf.write(b"x").unwrap_err();
        assert!(err.is_cache_full());
        // The failed write changed nothing.
        assert_eq!(buf.position(), 10);
    }

    #[test]
    fn test_truncate_into_memory_region() {
        let mut buf = SpillBuffer::with_limits(4, 1024);
        buf.write(b"abcdefgh").unwrap();
        buf.truncate(2);
        assert_eq!(buf.position(), 2);
        assert_eq!(read_all(&mut buf), b"ab");

        // Writes continue from the truncation point.
        buf.write(b"ZZ").unwrap();
        assert_eq!(read_all(&mut buf), b"abZZ");
    }

    #[test]
    fn test_truncate_into_spill_region() {
        let mut buf = SpillBuffer::with_limits(4, 1024);
        buf.write(b"abcdefgh").unwrap();
        buf.truncate(6);
        assert_eq!(buf.position(), 6);
        assert_eq!(read_all(&mut buf), b"abcdef");

        buf.write(b"XY").unwrap();
        assert_eq!(read_all(&mut buf), b"abcdefXY");
    }

    #[test]
    fn test_truncate_to_zero() {
        let mut buf = SpillBuffer::with_limits(4, 1024);
        buf.write(b"abcdefgh").unwrap();
        buf.truncate(0);
        assert_eq!(buf.position(), 0);
        assert_eq!(read_all(&mut buf), b"");
    }

    #[test]
    fn test_disk_write_counter() {
        let mut buf = SpillBuffer::with_limits(2, 1024);
        buf.write(b"abcd").unwrap();
        buf.write(b"ef").unwrap();
        assert_eq!(buf.take_disk_writes(), 2);
        assert_eq!(buf.take_disk_writes(), 0);
    }
}
