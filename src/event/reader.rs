//! Sequential event reader.
//!
//! Readers must start at the magic and parse frames in order; there is
//! no way to seek into the middle of a log file. A partial frame at the
//! end of the stream terminates the scan without an error so that
//! recovery can trim the tail.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::header::{EventHeader, EVENT_HEADER_LEN, LOG_MAGIC};

/// One event as read back from a log file.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub header: EventHeader,
    pub payload: Vec<u8>,
    /// File offset where this event's header starts.
    pub start_offset: u64,
}

/// Sequential reader over a framed event stream.
pub struct EventReader<R> {
    src: R,
    offset: u64,
    truncated: bool,
}

impl EventReader<BufReader<File>> {
    /// Open a log file and verify the magic.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != LOG_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad magic in {}", path.display()),
            ));
        }

        Ok(Self {
            src: reader,
            offset: LOG_MAGIC.len() as u64,
            truncated: false,
        })
    }
}

impl<R: Read> EventReader<R> {
    /// Wrap a stream positioned just past the magic.
    pub fn from_stream(src: R, offset: u64) -> Self {
        Self {
            src,
            offset,
            truncated: false,
        }
    }

    /// Current offset: the byte after the last fully read event.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the stream ended in the middle of a frame.
    pub fn hit_partial_frame(&self) -> bool {
        self.truncated
    }

    /// Read the next event. `Ok(None)` means end of stream, either
    /// clean or mid-frame; check [`hit_partial_frame`] to distinguish.
    ///
    /// [`hit_partial_frame`]: EventReader::hit_partial_frame
    pub fn next_event(&mut self) -> io::Result<Option<RawEvent>> {
        let start_offset = self.offset;

        let mut header_buf = [0u8; EVENT_HEADER_LEN];
        match read_full(&mut self.src, &mut header_buf)? {
            0 => return Ok(None),
            n if n < EVENT_HEADER_LEN => {
                self.truncated = true;
                return Ok(None);
            }
            _ => {}
        }

        let header = EventHeader::decode(&header_buf)?;

        let mut payload = vec![0u8; header.payload_len()];
        let got = read_full(&mut self.src, &mut payload)?;
        if got < payload.len() {
            self.truncated = true;
            return Ok(None);
        }

        self.offset = start_offset + header.event_len as u64;
        Ok(Some(RawEvent {
            header,
            payload,
            start_offset,
        }))
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match src.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
