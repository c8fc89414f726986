//! Cache-to-log copy with offset rewriting.
//!
//! Events buffered in a session cache carry `end_log_pos` relative to
//! the start of their transaction group. When the cache is copied out
//! to the log file, every header's `end_log_pos` must be rebased by the
//! log offset at which the group lands. The copy is a streaming
//! transform over fixed-size read segments: it never materializes the
//! cache, and a header that straddles a segment boundary is spliced
//! from a carry buffer, rewritten, and emitted in two parts. Payload
//! bytes pass through untouched.

use std::io::{self, Write};

use super::header::{END_POS_OFFSET, EVENT_HEADER_LEN, EVENT_LEN_OFFSET};

/// Read side of a spillable buffer: hands back the next segment of
/// bytes, in order, until exhausted.
pub trait SegmentSource {
    /// Fill `buf` with the next bytes of the stream. Returns 0 at end.
    /// Implementations may return fewer bytes than `buf` holds.
    fn read_segment(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Segment size used for the copy. The session caches hand back their
/// in-memory and spill-file contents in chunks of at most this size.
pub const COPY_SEGMENT_LEN: usize = 4096;

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

/// Copy a cache's event stream to `out`, adding `base` to every
/// header's `end_log_pos`. Returns the number of bytes written.
///
/// The stream must consist of whole events; ending inside a header or a
/// payload is an input error.
pub fn copy_with_base<S, W>(src: &mut S, base: u64, out: &mut W) -> io::Result<u64>
where
    S: SegmentSource + ?Sized,
    W: Write,
{
    let mut seg = vec![0u8; COPY_SEGMENT_LEN];
    let mut carry_buf = [0u8; EVENT_HEADER_LEN];
    let mut carry = 0usize;
    // Offset of the next event header relative to the current segment.
    let mut hdr_offs = 0usize;
    let mut written = 0u64;

    loop {
        let mut length = src.read_segment(&mut seg)?;
        if length == 0 {
            break;
        }

        // A header split over the segment border: assemble both halves,
        // rewrite, emit the first half now and patch the second half
        // back into the segment so it goes out with the body.
        if carry > 0 {
            let rest = EVENT_HEADER_LEN - carry;
            if length < rest {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "cache stream ends inside an event header",
                ));
            }

            let mut header = [0u8; EVENT_HEADER_LEN];
            header[..carry].copy_from_slice(&carry_buf[..carry]);
            header[carry..].copy_from_slice(&seg[..rest]);

            let rebased = (read_u32(&header, END_POS_OFFSET) as u64 + base) as u32;
            write_u32(&mut header, END_POS_OFFSET, rebased);

            out.write_all(&header[..carry])?;
            written += carry as u64;
            seg[..rest].copy_from_slice(&header[carry..]);

            let event_len = read_u32(&header, EVENT_LEN_OFFSET) as usize;
            hdr_offs = event_len - carry;
            carry = 0;
        }

        // Rewrite every complete header in this segment in place. A
        // long event may push hdr_offs past several future segments;
        // the subtraction at the bottom keeps it relative.
        while hdr_offs < length {
            if hdr_offs + EVENT_HEADER_LEN > length {
                carry = length - hdr_offs;
                carry_buf[..carry].copy_from_slice(&seg[hdr_offs..length]);
                // Hold the partial header back; it is written once
                // assembled and rewritten.
                length = hdr_offs;
            } else {
                let rebased = (read_u32(&seg, hdr_offs + END_POS_OFFSET) as u64 + base) as u32;
                write_u32(&mut seg, hdr_offs + END_POS_OFFSET, rebased);
                hdr_offs += read_u32(&seg, hdr_offs + EVENT_LEN_OFFSET) as usize;
            }
        }
        hdr_offs -= length;

        out.write_all(&seg[..length])?;
        written += length as u64;
    }

    if carry != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "cache stream ends inside an event header",
        ));
    }

    Ok(written)
}
