//! Copying a transaction cache into a log file at its final offset
//!
//! Records in a cache carry end positions relative to the start of the
//! cache. When the cache is appended at file offset `base`, every header's
//! end position must become `relative + base`.
//!
//! The cache is consumed in fixed-size chunks, the same way a file-backed
//! cache would be read back. A header may straddle two chunks: its first
//! bytes are carried over, the rest are taken from the next chunk, and the
//! reassembled header is patched before both halves are written.

use std::io::{self, Write};

use super::record::{read_u32, END_POS_OFFSET, HEADER_LEN, MIN_RECORD_LEN, RECORD_LEN_OFFSET};

/// Writes `cache` to `out`, rebasing each record's end position by `base`.
///
/// `chunk_size` is the read-buffer size used to walk the cache; it must be
/// at least one header long.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// - `InvalidInput` for a chunk size smaller than a header, or when the
///   last record would end past `u32::MAX`, which the end-position field
///   cannot hold
/// - `InvalidData` if the cache does not parse as a sequence of records
pub fn write_cache<W: Write>(
    cache: &[u8],
    base: u64,
    chunk_size: usize,
    out: &mut W,
) -> io::Result<u64> {
    if chunk_size < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("read buffer of {} bytes cannot hold a record header", chunk_size),
        ));
    }

    let end = base + cache.len() as u64;
    if end > u32::MAX as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} cached bytes at offset {} end past the largest 32-bit position",
                cache.len(),
                base
            ),
        ));
    }

    let delta = base as u32;
    // Offset of the next header, relative to the start of the current chunk.
    let mut hdr_offs: usize = 0;
    // Bytes of a split header carried over from the previous chunk.
    let mut carry: usize = 0;
    let mut header = [0u8; HEADER_LEN];
    let mut written: u64 = 0;

    for chunk in cache.chunks(chunk_size) {
        let mut buf = chunk.to_vec();
        let mut length = buf.len();

        if carry > 0 {
            let rest = HEADER_LEN - carry;
            if buf.len() < rest {
                return Err(invalid("record header split past the end of the cache"));
            }
            header[carry..].copy_from_slice(&buf[..rest]);
            let record_len = rebase_header(&mut header, delta)?;

            out.write_all(&header[..carry])?;
            written += carry as u64;
            buf[..rest].copy_from_slice(&header[carry..]);

            hdr_offs = record_len - carry;
            carry = 0;
        }

        while hdr_offs < length {
            if hdr_offs + HEADER_LEN > length {
                carry = length - hdr_offs;
                header[..carry].copy_from_slice(&buf[hdr_offs..length]);
                length = hdr_offs;
            } else {
                let record_len =
                    rebase_header(&mut buf[hdr_offs..hdr_offs + HEADER_LEN], delta)?;
                hdr_offs += record_len;
            }
        }
        hdr_offs -= length;

        out.write_all(&buf[..length])?;
        written += length as u64;
    }

    if carry > 0 || hdr_offs > 0 {
        return Err(invalid("transaction cache ends inside a record"));
    }
    Ok(written)
}

/// Adds `delta` to the end position of one header and returns the record length.
fn rebase_header(header: &mut [u8], delta: u32) -> io::Result<usize> {
    let record_len = read_u32(header, RECORD_LEN_OFFSET) as usize;
    if record_len < MIN_RECORD_LEN {
        return Err(invalid("record length smaller than a record"));
    }
    let end_pos = read_u32(header, END_POS_OFFSET).wrapping_add(delta);
    header[END_POS_OFFSET..END_POS_OFFSET + 4].copy_from_slice(&end_pos.to_le_bytes());
    Ok(record_len)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
