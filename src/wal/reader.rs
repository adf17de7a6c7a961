//! Sequential log file reader
//!
//! Validates the magic, the leading format record, every record checksum and
//! every absolute end position. Any mismatch is reported as corruption at
//! the offset where the bad record starts.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use super::errors::{LogError, LogResult};
use super::record::{
    LogRecord, RecordBody, RecordHeader, FLAG_IN_USE, HEADER_LEN, LOG_MAGIC,
};

/// Reader over one log file
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    /// Offset of the next unread byte
    offset: u64,
    file_size: u64,
    format: LogRecord,
}

impl LogReader {
    /// Opens a log file and reads its magic and format record.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_CORRUPTION` if the file is missing, too short,
    /// has the wrong magic or does not start with a format record.
    pub fn open(path: &Path) -> LogResult<Self> {
        let file = File::open(path).map_err(|e| {
            LogError::corruption(format!("Failed to open log file: {}: {}", path.display(), e))
        })?;
        let file_size = file
            .metadata()
            .map_err(|e| LogError::corruption(format!("Failed to read log metadata: {}", e)))?
            .len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        let got = fill(&mut reader, &mut magic)
            .map_err(|e| LogError::corruption(format!("Failed to read log magic: {}", e)))?;
        if got < magic.len() || magic != LOG_MAGIC {
            return Err(LogError::corruption_at_offset(
                0,
                format!("{} is not a log file (bad magic)", path.display()),
            ));
        }

        let format_at = LOG_MAGIC.len() as u64;
        let format = match read_record(&mut reader, format_at, file_size)? {
            Some(record) if matches!(record.body, RecordBody::FormatDescription { .. }) => record,
            _ => {
                return Err(LogError::corruption_at_offset(
                    format_at,
                    format!("{} does not start with a format record", path.display()),
                ))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            offset: format_at + format.header.record_len as u64,
            file_size,
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last record returned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The file's format record
    pub fn format_record(&self) -> &LogRecord {
        &self.format
    }

    /// True if the writing process never closed the file cleanly
    pub fn is_in_use(&self) -> bool {
        self.format.header.flags & FLAG_IN_USE != 0
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` at a clean end of file.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_CORRUPTION` for a truncated, malformed or
    /// mispositioned record. `offset()` keeps pointing at the start of the
    /// bad record, which is the end of the valid prefix.
    pub fn read_next(&mut self) -> LogResult<Option<LogRecord>> {
        let record = read_record(&mut self.reader, self.offset, self.file_size)?;
        if let Some(ref r) = record {
            self.offset += r.header.record_len as u64;
        }
        Ok(record)
    }

    /// Reads every remaining record with its starting offset
    pub fn read_all(&mut self) -> LogResult<Vec<(u64, LogRecord)>> {
        let mut out = Vec::new();
        loop {
            let at = self.offset;
            match self.read_next()? {
                Some(record) => out.push((at, record)),
                None => return Ok(out),
            }
        }
    }
}

/// Reads and validates the record starting at `start`
fn read_record<R: Read>(
    reader: &mut R,
    start: u64,
    file_size: u64,
) -> LogResult<Option<LogRecord>> {
    let mut header = [0u8; HEADER_LEN];
    let got = fill(reader, &mut header)
        .map_err(|e| LogError::corruption_at_offset(start, format!("read failed: {}", e)))?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(LogError::corruption_at_offset(start, "truncated record header"));
    }

    let parsed = RecordHeader::parse(&header)
        .map_err(|e| LogError::corruption_at_offset(start, e.to_string()))?;
    let len = parsed.record_len as usize;
    if start + len as u64 > file_size {
        return Err(LogError::corruption_at_offset(start, "record extends past end of file"));
    }

    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(&header);
    bytes.resize(len, 0);
    let got = fill(reader, &mut bytes[HEADER_LEN..])
        .map_err(|e| LogError::corruption_at_offset(start, format!("read failed: {}", e)))?;
    if got < len - HEADER_LEN {
        return Err(LogError::corruption_at_offset(start, "truncated record body"));
    }

    let (record, used) = LogRecord::decode(&bytes)
        .map_err(|e| LogError::corruption_at_offset(start, e.to_string()))?;
    let expected_end = (start + used as u64) as u32;
    if record.header.end_pos != expected_end {
        return Err(LogError::corruption_at_offset(
            start,
            format!(
                "record end position {} does not match its offset (expected {})",
                record.header.end_pos, expected_end
            ),
        ));
    }
    Ok(Some(record))
}

/// Reads until `buf` is full or EOF; returns the bytes read
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::RecordBody;
    use std::fs;
    use tempfile::TempDir;

    fn build_file(records: &[RecordBody], in_use: bool) -> Vec<u8> {
        let mut out = LOG_MAGIC.to_vec();
        let flags = if in_use { FLAG_IN_USE } else { 0 };
        out.extend(RecordBody::format_description().encode(1, flags, out.len() as u64));
        for r in records {
            let at = out.len() as u64;
            out.extend(r.encode(1, 0, at));
        }
        out
    }

    #[test]
    fn test_reads_records_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.000001");
        let records = vec![
            RecordBody::begin(),
            RecordBody::Query("INSERT INTO t VALUES (1)".into()),
            RecordBody::Xid(12),
        ];
        fs::write(&path, build_file(&records, true)).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.is_in_use());
        let all = reader.read_all().unwrap();
        let bodies: Vec<_> = all.into_iter().map(|(_, r)| r.body).collect();
        assert_eq!(bodies, records);
        assert_eq!(reader.offset(), reader.file_size());
    }

    #[test]
    fn test_bad_magic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.000001");
        fs::write(&path, b"nope, not a log").unwrap();
        let err = LogReader::open(&path).err().unwrap();
        assert_eq!(err.code(), crate::wal::LogErrorCode::AeroLogCorruption);
    }

    #[test]
    fn test_truncated_tail_reported_at_record_start() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.000001");
        let mut bytes = build_file(&[RecordBody::begin(), RecordBody::Xid(1)], false);
        let full = bytes.len();
        bytes.truncate(full - 2);
        fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(!reader.is_in_use());
        assert!(reader.read_next().unwrap().is_some());
        let good = reader.offset();
        let err = reader.read_next().unwrap_err();
        assert_eq!(err.details(), Some(format!("byte_offset: {}", good).as_str()));
        assert_eq!(reader.offset(), good);
    }

    #[test]
    fn test_mispositioned_record_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.000001");
        let mut bytes = build_file(&[], false);
        // Encoded as if it lived at offset 0 instead of its real offset.
        bytes.extend(RecordBody::Xid(3).encode(1, 0, 0));
        fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.read_next().is_err());
    }
}
