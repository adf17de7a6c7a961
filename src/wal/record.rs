//! On-disk record format for log files
//!
//! A log file is the 4-byte magic followed by a format-description record
//! and then a stream of records. Every record is:
//!
//! ```text
//! +-----------+------+-----------+------------+---------+-------+------+-------+
//! | timestamp | type | server id | record len | end pos | flags | body | crc32 |
//! |   u32     |  u8  |    u32    |    u32     |   u32   |  u16  | ...  |  u32  |
//! +-----------+------+-----------+------------+---------+-------+------+-------+
//! ```
//!
//! All integers are little-endian. `record len` counts the whole record,
//! header and trailer included. `end pos` is the absolute file offset just
//! past the record; records buffered in a transaction cache carry a
//! cache-relative value that is rebased when the cache is written out.

use std::fmt;

use super::checksum::{record_checksum, verify_record_checksum};

/// Magic bytes at the start of every log file
pub const LOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];

/// Fixed record header length
pub const HEADER_LEN: usize = 19;
/// Offset of the record type byte
pub const TYPE_OFFSET: usize = 4;
/// Offset of the originating server id
pub const SERVER_ID_OFFSET: usize = 5;
/// Offset of the record length field
pub const RECORD_LEN_OFFSET: usize = 9;
/// Offset of the absolute end position field
pub const END_POS_OFFSET: usize = 13;
/// Offset of the flags field
pub const FLAGS_OFFSET: usize = 17;
/// Length of the checksum trailer
pub const CHECKSUM_LEN: usize = 4;
/// Smallest well-formed record
pub const MIN_RECORD_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Set on the format record while a process has the file open for writing
pub const FLAG_IN_USE: u16 = 0x0001;

/// Absolute file offset of the format record's flags field
pub const IN_USE_FLAG_POSITION: u64 = (LOG_MAGIC.len() + FLAGS_OFFSET) as u64;

/// Version written into every format-description record
pub const FORMAT_VERSION: u16 = 4;

/// Query text framing a transaction
pub const BEGIN_QUERY: &str = "BEGIN";
pub const COMMIT_QUERY: &str = "COMMIT";
pub const ROLLBACK_QUERY: &str = "ROLLBACK";

/// Record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Statement text, also used for BEGIN / COMMIT / ROLLBACK framing
    Query = 2,
    /// Written on clean shutdown
    Stop = 3,
    /// Names the next file; last record of a rotated file
    Rotate = 4,
    /// First record of every file
    FormatDescription = 15,
    /// Commit decision for a two-phase transaction
    Xid = 16,
    /// Changes were lost and replicas need manual intervention
    Incident = 26,
    /// Opaque batch of row changes for one table
    Rows = 30,
}

impl RecordType {
    /// Convert from u8, returns None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(RecordType::Query),
            3 => Some(RecordType::Stop),
            4 => Some(RecordType::Rotate),
            15 => Some(RecordType::FormatDescription),
            16 => Some(RecordType::Xid),
            26 => Some(RecordType::Incident),
            30 => Some(RecordType::Rows),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Kind of incident carried by an incident record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IncidentKind {
    /// Non-transactional changes were not captured in the log
    LostEvents = 1,
}

impl IncidentKind {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(IncidentKind::LostEvents),
            _ => None,
        }
    }
}

/// Why a byte sequence could not be decoded as a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the header or declared length require
    Truncated { needed: usize, available: usize },
    /// Type byte does not name a known record
    UnknownType(u8),
    /// Declared record length is impossible
    BadLength(u32),
    /// Body checksum does not match the trailer
    ChecksumMismatch,
    /// Body is shorter or longer than its type requires
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, available } => {
                write!(f, "truncated record: need {} bytes, have {}", needed, available)
            }
            DecodeError::UnknownType(t) => write!(f, "unknown record type {}", t),
            DecodeError::BadLength(len) => write!(f, "invalid record length {}", len),
            DecodeError::ChecksumMismatch => write!(f, "record checksum mismatch"),
            DecodeError::Malformed(what) => write!(f, "malformed record body: {}", what),
        }
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: u32,
    pub record_type: RecordType,
    pub server_id: u32,
    pub record_len: u32,
    pub end_pos: u32,
    pub flags: u16,
}

impl RecordHeader {
    /// Parses a header. Only the length and type are validated here.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let type_byte = buf[TYPE_OFFSET];
        let record_type =
            RecordType::from_u8(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
        let record_len = read_u32(buf, RECORD_LEN_OFFSET);
        if (record_len as usize) < MIN_RECORD_LEN {
            return Err(DecodeError::BadLength(record_len));
        }
        Ok(Self {
            timestamp: read_u32(buf, 0),
            record_type,
            server_id: read_u32(buf, SERVER_ID_OFFSET),
            record_len,
            end_pos: read_u32(buf, END_POS_OFFSET),
            flags: u16::from_le_bytes([buf[FLAGS_OFFSET], buf[FLAGS_OFFSET + 1]]),
        })
    }
}

/// Record payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    FormatDescription {
        version: u16,
        server_version: String,
        created: u32,
    },
    Query(String),
    Xid(u64),
    Rotate {
        next_file: String,
        position: u64,
    },
    Incident {
        kind: IncidentKind,
        message: String,
    },
    Rows {
        table_id: u64,
        row_count: u32,
        payload: Vec<u8>,
    },
    Stop,
}

impl RecordBody {
    pub fn begin() -> Self {
        RecordBody::Query(BEGIN_QUERY.to_string())
    }

    pub fn commit() -> Self {
        RecordBody::Query(COMMIT_QUERY.to_string())
    }

    pub fn rollback() -> Self {
        RecordBody::Query(ROLLBACK_QUERY.to_string())
    }

    /// Format record written at the start of each file
    pub fn format_description() -> Self {
        RecordBody::FormatDescription {
            version: FORMAT_VERSION,
            server_version: concat!("aerolog-", env!("CARGO_PKG_VERSION")).to_string(),
            created: now_timestamp(),
        }
    }

    /// Incident record for lost non-transactional changes
    pub fn lost_events(message: impl Into<String>) -> Self {
        RecordBody::Incident {
            kind: IncidentKind::LostEvents,
            message: message.into(),
        }
    }

    /// Returns the record type of this body
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordBody::FormatDescription { .. } => RecordType::FormatDescription,
            RecordBody::Query(_) => RecordType::Query,
            RecordBody::Xid(_) => RecordType::Xid,
            RecordBody::Rotate { .. } => RecordType::Rotate,
            RecordBody::Incident { .. } => RecordType::Incident,
            RecordBody::Rows { .. } => RecordType::Rows,
            RecordBody::Stop => RecordType::Stop,
        }
    }

    /// True for a BEGIN query
    pub fn is_begin(&self) -> bool {
        matches!(self, RecordBody::Query(q) if q == BEGIN_QUERY)
    }

    /// True for a COMMIT query
    pub fn is_commit(&self) -> bool {
        matches!(self, RecordBody::Query(q) if q == COMMIT_QUERY)
    }

    /// True for a ROLLBACK query
    pub fn is_rollback(&self) -> bool {
        matches!(self, RecordBody::Query(q) if q == ROLLBACK_QUERY)
    }

    /// Total encoded size of a record carrying this body
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_bytes().len() + CHECKSUM_LEN
    }

    /// Encodes a full record whose first byte lands at `start_pos`.
    ///
    /// `start_pos` is a file offset for records written directly and a
    /// cache offset for records buffered in a transaction cache.
    pub fn encode(&self, server_id: u32, flags: u16, start_pos: u64) -> Vec<u8> {
        let body = self.body_bytes();
        let record_len = (HEADER_LEN + body.len() + CHECKSUM_LEN) as u32;
        let end_pos = (start_pos as u32).wrapping_add(record_len);
        let record_type = self.record_type().as_u8();

        let mut out = Vec::with_capacity(record_len as usize);
        out.extend_from_slice(&now_timestamp().to_le_bytes());
        out.push(record_type);
        out.extend_from_slice(&server_id.to_le_bytes());
        out.extend_from_slice(&record_len.to_le_bytes());
        out.extend_from_slice(&end_pos.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&record_checksum(record_type, &body).to_le_bytes());
        out
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RecordBody::FormatDescription {
                version,
                server_version,
                created,
            } => {
                out.extend_from_slice(&version.to_le_bytes());
                put_str_u8(&mut out, server_version);
                out.extend_from_slice(&created.to_le_bytes());
                out.push(HEADER_LEN as u8);
            }
            RecordBody::Query(text) => out.extend_from_slice(text.as_bytes()),
            RecordBody::Xid(xid) => out.extend_from_slice(&xid.to_le_bytes()),
            RecordBody::Rotate {
                next_file,
                position,
            } => {
                out.extend_from_slice(&position.to_le_bytes());
                out.extend_from_slice(next_file.as_bytes());
            }
            RecordBody::Incident { kind, message } => {
                out.extend_from_slice(&(*kind as u16).to_le_bytes());
                put_str_u8(&mut out, message);
            }
            RecordBody::Rows {
                table_id,
                row_count,
                payload,
            } => {
                out.extend_from_slice(&table_id.to_le_bytes());
                out.extend_from_slice(&row_count.to_le_bytes());
                out.extend_from_slice(payload);
            }
            RecordBody::Stop => {}
        }
        out
    }

    fn decode_body(record_type: RecordType, body: &[u8]) -> Result<Self, DecodeError> {
        match record_type {
            RecordType::FormatDescription => {
                if body.len() < 3 {
                    return Err(DecodeError::Malformed("format description too short"));
                }
                let version = u16::from_le_bytes([body[0], body[1]]);
                let (server_version, rest) = take_str_u8(&body[2..])?;
                if rest.len() != 5 {
                    return Err(DecodeError::Malformed("format description trailer"));
                }
                Ok(RecordBody::FormatDescription {
                    version,
                    server_version,
                    created: read_u32(rest, 0),
                })
            }
            RecordType::Query => String::from_utf8(body.to_vec())
                .map(RecordBody::Query)
                .map_err(|_| DecodeError::Malformed("query text is not utf-8")),
            RecordType::Xid => {
                let bytes: [u8; 8] = body
                    .try_into()
                    .map_err(|_| DecodeError::Malformed("xid body must be 8 bytes"))?;
                Ok(RecordBody::Xid(u64::from_le_bytes(bytes)))
            }
            RecordType::Rotate => {
                if body.len() < 8 {
                    return Err(DecodeError::Malformed("rotate body too short"));
                }
                let position = read_u64(body, 0);
                let next_file = String::from_utf8(body[8..].to_vec())
                    .map_err(|_| DecodeError::Malformed("rotate file name is not utf-8"))?;
                Ok(RecordBody::Rotate {
                    next_file,
                    position,
                })
            }
            RecordType::Incident => {
                if body.len() < 2 {
                    return Err(DecodeError::Malformed("incident body too short"));
                }
                let kind = IncidentKind::from_u16(u16::from_le_bytes([body[0], body[1]]))
                    .ok_or(DecodeError::Malformed("unknown incident kind"))?;
                let (message, rest) = take_str_u8(&body[2..])?;
                if !rest.is_empty() {
                    return Err(DecodeError::Malformed("trailing bytes after incident"));
                }
                Ok(RecordBody::Incident { kind, message })
            }
            RecordType::Rows => {
                if body.len() < 12 {
                    return Err(DecodeError::Malformed("rows body too short"));
                }
                Ok(RecordBody::Rows {
                    table_id: read_u64(body, 0),
                    row_count: read_u32(body, 8),
                    payload: body[12..].to_vec(),
                })
            }
            RecordType::Stop => {
                if !body.is_empty() {
                    return Err(DecodeError::Malformed("stop record has a body"));
                }
                Ok(RecordBody::Stop)
            }
        }
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub header: RecordHeader,
    pub body: RecordBody,
}

impl LogRecord {
    /// Decodes one record from the front of `buf`.
    ///
    /// Returns the record and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let header = RecordHeader::parse(buf)?;
        let len = header.record_len as usize;
        if buf.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }
        let body = &buf[HEADER_LEN..len - CHECKSUM_LEN];
        let stored = read_u32(buf, len - CHECKSUM_LEN);
        if !verify_record_checksum(header.record_type.as_u8(), body, stored) {
            return Err(DecodeError::ChecksumMismatch);
        }
        let body = RecordBody::decode_body(header.record_type, body)?;
        Ok((Self { header, body }, len))
    }
}

/// Seconds since the epoch, truncated to the 32-bit header field
pub(crate) fn now_timestamp() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_str_u8(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

fn take_str_u8(buf: &[u8]) -> Result<(String, &[u8]), DecodeError> {
    let len = *buf.first().ok_or(DecodeError::Malformed("missing string length"))? as usize;
    if buf.len() < 1 + len {
        return Err(DecodeError::Malformed("string overruns body"));
    }
    let s = String::from_utf8(buf[1..1 + len].to_vec())
        .map_err(|_| DecodeError::Malformed("string is not utf-8"))?;
    Ok((s, &buf[1 + len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_roundtrip() {
        for t in [
            RecordType::Query,
            RecordType::Stop,
            RecordType::Rotate,
            RecordType::FormatDescription,
            RecordType::Xid,
            RecordType::Incident,
            RecordType::Rows,
        ] {
            assert_eq!(RecordType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(255), None);
    }

    #[test]
    fn test_end_pos_is_start_plus_len() {
        let body = RecordBody::Xid(77);
        let bytes = body.encode(9, 0, 1000);
        let (record, used) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(record.header.end_pos as usize, 1000 + bytes.len());
        assert_eq!(record.header.server_id, 9);
        assert_eq!(record.body, RecordBody::Xid(77));
    }

    #[test]
    fn test_encoded_len_matches() {
        let body = RecordBody::Rows {
            table_id: 3,
            row_count: 2,
            payload: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(body.encoded_len(), body.encode(1, 0, 0).len());
    }

    #[test]
    fn test_framing_predicates() {
        assert!(RecordBody::begin().is_begin());
        assert!(RecordBody::commit().is_commit());
        assert!(RecordBody::rollback().is_rollback());
        assert!(!RecordBody::Query("INSERT".into()).is_begin());
    }

    #[test]
    fn test_in_use_flag_position_targets_format_flags() {
        let mut file = LOG_MAGIC.to_vec();
        file.extend(RecordBody::format_description().encode(1, FLAG_IN_USE, 4));
        let at = IN_USE_FLAG_POSITION as usize;
        assert_eq!(u16::from_le_bytes([file[at], file[at + 1]]), FLAG_IN_USE);
    }

    #[test]
    fn test_truncated_record_detected() {
        let bytes = RecordBody::Query("INSERT INTO t VALUES (1)".into()).encode(1, 0, 0);
        let err = LogRecord::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
        let err = LogRecord::decode(&bytes[..10]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_corrupt_body_detected() {
        let mut bytes = RecordBody::Xid(5).encode(1, 0, 0);
        bytes[HEADER_LEN] ^= 0xff;
        assert_eq!(
            LogRecord::decode(&bytes).unwrap_err(),
            DecodeError::ChecksumMismatch
        );
    }

    #[test]
    fn test_rewritten_end_pos_keeps_checksum_valid() {
        let mut bytes = RecordBody::Xid(5).encode(1, 0, 0);
        bytes[END_POS_OFFSET..END_POS_OFFSET + 4].copy_from_slice(&4242u32.to_le_bytes());
        let (record, _) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(record.header.end_pos, 4242);
    }

    #[test]
    fn test_incident_and_rotate_bodies() {
        for body in [
            RecordBody::lost_events("non-transactional table changed"),
            RecordBody::Rotate {
                next_file: "aerolog-bin.000002".into(),
                position: 4,
            },
            RecordBody::Stop,
        ] {
            let (record, _) = LogRecord::decode(&body.encode(1, 0, 0)).unwrap();
            assert_eq!(record.body, body);
        }
    }
}
