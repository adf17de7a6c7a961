//! Per-session transaction cache
//!
//! Records produced by a transaction are buffered here, encoded in the final
//! on-disk format but with end positions relative to the start of the cache.
//! The log writer rebases those positions when the cache is copied into a
//! log file.
//!
//! Offset 0 always means "nothing buffered". The statement mark remembers
//! where the first open statement began so a failed statement can be undone
//! without discarding the rest of the transaction.

use super::errors::{LogError, LogResult};
use super::record::RecordBody;

/// An open, not yet encoded batch of row changes for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBatch {
    table_id: u64,
    row_count: u32,
    payload: Vec<u8>,
}

impl RowBatch {
    pub fn new(table_id: u64) -> Self {
        Self {
            table_id,
            row_count: 0,
            payload: Vec::new(),
        }
    }

    /// Appends one opaque row image
    pub fn add_row(&mut self, row: &[u8]) {
        self.payload.extend_from_slice(row);
        self.row_count += 1;
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// Bytes of row data buffered so far
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn into_body(self) -> RecordBody {
        RecordBody::Rows {
            table_id: self.table_id,
            row_count: self.row_count,
            payload: self.payload,
        }
    }
}

/// Buffer of a transaction's records before they become durable.
///
/// Owned by exactly one session for its whole life.
#[derive(Debug)]
pub struct TransactionCache {
    buffer: Vec<u8>,
    statement_mark: Option<u64>,
    pending: Option<RowBatch>,
    incident: bool,
    committed_at_least_one_statement: bool,
    server_id: u32,
    max_size: u64,
}

impl TransactionCache {
    /// Creates an empty cache.
    ///
    /// # Arguments
    ///
    /// * `server_id` - Originating server id stamped on every buffered record
    /// * `max_size` - Upper bound on buffered bytes
    pub fn new(server_id: u32, max_size: u64) -> Self {
        Self {
            buffer: Vec::new(),
            statement_mark: None,
            pending: None,
            incident: false,
            committed_at_least_one_statement: false,
            server_id,
            max_size,
        }
    }

    /// Current length of the encoded buffer
    pub fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// True if nothing is buffered and no row batch is open
    pub fn is_empty(&self) -> bool {
        self.pending.is_none() && self.buffer.is_empty()
    }

    /// Encoded records with cache-relative end positions
    pub fn contents(&self) -> &[u8] {
        &self.buffer
    }

    /// Encodes and appends one record.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_CACHE_FULL` if the record would exceed the size limit.
    /// The cache is left unchanged in that case.
    pub fn append(&mut self, body: &RecordBody) -> LogResult<()> {
        let encoded = body.encode(self.server_id, 0, self.position());
        if self.position() + encoded.len() as u64 > self.max_size {
            return Err(LogError::cache_full(self.max_size));
        }
        self.buffer.extend_from_slice(&encoded);
        Ok(())
    }

    /// Appends a statement-text record
    pub fn append_query(&mut self, text: impl Into<String>) -> LogResult<()> {
        self.append(&RecordBody::Query(text.into()))
    }

    /// Adds a row to the open batch, starting a new batch when the table changes.
    ///
    /// The previous batch is encoded into the buffer before a new one opens.
    pub fn add_row(&mut self, table_id: u64, row: &[u8]) -> LogResult<()> {
        if self.pending.as_ref().map(|b| b.table_id()) != Some(table_id) {
            self.flush_pending()?;
            self.pending = Some(RowBatch::new(table_id));
        }
        if let Some(batch) = self.pending.as_mut() {
            batch.add_row(row);
        }
        Ok(())
    }

    /// The open row batch, if any
    pub fn pending_rows(&self) -> Option<&RowBatch> {
        self.pending.as_ref()
    }

    /// Encodes the open row batch into the buffer.
    ///
    /// On failure the batch is discarded so the cache never holds a batch
    /// that can no longer be written.
    pub fn flush_pending(&mut self) -> LogResult<()> {
        match self.pending.take() {
            Some(batch) => self.append(&batch.into_body()),
            None => Ok(()),
        }
    }

    /// Discards the open row batch and everything buffered after `pos`.
    ///
    /// A statement mark beyond `pos` no longer points inside the buffer and
    /// becomes undefined.
    pub fn truncate(&mut self, pos: u64) {
        self.pending = None;
        let pos = pos.min(self.position());
        self.buffer.truncate(pos as usize);
        if matches!(self.statement_mark, Some(mark) if pos < mark) {
            self.statement_mark = None;
        }
        self.committed_at_least_one_statement = pos > 0;
    }

    /// Empties the cache for reuse by the next transaction
    pub fn reset(&mut self) {
        self.truncate(0);
        self.statement_mark = None;
        self.incident = false;
        debug_assert!(self.is_empty());
    }

    /// Remembers the current position as the rollback point of the open statement.
    ///
    /// Only the first call wins until the mark is cleared.
    pub fn mark_statement_begin(&mut self) {
        if self.statement_mark.is_none() {
            self.statement_mark = Some(self.position());
        }
    }

    pub fn statement_mark(&self) -> Option<u64> {
        self.statement_mark
    }

    /// Closes the open statement, keeping its records
    pub fn end_statement(&mut self) {
        self.statement_mark = None;
        self.committed_at_least_one_statement = self.position() > 0;
    }

    /// Flags a non-transactional change that cannot be rolled back
    pub fn set_incident(&mut self) {
        self.incident = true;
    }

    pub fn has_incident(&self) -> bool {
        self.incident
    }

    pub fn committed_at_least_one_statement(&self) -> bool {
        self.committed_at_least_one_statement
    }
}
