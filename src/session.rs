//! Per-connection transaction state
//!
//! A session owns its transaction cache (created on first use), the commit
//! ticket issued by the last XID write, and the savepoints of the open
//! transaction. It decides how a transaction ends in the log:
//!
//! | End                | Non-transactional changes | Incident flagged | Written             |
//! |--------------------|---------------------------|------------------|---------------------|
//! | commit             | any                       | any              | BEGIN..COMMIT       |
//! | rollback           | yes                       | any              | BEGIN..ROLLBACK     |
//! | rollback           | no                        | yes              | incident record     |
//! | rollback           | no                        | no               | nothing             |
//!
//! Whether changes were non-transactional is decided by the caller.

use crate::config::LogConfig;
use crate::wal::{LogError, LogResult, LogWriter, Marker, Ticket, TransactionCache, WriteReceipt};

pub struct Session {
    server_id: u32,
    max_cache_size: u64,
    cache: Option<TransactionCache>,
    ticket: Option<Ticket>,
    ordering_required: bool,
    /// Savepoint name and cache position before its SAVEPOINT record
    savepoints: Vec<(String, u64)>,
}

impl Session {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            server_id: config.server_id,
            max_cache_size: config.max_cache_size,
            cache: None,
            ticket: None,
            ordering_required: false,
            savepoints: Vec::new(),
        }
    }

    /// The cache, if the session has logged anything yet
    pub fn cache(&self) -> Option<&TransactionCache> {
        self.cache.as_ref()
    }

    /// The cache, created on first use
    pub fn cache_mut(&mut self) -> &mut TransactionCache {
        let (server_id, max_size) = (self.server_id, self.max_cache_size);
        self.cache
            .get_or_insert_with(|| TransactionCache::new(server_id, max_size))
    }

    // ==================== Statements ====================

    /// Marks the start of a statement so it can be undone on its own
    pub fn begin_statement(&mut self) {
        self.cache_mut().mark_statement_begin();
    }

    /// Buffers a statement's text
    pub fn log_statement(&mut self, text: &str) -> LogResult<()> {
        let cache = self.cache_mut();
        cache.mark_statement_begin();
        cache.append_query(text)
    }

    /// Buffers row images changed by a statement
    pub fn log_rows(&mut self, table_id: u64, rows: &[&[u8]]) -> LogResult<()> {
        let cache = self.cache_mut();
        cache.mark_statement_begin();
        rows.iter().try_for_each(|row| cache.add_row(table_id, row))
    }

    /// Keeps the open statement's records
    pub fn commit_statement(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.end_statement();
        }
    }

    /// Discards the open statement's records.
    ///
    /// `incident` flags the transaction when the statement changed
    /// something that cannot be undone; the flag produces an incident
    /// record when the transaction ends.
    pub fn rollback_statement(&mut self, incident: bool) {
        if let Some(cache) = self.cache.as_mut() {
            if let Some(mark) = cache.statement_mark() {
                cache.truncate(mark);
            }
            cache.end_statement();
            if incident {
                cache.set_incident();
            }
        }
    }

    // ==================== Transactions ====================

    /// Writes the transaction framed by BEGIN and COMMIT
    pub fn commit(&mut self, writer: &LogWriter) -> LogResult<WriteReceipt> {
        self.savepoints.clear();
        let ordering_required = self.ordering_required;
        match self.cache.as_mut() {
            Some(cache) => writer.write(cache, Marker::Commit, false, ordering_required),
            None => Ok(WriteReceipt::nothing_written()),
        }
    }

    /// Ends the transaction without committing it.
    ///
    /// With `non_transactional_changed` the buffered records are written
    /// framed by BEGIN and ROLLBACK, since their effects persist anyway.
    pub fn rollback(
        &mut self,
        writer: &LogWriter,
        non_transactional_changed: bool,
    ) -> LogResult<WriteReceipt> {
        self.savepoints.clear();
        let cache = match self.cache.as_mut() {
            Some(cache) => cache,
            None => return Ok(WriteReceipt::nothing_written()),
        };

        if non_transactional_changed {
            writer.write(cache, Marker::Rollback, false, false)
        } else if cache.has_incident() {
            cache.truncate(0);
            writer.write(cache, Marker::Rollback, false, false)
        } else {
            cache.reset();
            Ok(WriteReceipt::nothing_written())
        }
    }

    // ==================== Savepoints ====================

    /// Records a savepoint, replacing one of the same name
    pub fn set_savepoint(&mut self, name: &str) -> LogResult<()> {
        let cache = self.cache_mut();
        cache.flush_pending()?;
        let pos = cache.position();
        cache.append_query(format!("SAVEPOINT {}", name))?;

        self.savepoints.retain(|(n, _)| n != name);
        self.savepoints.push((name.to_string(), pos));
        Ok(())
    }

    /// Undoes everything logged after the savepoint.
    ///
    /// With `non_transactional_changed` nothing is removed and a
    /// `ROLLBACK TO` record is appended instead. Savepoints set after this
    /// one are forgotten. Returns false if the savepoint is unknown.
    pub fn rollback_to_savepoint(
        &mut self,
        name: &str,
        non_transactional_changed: bool,
    ) -> LogResult<bool> {
        let at = match self.savepoints.iter().position(|(n, _)| n == name) {
            Some(at) => at,
            None => return Ok(false),
        };
        let pos = self.savepoints[at].1;
        self.savepoints.truncate(at + 1);

        let cache = self.cache_mut();
        if non_transactional_changed {
            cache.flush_pending()?;
            cache.append_query(format!("ROLLBACK TO {}", name))?;
        } else {
            cache.truncate(pos);
        }
        Ok(true)
    }

    pub fn savepoint_names(&self) -> Vec<&str> {
        self.savepoints.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub(crate) fn clear_savepoints(&mut self) {
        self.savepoints.clear();
    }

    // ==================== Commit Order ====================

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn set_ticket(&mut self, ticket: Option<Ticket>) {
        self.ticket = ticket;
    }

    pub fn take_ticket(&mut self) -> Option<Ticket> {
        self.ticket.take()
    }

    pub fn ordering_required(&self) -> bool {
        self.ordering_required
    }

    pub fn set_ordering_required(&mut self, required: bool) {
        self.ordering_required = required;
    }

    /// Ends the session.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_CACHE_NOT_EMPTY` if records were buffered but never
    /// committed or rolled back.
    pub fn close(self) -> LogResult<()> {
        match self.cache {
            Some(cache) if !cache.is_empty() => Err(LogError::cache_not_empty(cache.position())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsRegistry;
    use crate::wal::{LogErrorCode, LogReader, LogRecord, RecordBody};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_writer(dir: &Path) -> LogWriter {
        LogWriter::open(LogConfig::in_dir(dir), Arc::new(MetricsRegistry::new())).unwrap()
    }

    fn written(writer: &LogWriter) -> Vec<LogRecord> {
        let name = writer.active_file().unwrap();
        let mut reader = LogReader::open(&writer.file_path(&name)).unwrap();
        reader.read_all().unwrap().into_iter().map(|(_, r)| r).collect()
    }

    fn queries(records: &[LogRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match &r.body {
                RecordBody::Query(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    fn incidents(records: &[LogRecord]) -> usize {
        records
            .iter()
            .filter(|r| matches!(r.body, RecordBody::Incident { .. }))
            .count()
    }

    // ==================== Statement Tests ====================

    #[test]
    fn test_cache_created_lazily() {
        let mut session = Session::new(&LogConfig::default());
        assert!(session.cache().is_none());
        session.begin_statement();
        assert!(session.cache().is_some());
        assert!(session.cache().unwrap().is_empty());
    }

    #[test]
    fn test_statement_rollback_keeps_earlier_statements() {
        let mut session = Session::new(&LogConfig::default());
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        session.commit_statement();
        let kept = session.cache().unwrap().position();

        session.log_statement("INSERT INTO t VALUES (2)").unwrap();
        session.log_rows(7, &[b"row-a", b"row-b"]).unwrap();
        session.rollback_statement(false);

        let cache = session.cache().unwrap();
        assert_eq!(cache.position(), kept);
        assert!(cache.pending_rows().is_none());
        assert!(cache.statement_mark().is_none());
        assert!(cache.committed_at_least_one_statement());
        assert!(!cache.has_incident());
    }

    #[test]
    fn test_statement_rollback_with_incident() {
        let mut session = Session::new(&LogConfig::default());
        session.log_statement("UPDATE t SET a = 1").unwrap();
        session.rollback_statement(true);
        assert!(session.cache().unwrap().is_empty());
        assert!(session.cache().unwrap().has_incident());
    }

    // ==================== Transaction Tests ====================

    #[test]
    fn test_commit_writes_framed_transaction() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        session.commit_statement();

        let receipt = session.commit(&writer).unwrap();
        assert!(receipt.bytes > 0);
        assert!(receipt.ticket.is_none());
        assert!(session.cache().unwrap().is_empty());
        assert_eq!(
            queries(&written(&writer)),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
        );
        session.close().unwrap();
    }

    #[test]
    fn test_commit_without_cache_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        let before = writer.position();
        assert_eq!(session.commit(&writer).unwrap().bytes, 0);
        assert_eq!(writer.position(), before);
    }

    #[test]
    fn test_plain_rollback_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let before = writer.position();
        let mut session = Session::new(writer.config());
        session.log_statement("DELETE FROM t").unwrap();

        let receipt = session.rollback(&writer, false).unwrap();
        assert_eq!(receipt.bytes, 0);
        assert_eq!(writer.position(), before);
        assert!(session.cache().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_with_non_transactional_changes() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        session.log_statement("INSERT INTO myisam_t VALUES (1)").unwrap();
        session.commit_statement();

        session.rollback(&writer, true).unwrap();
        assert_eq!(
            queries(&written(&writer)),
            vec!["BEGIN", "INSERT INTO myisam_t VALUES (1)", "ROLLBACK"]
        );
    }

    #[test]
    fn test_rollback_with_incident_writes_only_incident() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        session.commit_statement();
        session.log_statement("UPDATE mixed SET a = 2").unwrap();
        session.rollback_statement(true);

        session.rollback(&writer, false).unwrap();
        let records = written(&writer);
        assert!(queries(&records).is_empty());
        assert_eq!(incidents(&records), 1);
        assert!(!session.cache().unwrap().has_incident());
    }

    #[test]
    fn test_close_refuses_buffered_records() {
        let mut session = Session::new(&LogConfig::default());
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        let err = session.close().unwrap_err();
        assert_eq!(err.code(), LogErrorCode::AeroLogCacheNotEmpty);

        let session = Session::new(&LogConfig::default());
        session.close().unwrap();
    }

    // ==================== Savepoint Tests ====================

    #[test]
    fn test_rollback_to_savepoint_truncates() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        session.commit_statement();
        session.set_savepoint("sp1").unwrap();
        session.log_statement("INSERT INTO t VALUES (2)").unwrap();
        session.commit_statement();
        session.set_savepoint("sp2").unwrap();

        assert!(session.rollback_to_savepoint("sp1", false).unwrap());
        assert_eq!(session.savepoint_names(), vec!["sp1"]);
        assert!(!session.rollback_to_savepoint("sp2", false).unwrap());

        session.commit(&writer).unwrap();
        assert_eq!(
            queries(&written(&writer)),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
        );
        assert!(session.savepoint_names().is_empty());
    }

    #[test]
    fn test_rollback_to_savepoint_with_non_transactional_changes() {
        let tmp = TempDir::new().unwrap();
        let writer = open_writer(tmp.path());
        let mut session = Session::new(writer.config());
        session.set_savepoint("a").unwrap();
        session.log_statement("INSERT INTO myisam_t VALUES (1)").unwrap();
        session.commit_statement();

        assert!(session.rollback_to_savepoint("a", true).unwrap());
        session.commit(&writer).unwrap();
        assert_eq!(
            queries(&written(&writer)),
            vec![
                "BEGIN",
                "SAVEPOINT a",
                "INSERT INTO myisam_t VALUES (1)",
                "ROLLBACK TO a",
                "COMMIT"
            ]
        );
    }

    #[test]
    fn test_savepoint_name_reuse_moves_it() {
        let mut session = Session::new(&LogConfig::default());
        session.set_savepoint("x").unwrap();
        session.set_savepoint("y").unwrap();
        session.set_savepoint("x").unwrap();
        assert_eq!(session.savepoint_names(), vec!["y", "x"]);
    }
}
