//! Log index and purge-intent file
//!
//! The index is a newline-terminated list of log file names, oldest first.
//! A name is appended only after its file has been created, header written
//! and synced. Names are removed only after the file has been unlinked.
//!
//! Purges first record the files they are about to delete in a scratch
//! file (`<base>.~rec~`). If the process dies mid-purge the scratch file
//! survives and the next open finishes the job.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::errors::{LogError, LogResult};

/// Number of digits in a log file's numeric extension
const SEQ_DIGITS: usize = 6;

/// In-memory view of the index file
#[derive(Debug)]
pub struct LogIndex {
    dir: PathBuf,
    base_name: String,
    entries: Vec<String>,
}

impl LogIndex {
    /// Opens the index in `dir`, creating the directory and an empty index if missing.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_INDEX_FAILED` if the directory or index cannot be
    /// created or read.
    pub fn open(dir: &Path, base_name: &str) -> LogResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            LogError::index_failed(format!("Failed to create log directory: {}", dir.display()), e)
        })?;

        let mut index = Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            entries: Vec::new(),
        };

        let path = index.index_path();
        match read_entries(&path)? {
            Some(entries) => index.entries = entries,
            None => index.write_atomically(&path, &[])?,
        }
        Ok(index)
    }

    /// Reads an existing index without creating the directory or the file.
    ///
    /// Returns `None` if there is no index yet.
    pub fn read_existing(dir: &Path, base_name: &str) -> LogResult<Option<Self>> {
        let mut index = Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            entries: Vec::new(),
        };
        match read_entries(&index.index_path())? {
            Some(entries) => {
                index.entries = entries;
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Directory holding the log files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Path of the index file
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.index", self.base_name))
    }

    /// Path of the purge-intent scratch file
    pub fn purge_intent_path(&self) -> PathBuf {
        self.dir.join(format!("{}.~rec~", self.base_name))
    }

    /// Full path of a log file named in the index
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Indexed names, oldest first
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn first(&self) -> Option<&str> {
        self.entries.first().map(String::as_str)
    }

    /// Newest indexed file. While a writer is open this is its active file.
    pub fn last(&self) -> Option<&str> {
        self.entries.last().map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e == name)
    }

    /// Name for the next log file.
    ///
    /// One past the highest sequence found in the index or on disk, so a
    /// file left behind by an interrupted creation is never overwritten.
    pub fn next_file_name(&self) -> LogResult<String> {
        let mut max_seq = self
            .entries
            .iter()
            .filter_map(|name| self.sequence_of(name))
            .max()
            .unwrap_or(0);

        let listing = fs::read_dir(&self.dir).map_err(|e| {
            LogError::index_failed(format!("Failed to list log directory: {}", self.dir.display()), e)
        })?;
        for entry in listing.flatten() {
            if let Some(seq) = entry.file_name().to_str().and_then(|n| self.sequence_of(n)) {
                max_seq = max_seq.max(seq);
            }
        }

        Ok(format!(
            "{}.{:0width$}",
            self.base_name,
            max_seq + 1,
            width = SEQ_DIGITS
        ))
    }

    /// Parses the numeric extension of `<base>.NNNNNN`
    pub fn sequence_of(&self, name: &str) -> Option<u64> {
        let ext = name.strip_prefix(&self.base_name)?.strip_prefix('.')?;
        if ext.len() < SEQ_DIGITS || !ext.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        ext.parse().ok()
    }

    /// Appends a name and syncs the index before returning
    pub fn append(&mut self, name: &str) -> LogResult<()> {
        let path = self.index_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                LogError::index_failed(format!("Failed to open log index: {}", path.display()), e)
            })?;
        file.write_all(format!("{}\n", name).as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                LogError::index_failed(format!("Failed to append {} to log index", name), e)
            })?;
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Drops `names` from the index and rewrites it atomically
    pub fn remove(&mut self, names: &[String]) -> LogResult<()> {
        let kept: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !names.contains(e))
            .cloned()
            .collect();
        let path = self.index_path();
        self.write_atomically(&path, &kept)?;
        self.entries = kept;
        Ok(())
    }

    /// Empties the index
    pub fn clear(&mut self) -> LogResult<()> {
        let path = self.index_path();
        self.write_atomically(&path, &[])?;
        self.entries.clear();
        Ok(())
    }

    /// Records the files a purge is about to delete and syncs the record
    pub fn write_purge_intent(&self, names: &[String]) -> LogResult<()> {
        let path = self.purge_intent_path();
        self.write_atomically(&path, names)
    }

    /// Reads a purge intent left behind by an interrupted purge
    pub fn read_purge_intent(&self) -> LogResult<Option<Vec<String>>> {
        let path = self.purge_intent_path();
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LogError::purge_failed(
                format!("Failed to read purge intent: {}", path.display()),
                e,
            )),
        }
    }

    /// Removes the purge intent; a missing file is not an error
    pub fn remove_purge_intent(&self) -> LogResult<()> {
        let path = self.purge_intent_path();
        match fs::remove_file(&path) {
            Ok(()) => sync_dir(&self.dir)
                .map_err(|e| LogError::purge_failed("Failed to sync log directory", e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::purge_failed(
                format!("Failed to remove purge intent: {}", path.display()),
                e,
            )),
        }
    }

    /// Writes `lines` to a temporary file, syncs it and renames it over `path`
    fn write_atomically(&self, path: &Path, lines: &[String]) -> LogResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            sync_dir(&self.dir)
        })();
        result.map_err(|e| LogError::index_failed(format!("Failed to rewrite {}", path.display()), e))
    }
}

fn read_entries(path: &Path) -> LogResult<Option<Vec<String>>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LogError::index_failed(
            format!("Failed to read log index: {}", path.display()),
            e,
        )),
    }
}

/// fsyncs a directory so renames and unlinks inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
