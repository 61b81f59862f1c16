//! JSONL append-only log, used for the sync operation audit trail

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Append-only JSON-lines file of `T` entries
pub struct JsonlLog<T> {
    path: PathBuf,
    // Serializes appends from concurrent sync passes
    write_lock: Mutex<()>,
    _entry: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    /// Open (or create on first append) the log at `path`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            _entry: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, returning its byte offset
    pub fn append(&self, entry: &T) -> Result<u64> {
        let _guard = self.write_lock.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        // Get current offset before writing
        let offset = file.seek(SeekFrom::End(0))?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;

        Ok(offset)
    }

    /// Read every entry in the log
    pub fn read_all(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }

        Ok(entries)
    }

    /// Read the last N entries
    pub fn read_last_n(&self, n: usize) -> Result<Vec<T>> {
        let mut all = self.read_all()?;
        let start = all.len().saturating_sub(n);
        Ok(all.split_off(start))
    }

    /// Count entries in the log
    pub fn count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        Ok(reader
            .lines()
            .filter(|l| l.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(false))
            .count())
    }

    /// Size of the log file in bytes
    pub fn file_size(&self) -> Result<u64> {
        if self.path.exists() {
            Ok(std::fs::metadata(&self.path)?.len())
        } else {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: u32,
    }

    #[test]
    fn append_and_read_back_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log: JsonlLog<Entry> = JsonlLog::new(dir.path().join("ops.jsonl")).unwrap();
        assert_eq!(log.count().unwrap(), 0);
        assert!(log.read_all().unwrap().is_empty());

        for seq in 0..5 {
            log.append(&Entry { seq }).unwrap();
        }

        assert_eq!(log.count().unwrap(), 5);
        let tail = log.read_last_n(2).unwrap();
        assert_eq!(tail, vec![Entry { seq: 3 }, Entry { seq: 4 }]);
        assert!(log.file_size().unwrap() > 0);
    }
}
