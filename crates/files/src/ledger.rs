//! Per-node metadata ledger persisted as a JSON array.
//!
//! The ledger lives at `<dir>/<node-id>`. Reads are served from an
//! in-memory snapshot; appends are serialized through a single writer and
//! rewrite the whole file through a temp file + rename so readers of the
//! file never observe a partial write.

use crate::content_id::ContentId;
use crate::record::MetadataRecord;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("ledger {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("encode ledger: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A record for the same content identifier already exists; nothing changed.
    Duplicate,
}

/// Location of the ledger for `node_id` inside `dir`.
pub fn ledger_path(dir: &Path, node_id: &str) -> PathBuf {
    dir.join(node_id)
}

/// Read a ledger file. A missing file is an empty ledger.
pub fn read_ledger(path: &Path) -> Result<Vec<MetadataRecord>, LedgerError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&raw).map_err(|source| LedgerError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn persist_ledger(path: &Path, records: &[MetadataRecord]) -> Result<(), LedgerError> {
    let parent = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let write_err = |source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(&parent).map_err(write_err)?;

    let encoded = serde_json::to_vec_pretty(records)?;

    let mut temp = NamedTempFile::new_in(&parent).map_err(write_err)?;
    temp.write_all(&encoded).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}

/// Shared handle to one node's ledger.
#[derive(Clone)]
pub struct MetadataLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    path: PathBuf,
    snapshot: RwLock<Arc<Vec<MetadataRecord>>>,
    writer: Mutex<()>,
}

impl MetadataLedger {
    /// Load the ledger of `node_id` from `dir`.
    pub fn open(dir: &Path, node_id: &str) -> Result<Self, LedgerError> {
        Self::open_path(ledger_path(dir, node_id))
    }

    pub fn open_path(path: PathBuf) -> Result<Self, LedgerError> {
        let records = read_ledger(&path)?;
        debug!(path = %path.display(), records = records.len(), "loaded metadata ledger");
        Ok(Self {
            inner: Arc::new(LedgerInner {
                path,
                snapshot: RwLock::new(Arc::new(records)),
                writer: Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current records in insertion order.
    pub fn records(&self) -> Arc<Vec<MetadataRecord>> {
        self.inner.snapshot.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `record` unless its content identifier is already present.
    pub fn append(&self, record: MetadataRecord) -> Result<AppendOutcome, LedgerError> {
        record.validate().map_err(LedgerError::InvalidRecord)?;

        let _guard = self.inner.writer.lock();
        let current = self.records();

        if current.iter().any(|existing| existing.cid == record.cid) {
            debug!(cid = %record.cid, "ledger already holds record");
            return Ok(AppendOutcome::Duplicate);
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(record);

        persist_ledger(&self.inner.path, &next)?;
        *self.inner.snapshot.write() = Arc::new(next);

        Ok(AppendOutcome::Appended)
    }

    /// File path of the first record for `cid`.
    pub fn lookup_by_identifier(&self, cid: &ContentId) -> Option<PathBuf> {
        self.inner
            .snapshot
            .read()
            .iter()
            .find(|record| &record.cid == cid)
            .map(|record| record.file_path.clone())
    }

    /// Every record whose identifier equals `cid`.
    pub fn records_for(&self, cid: &ContentId) -> Vec<MetadataRecord> {
        self.inner
            .snapshot
            .read()
            .iter()
            .filter(|record| &record.cid == cid)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn record_for(data: &[u8], dir: &Path, price: &str) -> MetadataRecord {
        MetadataRecord::new(
            ContentId::from_data(data).unwrap(),
            "test file",
            Decimal::from_str(price).unwrap(),
            dir.join("file.bin"),
            "wallet",
        )
    }

    #[test]
    fn missing_ledger_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "114573476").unwrap();
        assert!(ledger.is_empty());
        assert!(read_ledger(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn stored_prices_reload_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();
        let prices = ["0", "0.1", "2.50", "19.99", "123456.789"];
        for (i, price) in prices.iter().enumerate() {
            let record = record_for(format!("item {i}").as_bytes(), dir.path(), price);
            ledger.append(record).unwrap();
        }

        let too_precise = record_for(b"precise", dir.path(), "12345678901234567.89");
        assert!(matches!(
            ledger.append(too_precise),
            Err(LedgerError::InvalidRecord(_))
        ));

        let reloaded = MetadataLedger::open(dir.path(), "node").unwrap();
        let reloaded_prices: Vec<Decimal> =
            reloaded.records().iter().map(|record| record.price).collect();
        let expected: Vec<Decimal> = prices
            .iter()
            .map(|price| Decimal::from_str(price).unwrap())
            .collect();
        assert_eq!(reloaded_prices, expected);
    }

    #[test]
    fn malformed_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("node"), b"{ not json").unwrap();
        let err = MetadataLedger::open(dir.path(), "node").err().unwrap();
        assert!(matches!(err, LedgerError::Malformed { .. }));
    }

    #[test]
    fn append_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();
        let record = record_for(b"alpha", dir.path(), "2.50");

        assert_eq!(
            ledger.append(record.clone()).unwrap(),
            AppendOutcome::Appended
        );

        let reloaded = MetadataLedger::open(dir.path(), "node").unwrap();
        assert_eq!(reloaded.records().as_slice(), &[record.clone()]);
        assert_eq!(
            reloaded.lookup_by_identifier(&record.cid),
            Some(record.file_path.clone())
        );
    }

    #[test]
    fn duplicate_identifier_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();
        let first = record_for(b"same bytes", dir.path(), "1");
        let mut second = first.clone();
        second.description = "another description".into();

        assert_eq!(ledger.append(first.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(ledger.append(second).unwrap(), AppendOutcome::Duplicate);

        let on_disk = read_ledger(ledger.path()).unwrap();
        assert_eq!(on_disk, vec![first]);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn lookup_of_unknown_identifier_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();
        ledger.append(record_for(b"known", dir.path(), "1")).unwrap();

        let unknown = ContentId::from_data(b"unknown").unwrap();
        assert_eq!(ledger.lookup_by_identifier(&unknown), None);
        assert!(ledger.records_for(&unknown).is_empty());
    }

    #[test]
    fn invalid_record_is_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();
        let record = record_for(b"negative", dir.path(), "-3");

        let err = ledger.append(record).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecord(_)));
        assert!(!ledger.path().exists());
    }

    #[test]
    fn concurrent_appends_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "node").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                let base = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let data = format!("content-{i}");
                    ledger
                        .append(record_for(data.as_bytes(), &base, "1"))
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), AppendOutcome::Appended);
        }

        assert_eq!(read_ledger(ledger.path()).unwrap().len(), 8);
    }
}
