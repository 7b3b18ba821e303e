//! Append-only persistence boundary.
//!
//! Every record has a write-once key. Status changes are appended as their
//! own records so nothing is ever updated in place.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{
    ClassificationPass, ExecutionSignal, OperationId, OperationStatus, UserFeedback,
    VerificationResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Operation {
        id: OperationId,
        parent: Option<OperationId>,
        request: String,
        created_at: DateTime<Utc>,
    },
    Pass {
        operation_id: OperationId,
        request: String,
        pass: ClassificationPass,
        recorded_at: DateTime<Utc>,
    },
    Verification {
        operation_id: OperationId,
        result: VerificationResult,
    },
    Status {
        operation_id: OperationId,
        seq: u32,
        status: OperationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Feedback(UserFeedback),
    ExecutionSignal(ExecutionSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Operation,
    Pass,
    Verification,
    Status,
    Feedback,
    ExecutionSignal,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Operation { .. } => RecordKind::Operation,
            Record::Pass { .. } => RecordKind::Pass,
            Record::Verification { .. } => RecordKind::Verification,
            Record::Status { .. } => RecordKind::Status,
            Record::Feedback(_) => RecordKind::Feedback,
            Record::ExecutionSignal(_) => RecordKind::ExecutionSignal,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        match self {
            Record::Operation { id, .. } => *id,
            Record::Pass { operation_id, .. }
            | Record::Verification { operation_id, .. }
            | Record::Status { operation_id, .. } => *operation_id,
            Record::Feedback(fb) => fb.operation_id,
            Record::ExecutionSignal(signal) => signal.operation_id,
        }
    }

    /// Write-once key.
    pub fn key(&self) -> String {
        match self {
            Record::Operation { id, .. } => format!("op:{id}"),
            Record::Pass {
                operation_id, pass, ..
            } => format!("pass:{operation_id}:{}", pass.pass_number),
            Record::Verification {
                operation_id,
                result,
            } => format!("verify:{operation_id}:{}:{}", result.attempt, result.layer),
            Record::Status {
                operation_id, seq, ..
            } => format!("status:{operation_id}:{seq}"),
            Record::Feedback(fb) => format!("feedback:{}", fb.id),
            Record::ExecutionSignal(signal) => {
                format!("signal:{}:{}", signal.operation_id, signal.attempt)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub operation_id: Option<OperationId>,
    pub kind: Option<RecordKind>,
}

impl RecordFilter {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            operation_id: None,
            kind: Some(kind),
        }
    }

    pub fn operation(operation_id: OperationId) -> Self {
        Self {
            operation_id: Some(operation_id),
            kind: None,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.operation_id.is_none_or(|id| record.operation_id() == id)
            && self.kind.is_none_or(|kind| record.kind() == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record {0} already written")]
    Duplicate(String),
    #[error("store i/o: {0}")]
    Io(String),
}

pub trait Store: Send + Sync {
    fn insert(&self, record: Record) -> Result<(), StoreError>;
    /// Matching records in insertion order.
    fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    records: Vec<Record>,
    keys: HashSet<String>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert(&self, record: Record) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Io("memory store lock poisoned".to_string()))?;
        let key = record.key();
        if !inner.keys.insert(key.clone()) {
            return Err(StoreError::Duplicate(key));
        }
        inner.records.push(record);
        Ok(())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Io("memory store lock poisoned".to_string()))?;
        Ok(inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

/// Append-only JSON-lines file.
pub struct JsonlStore {
    path: PathBuf,
    keys: Mutex<HashSet<String>>,
}

impl JsonlStore {
    /// Open (or create) the file and index existing keys.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
        }
        let store = Self {
            path: path.to_path_buf(),
            keys: Mutex::new(HashSet::new()),
        };
        let keys: HashSet<String> = store.read_all()?.iter().map(Record::key).collect();
        *store
            .keys
            .lock()
            .map_err(|_| StoreError::Io("jsonl store lock poisoned".to_string()))? = keys;
        Ok(store)
    }

    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| io_error(&self.path, &e))?;
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error(&self.path, &e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| {
                StoreError::Io(format!("{}:{}: {e}", self.path.display(), n + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl Store for JsonlStore {
    fn insert(&self, record: Record) -> Result<(), StoreError> {
        // Held across the append so concurrent writers cannot interleave lines.
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| StoreError::Io("jsonl store lock poisoned".to_string()))?;
        let key = record.key();
        if keys.contains(&key) {
            return Err(StoreError::Duplicate(key));
        }
        let mut line =
            serde_json::to_string(&record).map_err(|e| StoreError::Io(e.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, &e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_error(&self.path, &e))?;
        keys.insert(key);
        Ok(())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let _guard = self
            .keys
            .lock()
            .map_err(|_| StoreError::Io("jsonl store lock poisoned".to_string()))?;
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {err}", path.display()))
}
