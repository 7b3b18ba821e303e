//! Append-only, hash-chained audit log.
//!
//! Every classification, verification, block, hold and execution decision is
//! recorded. Each entry's `prev_hash` is the content hash of the entry before
//! it, so editing or dropping any entry breaks [`AuditLog::verify_chain`].

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::error;

use crate::core::confidence::ExecutionTier;
use crate::core::types::{
    Axes, Ceiling, FeedbackKind, OperationId, OperationStatus, VerificationLayer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RequestReceived {
        request: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        injection_signatures: Vec<String>,
    },
    Classified {
        axes: Axes,
        confident: bool,
        pass_number: u32,
    },
    DegradedMode {
        reason: String,
    },
    Decomposed {
        children: usize,
    },
    DecompositionRejected {
        reason: String,
    },
    ForcedLeaf {
        reason: String,
    },
    Verified {
        attempt: u32,
        confidence: f64,
        tier: ExecutionTier,
    },
    Blocked {
        layer: VerificationLayer,
        issues: Vec<String>,
    },
    Held {
        reason: String,
    },
    StatusChanged {
        status: OperationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Executed {
        success: bool,
        exit_code: Option<i32>,
    },
    Feedback {
        kind: FeedbackKind,
    },
    ContentEdited {
        content: String,
    },
    Cancelled,
    SessionPaused {
        ceiling: Ceiling,
    },
    SessionResumed,
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

impl AuditEntry {
    /// SHA-256 over every field including `prev_hash`.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        if let Some(session) = &self.session {
            hasher.update(session.as_bytes());
        }
        if let Some(op) = &self.operation_id {
            hasher.update(op.as_uuid().as_bytes());
        }
        // Serializing a plain enum of owned data cannot fail.
        let event = serde_json::to_vec(&self.event).unwrap_or_default();
        hasher.update(&event);
        if let Some(prev) = &self.prev_hash {
            hasher.update(prev.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("genesis entry (seq={0}) has a prev_hash")]
    InvalidGenesis(u64),
    #[error("entry (seq={0}) is missing prev_hash")]
    MissingPrevHash(u64),
    #[error("entry (seq={sequence}) prev_hash mismatch: expected {expected}, found {actual}")]
    HashMismatch {
        sequence: u64,
        expected: String,
        actual: String,
    },
    #[error("sequence gap: expected {expected}, found {actual}")]
    SequenceGap { expected: u64, actual: u64 },
}

struct AuditInner {
    entries: Vec<AuditEntry>,
    next_sequence: u64,
    sink: Option<BufWriter<File>>,
}

/// Thread-safe audit log shared by every request worker.
pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: Vec::new(),
                next_sequence: 0,
                sink: None,
            }),
        }
    }

    /// Also append every entry as a JSON line to `path`.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        let log = Self::new();
        if let Ok(mut inner) = log.inner.lock() {
            inner.sink = Some(BufWriter::new(file));
        }
        Ok(log)
    }

    /// Append an event, chaining it to the previous entry. Returns its sequence.
    pub fn record(
        &self,
        session: Option<&str>,
        operation_id: Option<OperationId>,
        event: AuditEvent,
    ) -> u64 {
        let Ok(mut inner) = self.inner.lock() else {
            error!("audit log lock poisoned; entry dropped");
            return 0;
        };
        let sequence = inner.next_sequence;
        let entry = AuditEntry {
            sequence,
            timestamp: Utc::now(),
            session: session.map(str::to_string),
            operation_id,
            event,
            prev_hash: inner.entries.last().map(AuditEntry::content_hash),
        };
        if let Some(sink) = inner.sink.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(sink, "{line}"))
                .and_then(|()| sink.flush());
            if let Err(e) = written {
                error!(err = %e, sequence, "failed to write audit entry to file");
            }
        }
        inner.entries.push(entry);
        inner.next_sequence += 1;
        sequence
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, operation_id: OperationId) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.operation_id == Some(operation_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn verify_chain(&self) -> Result<(), ChainError> {
        verify_entries(&self.entries())
    }
}

/// Check sequence continuity and hash links of a list of entries.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<(), ChainError> {
    let mut previous: Option<&AuditEntry> = None;
    for entry in entries {
        match previous {
            None => {
                if entry.prev_hash.is_some() {
                    return Err(ChainError::InvalidGenesis(entry.sequence));
                }
            }
            Some(prev) => {
                if entry.sequence != prev.sequence + 1 {
                    return Err(ChainError::SequenceGap {
                        expected: prev.sequence + 1,
                        actual: entry.sequence,
                    });
                }
                let expected = prev.content_hash();
                match &entry.prev_hash {
                    None => return Err(ChainError::MissingPrevHash(entry.sequence)),
                    Some(actual) if *actual != expected => {
                        return Err(ChainError::HashMismatch {
                            sequence: entry.sequence,
                            expected,
                            actual: actual.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        previous = Some(entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> AuditLog {
        let log = AuditLog::new();
        let op = OperationId::new();
        log.record(
            Some("s1"),
            Some(op),
            AuditEvent::RequestReceived {
                request: "rm -rf /".to_string(),
                injection_signatures: Vec::new(),
            },
        );
        log.record(
            Some("s1"),
            Some(op),
            AuditEvent::Blocked {
                layer: VerificationLayer::Safety,
                issues: vec!["recursive deletion of root".to_string()],
            },
        );
        log.record(Some("s1"), None, AuditEvent::SessionEnded);
        log
    }

    #[test]
    fn chain_links_consecutive_entries() {
        let log = sample_log();
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].prev_hash.is_none());
        assert_eq!(
            entries[1].prev_hash.as_deref(),
            Some(entries[0].content_hash().as_str())
        );
        assert_eq!(log.verify_chain(), Ok(()));
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let mut entries = sample_log().entries();
        entries[1].event = AuditEvent::Cancelled;
        assert!(matches!(
            verify_entries(&entries),
            Err(ChainError::HashMismatch { sequence: 2, .. })
        ));

        let mut dropped = sample_log().entries();
        dropped.remove(1);
        assert_eq!(
            verify_entries(&dropped),
            Err(ChainError::SequenceGap {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit").join("log.jsonl");
        let log = AuditLog::with_file(&path).expect("open");
        log.record(None, None, AuditEvent::SessionResumed);
        log.record(None, None, AuditEvent::SessionEnded);
        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first.event, AuditEvent::SessionResumed);
    }
}
