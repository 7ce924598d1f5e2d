//! Hash-chained audit log of every execution attempt.
//!
//! Each [`RunRecord`] carries the SHA-256 of its own canonical encoding and the
//! hash of its predecessor, so removing, reordering or editing a stored record
//! is detectable by [`verify_chain`]. The store exposes append and read only.
//! Output bodies live in separate files ([`blobs::OutputBlobStore`]); records
//! keep paths and sizes.

pub mod blobs;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::runner::ExecutionStatus;

pub use blobs::{OutputBlobStore, StoredOutput};
pub use store::AuditStore;

/// `previousHash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record {sequence}: {reason}")]
    Corrupt { sequence: i64, reason: String },

    #[error("audit store lock poisoned")]
    LockPoisoned,
}

/// Recorded outcome. Extends [`ExecutionStatus`] with attempts that never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
    /// Stopped by validation or preflight before anything was spawned.
    Rejected,
    /// Stopped by a runtime error (spawn failure, helper unavailable).
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Rejected => "rejected",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "timeout" => Some(RunStatus::Timeout),
            "cancelled" => Some(RunStatus::Cancelled),
            "rejected" => Some(RunStatus::Rejected),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

impl From<ExecutionStatus> for RunStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => RunStatus::Success,
            ExecutionStatus::Failed => RunStatus::Failed,
            ExecutionStatus::Timeout => RunStatus::Timeout,
            ExecutionStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Everything the caller knows about an attempt. The store adds identity,
/// sequence and hashes on append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
    pub capability_id: String,
    pub arguments: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub output: Option<StoredOutput>,
    pub parsed_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub capability_id: String,
    pub arguments: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub output_size_bytes: u64,
    pub parsed_summary: Option<String>,
    pub previous_hash: String,
    pub own_hash: String,
}

/// Timestamps are stored and hashed at microsecond precision.
pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Canonical hash input: every field except `own_hash`, in fixed order,
/// with arguments sorted by key.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    id: &'a str,
    sequence: u64,
    timestamp: String,
    capability_id: &'a str,
    arguments: &'a BTreeMap<String, String>,
    start_time: String,
    end_time: String,
    exit_code: Option<i32>,
    status: &'static str,
    error: Option<&'a str>,
    stdout_path: Option<&'a str>,
    stderr_path: Option<&'a str>,
    output_size_bytes: u64,
    parsed_summary: Option<&'a str>,
    previous_hash: &'a str,
}

/// Lowercase hex SHA-256 over the record's canonical encoding.
pub fn compute_hash(record: &RunRecord) -> Result<String, AuditError> {
    let input = HashInput {
        id: &record.id,
        sequence: record.sequence,
        timestamp: format_time(&record.timestamp),
        capability_id: &record.capability_id,
        arguments: &record.arguments,
        start_time: format_time(&record.start_time),
        end_time: format_time(&record.end_time),
        exit_code: record.exit_code,
        status: record.status.as_str(),
        error: record.error.as_deref(),
        stdout_path: record.stdout_path.as_deref(),
        stderr_path: record.stderr_path.as_deref(),
        output_size_bytes: record.output_size_bytes,
        parsed_summary: record.parsed_summary.as_deref(),
        previous_hash: &record.previous_hash,
    };
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&input)?);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakReason {
    /// Stored `ownHash` does not match the recomputed hash.
    HashMismatch,
    /// `previousHash` does not equal the predecessor's `ownHash`.
    BrokenLink,
    /// A sequence number is missing or out of order.
    SequenceGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub sequence: u64,
    pub record_id: String,
    pub reason: BreakReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub records_checked: usize,
    pub first_break: Option<ChainBreak>,
}

/// Walk a complete chain in sequence order, stopping at the first break.
pub fn verify_chain(records: &[RunRecord]) -> Result<ChainVerification, AuditError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 1u64;

    for (checked, record) in records.iter().enumerate() {
        let reason = if record.sequence != expected_seq {
            Some(BreakReason::SequenceGap)
        } else if record.previous_hash != expected_prev {
            Some(BreakReason::BrokenLink)
        } else if compute_hash(record)? != record.own_hash {
            Some(BreakReason::HashMismatch)
        } else {
            None
        };

        if let Some(reason) = reason {
            log::error!(
                "Audit chain broken at sequence {} ({:?})",
                record.sequence,
                reason
            );
            return Ok(ChainVerification {
                valid: false,
                records_checked: checked,
                first_break: Some(ChainBreak {
                    sequence: record.sequence,
                    record_id: record.id.clone(),
                    reason,
                }),
            });
        }
        expected_prev = record.own_hash.clone();
        expected_seq += 1;
    }

    Ok(ChainVerification {
        valid: true,
        records_checked: records.len(),
        first_break: None,
    })
}

/// Filter for [`AuditStore::query`]. Results are newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub capability_id: Option<String>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
