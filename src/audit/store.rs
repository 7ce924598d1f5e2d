use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{
    compute_hash, format_time, verify_chain, AuditError, AuditQuery, ChainVerification,
    NewRunRecord, RunRecord, RunStatus, GENESIS_HASH,
};
use crate::util::atomic_write;

const COLUMNS: &str = "sequence, id, timestamp, capability_id, arguments, start_time, end_time, \
     exit_code, status, error, stdout_path, stderr_path, output_size_bytes, parsed_summary, \
     previous_hash, own_hash";

/// Append-only SQLite store for [`RunRecord`]s.
///
/// The connection mutex makes this the single writer: the chain head is read
/// and advanced inside one transaction per append, so records link in commit
/// order. Triggers reject UPDATE and DELETE on the table.
pub struct AuditStore {
    db: Mutex<Connection>,
    exports_dir: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportDocument<'a> {
    exported_at: String,
    from: String,
    to: String,
    chain: &'a ChainVerification,
    records: &'a [RunRecord],
}

impl AuditStore {
    /// Open (or create) the audit database at `db_path`.
    pub fn open(db_path: &Path, exports_dir: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS run_records (
                sequence          INTEGER PRIMARY KEY,
                id                TEXT    NOT NULL UNIQUE,
                timestamp         TEXT    NOT NULL,
                capability_id     TEXT    NOT NULL,
                arguments         TEXT    NOT NULL,
                start_time        TEXT    NOT NULL,
                end_time          TEXT    NOT NULL,
                exit_code         INTEGER,
                status            TEXT    NOT NULL,
                error             TEXT,
                stdout_path       TEXT,
                stderr_path       TEXT,
                output_size_bytes INTEGER NOT NULL DEFAULT 0,
                parsed_summary    TEXT,
                previous_hash     TEXT    NOT NULL,
                own_hash          TEXT    NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_timestamp  ON run_records(timestamp);
            CREATE INDEX IF NOT EXISTS idx_runs_capability ON run_records(capability_id);

            CREATE TRIGGER IF NOT EXISTS run_records_no_update
            BEFORE UPDATE ON run_records
            BEGIN SELECT RAISE(ABORT, 'run_records is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS run_records_no_delete
            BEFORE DELETE ON run_records
            BEGIN SELECT RAISE(ABORT, 'run_records is append-only'); END;
            ",
        )?;

        Ok(Self {
            db: Mutex::new(conn),
            exports_dir: exports_dir.to_path_buf(),
        })
    }

    /// Hash and append a record, advancing the chain head.
    pub fn append(&self, new: NewRunRecord) -> Result<RunRecord, AuditError> {
        let conn = self.db.lock().map_err(|_| AuditError::LockPoisoned)?;
        let tx = conn.unchecked_transaction()?;

        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT sequence, own_hash FROM run_records ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (sequence, previous_hash) = match head {
            Some((seq, hash)) => (seq as u64 + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let (stdout_path, stderr_path, output_size_bytes) = match new.output {
            Some(out) => (
                Some(out.stdout_path.to_string_lossy().into_owned()),
                Some(out.stderr_path.to_string_lossy().into_owned()),
                out.size_bytes,
            ),
            None => (None, None, 0),
        };

        let mut record = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            timestamp: Utc::now().trunc_subsecs(6),
            capability_id: new.capability_id,
            arguments: new.arguments,
            start_time: new.start_time.trunc_subsecs(6),
            end_time: new.end_time.trunc_subsecs(6),
            exit_code: new.exit_code,
            status: new.status,
            error: new.error,
            stdout_path,
            stderr_path,
            output_size_bytes,
            parsed_summary: new.parsed_summary,
            previous_hash,
            own_hash: String::new(),
        };
        record.own_hash = compute_hash(&record)?;

        tx.execute(
            &format!(
                "INSERT INTO run_records ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                COLUMNS
            ),
            params![
                record.sequence as i64,
                record.id,
                format_time(&record.timestamp),
                record.capability_id,
                serde_json::to_string(&record.arguments)?,
                format_time(&record.start_time),
                format_time(&record.end_time),
                record.exit_code,
                record.status.as_str(),
                record.error,
                record.stdout_path,
                record.stderr_path,
                record.output_size_bytes as i64,
                record.parsed_summary,
                record.previous_hash,
                record.own_hash,
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "Audit record {} appended for '{}' ({})",
            record.sequence,
            record.capability_id,
            record.status.as_str()
        );
        Ok(record)
    }

    /// Query with optional filters, newest first.
    pub fn query(&self, q: &AuditQuery) -> Result<Vec<RunRecord>, AuditError> {
        let conn = self.db.lock().map_err(|_| AuditError::LockPoisoned)?;

        let mut sql = format!("SELECT {} FROM run_records", COLUMNS);
        let mut conditions: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref capability_id) = q.capability_id {
            conditions.push(format!("capability_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(capability_id.clone()));
        }

        if let Some(status) = q.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }

        if let Some(ref since) = q.since {
            conditions.push(format!("timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(format_time(since)));
        }

        if let Some(ref until) = q.until {
            conditions.push(format!("timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(format_time(until)));
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(" ORDER BY sequence DESC");

        let limit = q.limit.unwrap_or(100).min(10_000);
        let offset = q.offset.unwrap_or(0);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), read_row)?;
        let records = rows.map(|row| row?).collect::<Result<Vec<_>, AuditError>>();
        records
    }

    pub fn count(&self) -> Result<usize, AuditError> {
        let conn = self.db.lock().map_err(|_| AuditError::LockPoisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM run_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every record in chain order.
    pub fn all(&self) -> Result<Vec<RunRecord>, AuditError> {
        let conn = self.db.lock().map_err(|_| AuditError::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM run_records ORDER BY sequence ASC",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], read_row)?;
        let records = rows.map(|row| row?).collect::<Result<Vec<_>, AuditError>>();
        records
    }

    /// Recompute and check the whole chain.
    pub fn verify(&self) -> Result<ChainVerification, AuditError> {
        verify_chain(&self.all()?)
    }

    /// Write records whose timestamp falls in `[from, to]`, oldest first, plus
    /// the verification result of the full chain, to a JSON file in the
    /// exports directory. Returns the file path.
    pub fn export_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PathBuf, AuditError> {
        let all = self.all()?;
        let chain = verify_chain(&all)?;
        let records: Vec<RunRecord> = all
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect();

        let now = Utc::now();
        let document = ExportDocument {
            exported_at: format_time(&now),
            from: format_time(&from),
            to: format_time(&to),
            chain: &chain,
            records: &records,
        };

        std::fs::create_dir_all(&self.exports_dir)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.exports_dir.join(format!(
            "audit-{}-{}.json",
            now.format("%Y%m%dT%H%M%SZ"),
            &id[..8]
        ));
        atomic_write(&path, &serde_json::to_vec_pretty(&document)?)?;
        log::info!(
            "Exported {} audit record(s) to {}",
            records.len(),
            path.display()
        );
        Ok(path)
    }
}

fn parse_time(sequence: i64, raw: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AuditError::Corrupt {
            sequence,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

/// Raw columns; decoded outside rusqlite so corruption surfaces as `AuditError`.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<RunRecord, AuditError>> {
    let sequence: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let timestamp: String = row.get(2)?;
    let capability_id: String = row.get(3)?;
    let arguments: String = row.get(4)?;
    let start_time: String = row.get(5)?;
    let end_time: String = row.get(6)?;
    let exit_code: Option<i32> = row.get(7)?;
    let status: String = row.get(8)?;
    let error: Option<String> = row.get(9)?;
    let stdout_path: Option<String> = row.get(10)?;
    let stderr_path: Option<String> = row.get(11)?;
    let output_size_bytes: i64 = row.get(12)?;
    let parsed_summary: Option<String> = row.get(13)?;
    let previous_hash: String = row.get(14)?;
    let own_hash: String = row.get(15)?;

    Ok((|| -> Result<RunRecord, AuditError> {
        let arguments: BTreeMap<String, String> = serde_json::from_str(&arguments)?;
        let status = RunStatus::parse(&status).ok_or_else(|| AuditError::Corrupt {
            sequence,
            reason: format!("unknown status '{}'", status),
        })?;
        Ok(RunRecord {
            id,
            sequence: sequence as u64,
            timestamp: parse_time(sequence, &timestamp)?,
            capability_id,
            arguments,
            start_time: parse_time(sequence, &start_time)?,
            end_time: parse_time(sequence, &end_time)?,
            exit_code,
            status,
            error,
            stdout_path,
            stderr_path,
            output_size_bytes: output_size_bytes as u64,
            parsed_summary,
            previous_hash,
            own_hash,
        })
    })())
}
