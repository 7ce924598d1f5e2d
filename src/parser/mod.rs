//! Output parser factory.
//!
//! Raw stdout is turned into typed data by a closed set of strategies, one per
//! [`ParserKind`]. Dispatch is an exhaustive `match`, so a new output shape is
//! a compile-checked addition. Every parser returns `None` for input it cannot
//! interpret; that is never an execution failure, and the raw output is kept
//! regardless.

pub mod disk;
pub mod memory;
pub mod process_table;
pub mod table;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use disk::DiskUsageEntry;
pub use memory::{MemoryPressure, PressureLevel};
pub use process_table::ProcessRow;
pub use table::Table;

/// Parser type tag declared by a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParserKind {
    #[default]
    Text,
    Json,
    Regex,
    Table,
    MemoryPressure,
    DiskUsage,
    ProcessTable,
}

/// Structured interpretation of a command's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ParsedOutput {
    Text(String),
    Json(serde_json::Map<String, Value>),
    /// Numbered captures of the first match; index 0 is the whole match.
    /// Non-participating groups are `None`.
    RegexCaptures(Vec<Option<String>>),
    Table(Table),
    MemoryPressure(MemoryPressure),
    DiskUsage(Vec<DiskUsageEntry>),
    ProcessTable(Vec<ProcessRow>),
}

impl ParsedOutput {
    /// One-line description stored alongside audit records.
    pub fn summary(&self) -> String {
        match self {
            ParsedOutput::Text(text) => format!("text: {} line(s)", text.lines().count()),
            ParsedOutput::Json(map) => {
                let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
                format!("json: {{{}}}", keys.join(", "))
            }
            ParsedOutput::RegexCaptures(caps) => format!("regex: {} capture(s)", caps.len()),
            ParsedOutput::Table(table) => {
                format!("table: {} column(s), {} row(s)", table.headers.len(), table.rows.len())
            }
            ParsedOutput::MemoryPressure(mp) => match mp.free_percentage {
                Some(pct) => format!("memory pressure: {} ({}% free)", mp.level.as_str(), pct),
                None => format!("memory pressure: {}", mp.level.as_str()),
            },
            ParsedOutput::DiskUsage(entries) => format!("disk usage: {} entr(ies)", entries.len()),
            ParsedOutput::ProcessTable(rows) => format!("process table: {} process(es)", rows.len()),
        }
    }
}

/// Parse `stdout` with the strategy selected by `kind`.
///
/// `pattern` is only consulted by [`ParserKind::Regex`].
pub fn parse(kind: ParserKind, pattern: Option<&str>, stdout: &str) -> Option<ParsedOutput> {
    match kind {
        ParserKind::Text => Some(ParsedOutput::Text(stdout.to_string())),
        ParserKind::Json => parse_json_object(stdout).map(ParsedOutput::Json),
        ParserKind::Regex => parse_regex(pattern?, stdout).map(ParsedOutput::RegexCaptures),
        ParserKind::Table => table::parse(stdout).map(ParsedOutput::Table),
        ParserKind::MemoryPressure => memory::parse(stdout).map(ParsedOutput::MemoryPressure),
        ParserKind::DiskUsage => disk::parse(stdout).map(ParsedOutput::DiskUsage),
        ParserKind::ProcessTable => process_table::parse(stdout).map(ParsedOutput::ProcessTable),
    }
}

fn parse_json_object(stdout: &str) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn parse_regex(pattern: &str, stdout: &str) -> Option<Vec<Option<String>>> {
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            log::warn!("Invalid parser pattern '{}': {}", pattern, e);
            return None;
        }
    };
    let caps = re.captures(stdout)?;
    Some(
        caps.iter()
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect(),
    )
}

/// Split `key: value` style probe output into a map; shared by the
/// domain-specific parsers.
pub(crate) fn key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parse human sizes such as `512`, `4K`, `1.5G`, `2GB`, `10 MiB`, `460Gi`
/// into bytes. Units are binary (1K = 1024).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let unit = unit.trim().to_ascii_uppercase();
    let multiplier: u64 = match unit.trim_end_matches('B').trim_end_matches('I') {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        "P" => 1 << 50,
        _ => return None,
    };
    let bytes = (number * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}
