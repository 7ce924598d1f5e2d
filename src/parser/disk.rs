use serde::{Deserialize, Serialize};

use super::parse_size;

/// One row of filesystem summary (`df`) or recursive size (`du`) output.
///
/// `du` rows only carry `path` and `used_bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsageEntry {
    pub path: String,
    pub filesystem: Option<String>,
    pub size_bytes: Option<u64>,
    pub used_bytes: u64,
    pub available_bytes: Option<u64>,
    pub capacity_percent: Option<f64>,
}

/// Parse either `df` or `du` output. The shape is detected from the first
/// non-empty line: a `Filesystem` header means `df`, otherwise `du`.
pub fn parse(text: &str) -> Option<Vec<DiskUsageEntry>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let first = lines.next()?;
    let entries = if first.trim_start().starts_with("Filesystem") {
        parse_df(first, lines)
    } else {
        std::iter::once(first).chain(lines).filter_map(parse_du_line).collect()
    };
    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

/// Block multiplier implied by the `df` header: `1024-blocks`, `1K-blocks`,
/// `512-blocks`, or `None` for human-readable (`-h`) output.
fn block_size(header: &[&str]) -> Option<u64> {
    let blocks = header.iter().find(|h| h.ends_with("-blocks"))?;
    parse_size(blocks.trim_end_matches("-blocks"))
}

fn parse_df<'a>(header: &str, rows: impl Iterator<Item = &'a str>) -> Vec<DiskUsageEntry> {
    let header: Vec<&str> = header.split_whitespace().collect();
    let unit = block_size(&header);
    let has_inodes = header.iter().any(|h| *h == "iused" || *h == "Iused");

    let size = |tok: &str| -> Option<u64> {
        match unit {
            Some(mult) => tok.parse::<u64>().ok().and_then(|n| n.checked_mul(mult)),
            None => parse_size(tok),
        }
    };

    rows.filter_map(|row| {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        // Capacity is the first `NN%` column after filesystem + three sizes.
        let cap_idx = tokens
            .iter()
            .enumerate()
            .skip(4)
            .find(|(_, t)| t.ends_with('%'))
            .map(|(i, _)| i)?;
        let mount_start = cap_idx + 1 + if has_inodes { 3 } else { 0 };
        if mount_start >= tokens.len() {
            return None;
        }
        Some(DiskUsageEntry {
            path: tokens[mount_start..].join(" "),
            filesystem: Some(tokens[..cap_idx - 3].join(" ")),
            size_bytes: size(tokens[cap_idx - 3]),
            used_bytes: size(tokens[cap_idx - 2])?,
            available_bytes: size(tokens[cap_idx - 1]),
            capacity_percent: tokens[cap_idx].trim_end_matches('%').parse().ok(),
        })
    })
    .collect()
}

/// `du` rows: `<size><whitespace><path>`. Bare numbers are KiB (`du -k`).
fn parse_du_line(line: &str) -> Option<DiskUsageEntry> {
    let line = line.trim();
    let split = line.find(char::is_whitespace)?;
    let (size, path) = line.split_at(split);
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let used_bytes = match size.parse::<u64>() {
        Ok(kib) => kib.checked_mul(1024)?,
        Err(_) => parse_size(size)?,
    };
    Some(DiskUsageEntry {
        path: path.to_string(),
        filesystem: None,
        size_bytes: None,
        used_bytes,
        available_bytes: None,
        capacity_percent: None,
    })
}
