use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::key_values;

/// Qualitative memory pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Warn,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warn => "warn",
            PressureLevel::Critical => "critical",
        }
    }

    /// Free-percentage thresholds: 50% and above is normal, below 20% critical.
    pub fn from_free_percentage(pct: f64) -> Self {
        if pct >= 50.0 {
            PressureLevel::Normal
        } else if pct >= 20.0 {
            PressureLevel::Warn
        } else {
            PressureLevel::Critical
        }
    }

    /// Kernel numeric level (`kern.memorystatus_vm_pressure_level`): 1, 2, 4.
    fn from_kernel_level(level: u32) -> Option<Self> {
        match level {
            1 => Some(PressureLevel::Normal),
            2 => Some(PressureLevel::Warn),
            4 => Some(PressureLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPressure {
    pub level: PressureLevel,
    pub free_percentage: Option<f64>,
    pub available_bytes: Option<u64>,
}

fn free_pct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)memory free percentage:\s*([0-9]+(?:\.[0-9]+)?)\s*%")
            .expect("static regex")
    })
}

fn page_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)page size of\s*([0-9]+)").expect("static regex"))
}

fn stated_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(normal|warn|warning|critical)\b\s+memory pressure")
            .expect("static regex")
    })
}

/// Interpret free-form memory probe output (`memory_pressure`, `vm_stat`,
/// `sysctl kern.memorystatus_vm_pressure_level`).
///
/// An explicit level (stated in words or as a kernel number) wins over the
/// level derived from the free percentage.
pub fn parse(text: &str) -> Option<MemoryPressure> {
    let free_percentage = free_pct_re()
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok());

    let stated = stated_level_re()
        .captures(text)
        .and_then(|c| match c[1].to_ascii_lowercase().as_str() {
            "normal" => Some(PressureLevel::Normal),
            "warn" | "warning" => Some(PressureLevel::Warn),
            "critical" => Some(PressureLevel::Critical),
            _ => None,
        });

    let fields = key_values(text);
    let kernel = fields
        .get("kern.memorystatus_vm_pressure_level")
        .and_then(|v| v.parse::<u32>().ok())
        .and_then(PressureLevel::from_kernel_level);

    let level = stated
        .or(kernel)
        .or_else(|| free_percentage.map(PressureLevel::from_free_percentage))?;

    Some(MemoryPressure {
        level,
        free_percentage,
        available_bytes: available_bytes(text, &fields),
    })
}

/// Reclaimable pages (free, inactive, purgeable, speculative) times page size.
fn available_bytes(
    text: &str,
    fields: &std::collections::BTreeMap<String, String>,
) -> Option<u64> {
    let page_size: u64 = page_size_re().captures(text)?[1].parse().ok()?;
    let pages: Vec<u64> = ["Pages free", "Pages inactive", "Pages purgeable", "Pages speculative"]
        .iter()
        .filter_map(|key| fields.get(*key))
        .filter_map(|v| v.trim_end_matches('.').trim().parse::<u64>().ok())
        .collect();
    if pages.is_empty() {
        return None;
    }
    pages
        .iter()
        .try_fold(0u64, |total, n| total.checked_add(*n))?
        .checked_mul(page_size)
}
