use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::template::malformed_placeholders;
use super::validation::{catalog_schema, validate_document};
use super::{Capability, PreflightCheckType, PrivilegeLevel, RiskClass};
use crate::parser::{parse_size, ParserKind};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error reading catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog is not valid JSON/YAML: {0}")]
    Parse(String),

    #[error("Catalog schema violation: {0}")]
    Schema(String),

    #[error("Duplicate capability id: {0}")]
    DuplicateId(String),

    #[error("Capability '{id}' is invalid: {reason}")]
    InvalidEntry { id: String, reason: String },
}

/// Optional narrowing for [`CapabilityCatalog::all`].
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub group: Option<String>,
    pub privilege: Option<PrivilegeLevel>,
    pub risk: Option<RiskClass>,
}

impl CapabilityFilter {
    fn accepts(&self, cap: &Capability) -> bool {
        self.group.as_ref().map_or(true, |g| &cap.group == g)
            && self.privilege.map_or(true, |p| cap.privilege_level == p)
            && self.risk.map_or(true, |r| cap.risk_class == r)
    }
}

/// Read-only index of every capability, built once at startup.
///
/// There is no mutation API: after `load` the catalog can be shared behind an
/// `Arc` and read concurrently without locking.
#[derive(Debug)]
pub struct CapabilityCatalog {
    /// Declaration order, for stable listing.
    entries: Vec<Arc<Capability>>,
    by_id: HashMap<String, Arc<Capability>>,
    by_group: HashMap<String, Vec<Arc<Capability>>>,
}

impl CapabilityCatalog {
    /// Load a catalog document from disk. `.yaml`/`.yml` files are parsed as
    /// YAML, everything else as JSON.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let data = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        let document: Value = if is_yaml {
            serde_yaml::from_str(&data).map_err(|e| CatalogError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&data).map_err(|e| CatalogError::Parse(e.to_string()))?
        };

        let catalog = Self::from_document(document)?;
        log::info!(
            "Loaded capability catalog from {} ({} capabilities)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    /// Build a catalog from an already-parsed document. Any violation aborts
    /// the whole load; no partial catalog is ever returned.
    pub fn from_document(document: Value) -> Result<Self, CatalogError> {
        validate_document(&catalog_schema(), &document).map_err(CatalogError::Schema)?;
        let capabilities: Vec<Capability> = serde_json::from_value(document)
            .map_err(|e| CatalogError::Schema(e.to_string()))?;
        Self::from_capabilities(capabilities)
    }

    pub fn from_capabilities(capabilities: Vec<Capability>) -> Result<Self, CatalogError> {
        let mut entries = Vec::with_capacity(capabilities.len());
        let mut by_id = HashMap::with_capacity(capabilities.len());
        let mut by_group: HashMap<String, Vec<Arc<Capability>>> = HashMap::new();

        for cap in capabilities {
            check_entry(&cap)?;
            if by_id.contains_key(&cap.id) {
                return Err(CatalogError::DuplicateId(cap.id));
            }
            let cap = Arc::new(cap);
            by_id.insert(cap.id.clone(), cap.clone());
            by_group.entry(cap.group.clone()).or_default().push(cap.clone());
            entries.push(cap);
        }

        Ok(Self {
            entries,
            by_id,
            by_group,
        })
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Capability>> {
        self.by_id.get(id).cloned()
    }

    pub fn by_group(&self, group: &str) -> Vec<Arc<Capability>> {
        self.by_group.get(group).cloned().unwrap_or_default()
    }

    /// Group names, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.by_group.keys().cloned().collect();
        groups.sort();
        groups
    }

    pub fn all(&self, filter: Option<&CapabilityFilter>) -> Vec<Arc<Capability>> {
        self.entries
            .iter()
            .filter(|cap| filter.map_or(true, |f| f.accepts(cap)))
            .cloned()
            .collect()
    }

    /// Case-insensitive text search, ordered by id.
    pub fn search(&self, query: &str) -> Vec<Arc<Capability>> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<_> = self
            .entries
            .iter()
            .filter(|cap| cap.matches(query))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Semantic checks the schema cannot express.
fn check_entry(cap: &Capability) -> Result<(), CatalogError> {
    let invalid = |reason: String| CatalogError::InvalidEntry {
        id: cap.id.clone(),
        reason,
    };

    if cap.id.trim().is_empty() {
        return Err(invalid("id must not be blank".into()));
    }
    if cap.command_template.trim().is_empty() {
        return Err(invalid("commandTemplate must not be empty".into()));
    }
    if cap.timeout_secs == 0 {
        return Err(invalid("timeout must be positive".into()));
    }
    if let Some(ref dir) = cap.working_directory {
        if !Path::new(dir).is_absolute() {
            return Err(invalid(format!("workingDirectory '{}' is not absolute", dir)));
        }
    }
    if cap.output_parser == ParserKind::Regex {
        let pattern = cap
            .parser_pattern
            .as_deref()
            .ok_or_else(|| invalid("regex parser requires parserPattern".into()))?;
        regex::Regex::new(pattern).map_err(|e| invalid(format!("parserPattern: {}", e)))?;
    }
    let malformed = malformed_placeholders(&cap.command_template);
    if !malformed.is_empty() {
        return Err(invalid(format!(
            "malformed placeholder(s) in commandTemplate: {}",
            malformed.join(", ")
        )));
    }
    let executable = cap.command_template.split_whitespace().next().unwrap_or("");
    if executable.contains("{{") {
        return Err(invalid("the executable must not be a placeholder".into()));
    }
    for check in &cap.preflight_checks {
        match check.check_type {
            PreflightCheckType::DiskSpaceAvailable if parse_size(&check.target).is_none() => {
                return Err(invalid(format!("disk space target '{}' is not a size", check.target)));
            }
            PreflightCheckType::IntegrityProtectionStatus
                if check.target != "enabled" && check.target != "disabled" =>
            {
                return Err(invalid(format!(
                    "integrity protection target must be 'enabled' or 'disabled', got '{}'",
                    check.target
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
