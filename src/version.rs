//! Semver checks between the engine and the installed helper.

use std::cmp::Ordering;

/// Order `installed` against `required`. `None` if either is not semver.
pub fn compare_versions(installed: &str, required: &str) -> Option<Ordering> {
    let installed = semver::Version::parse(installed.trim()).ok()?;
    let required = semver::Version::parse(required.trim()).ok()?;
    Some(installed.cmp(&required))
}

/// True when `installed` is at least `required`. An unparseable version
/// never satisfies.
pub fn at_least(installed: &str, required: &str) -> bool {
    matches!(
        compare_versions(installed, required),
        Some(Ordering::Equal | Ordering::Greater)
    )
}
