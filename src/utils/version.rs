//! Version comparison used by the `semver_*` targeting operators.
//!
//! Versions are dot-separated unsigned integers with an optional leading `v`.
//! Components are compared left to right and the shorter version is padded
//! with zeros, so `1.2` equals `1.2.0`.

use std::cmp::Ordering;

/// Parsed version components, most significant first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    pub components: Vec<u64>,
}

impl ParsedVersion {
    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

/// Parse a version string into numeric components.
/// Returns None if any component is not an unsigned integer.
///
/// # Examples
///
/// ```
/// use rollgate::utils::version::parse_version;
///
/// let v = parse_version("v1.2.3").unwrap();
/// assert_eq!(v.components, vec![1, 2, 3]);
///
/// assert!(parse_version("1.2.x").is_none());
/// assert!(parse_version("").is_none());
/// ```
pub fn parse_version(version: &str) -> Option<ParsedVersion> {
    let normalized = version.strip_prefix('v').unwrap_or(version);

    let components = normalized
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    Some(ParsedVersion { components })
}

/// Compare two versions. Returns None if either one is malformed.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let parsed_a = parse_version(a)?;
    let parsed_b = parse_version(b)?;

    let len = parsed_a.components.len().max(parsed_b.components.len());
    for i in 0..len {
        match parsed_a.component(i).cmp(&parsed_b.component(i)) {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }

    Some(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_basic() {
        assert_eq!(parse_version("1.2.3").unwrap().components, vec![1, 2, 3]);
        assert_eq!(parse_version("10").unwrap().components, vec![10]);
        assert_eq!(parse_version("1.2.3.4").unwrap().components, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_version_strips_lowercase_v_only() {
        assert!(parse_version("v2.0.0").is_some());
        assert!(parse_version("V2.0.0").is_none());
    }

    #[test]
    fn test_parse_version_malformed() {
        assert!(parse_version("").is_none());
        assert!(parse_version("1..2").is_none());
        assert!(parse_version("1.2.3-beta").is_none());
        assert!(parse_version(" 1.0.0").is_none());
    }

    #[test]
    fn test_compare_versions_pads_with_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("1.2.1", "1.2"), Some(Ordering::Greater));
        assert_eq!(compare_versions("v1.9", "1.10"), Some(Ordering::Less));
    }

    #[test]
    fn test_compare_versions_malformed() {
        assert_eq!(compare_versions("1.0", "abc"), None);
        assert_eq!(compare_versions("abc", "1.0"), None);
    }
}
