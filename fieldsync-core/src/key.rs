//! Cache keys and key prefixes.
//!
//! A [`CacheKey`] is an ordered tuple `(domain, qualifier...)`. Keys that share
//! a leading segment form a family, so `materials` covers
//! `materials.detail.M1` and `materials.list.{...}` alike. A [`KeyPrefix`] names
//! such a family, possibly more than one segment deep
//! (`materials.allocation-targets`).

use serde::{Deserialize, Serialize};
use std::fmt;

const SEPARATOR: char = '.';

/// Ordered key of a cache entry. The first segment is the domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey {
    segments: Vec<String>,
}

impl CacheKey {
    /// Create a key consisting of the domain only.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            segments: vec![domain.into()],
        }
    }

    /// `(domain, "detail", id)`
    pub fn detail(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(domain).with("detail").with(id)
    }

    /// `(domain, "list", filters)` with the filters rendered as canonical JSON.
    pub fn list(domain: impl Into<String>, filters: &serde_json::Value) -> Self {
        Self::new(domain).with("list").with(filters.to_string())
    }

    /// Append one qualifier segment.
    pub fn with(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Parse a dotted key such as `materials.detail.M1`.
    ///
    /// Returns `None` for an empty string or an empty segment. Segments that
    /// themselves contain dots (rendered filters) must be built with
    /// [`CacheKey::with`] instead.
    pub fn parse(raw: &str) -> Option<Self> {
        split_segments(raw).map(|segments| Self { segments })
    }

    pub fn domain(&self) -> &str {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The trailing segment, which for detail keys is the entity id.
    pub fn last(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    pub fn starts_with(&self, prefix: &KeyPrefix) -> bool {
        prefix.matches(self)
    }

    /// The key viewed as a prefix covering itself and everything below it.
    pub fn as_prefix(&self) -> KeyPrefix {
        KeyPrefix {
            segments: self.segments.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.segments)
    }
}

/// A key family: every key whose leading segments equal these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPrefix {
    segments: Vec<String>,
}

impl KeyPrefix {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            segments: vec![domain.into()],
        }
    }

    pub fn with(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn parse(raw: &str) -> Option<Self> {
        split_segments(raw).map(|segments| Self { segments })
    }

    pub fn domain(&self) -> &str {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `key` belongs to this family.
    pub fn matches(&self, key: &CacheKey) -> bool {
        key.segments.len() >= self.segments.len()
            && key.segments[..self.segments.len()] == self.segments[..]
    }

    /// True if every key matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &KeyPrefix) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.segments)
    }
}

impl From<&CacheKey> for KeyPrefix {
    fn from(key: &CacheKey) -> Self {
        key.as_prefix()
    }
}

impl From<CacheKey> for KeyPrefix {
    fn from(key: CacheKey) -> Self {
        Self {
            segments: key.segments,
        }
    }
}

fn split_segments(raw: &str) -> Option<Vec<String>> {
    if raw.is_empty() {
        return None;
    }
    let segments: Vec<String> = raw.split(SEPARATOR).map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

fn write_joined(f: &mut fmt::Formatter<'_>, segments: &[String]) -> fmt::Result {
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", SEPARATOR)?;
        }
        f.write_str(segment)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_detail_key_shape() {
        let key = CacheKey::detail("materials", "M1");
        assert_eq!(key.domain(), "materials");
        assert_eq!(key.last(), "M1");
        assert_eq!(key.to_string(), "materials.detail.M1");
    }

    #[test]
    fn test_list_key_renders_filters_canonically() {
        let a = CacheKey::list("materials", &json!({"b": 1, "a": 2}));
        let b = CacheKey::list("materials", &json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(CacheKey::parse("").is_none());
        assert!(CacheKey::parse("materials..M1").is_none());
        assert!(KeyPrefix::parse(".materials").is_none());
    }

    #[test]
    fn test_domain_prefix_matches_family() {
        let prefix = KeyPrefix::new("materials");
        assert!(prefix.matches(&CacheKey::detail("materials", "M1")));
        assert!(prefix.matches(&CacheKey::new("materials").with("allocation-targets")));
        assert!(!prefix.matches(&CacheKey::detail("allocations", "A1")));
    }

    #[test]
    fn test_prefix_does_not_match_segment_substring() {
        let prefix = KeyPrefix::new("material");
        assert!(!prefix.matches(&CacheKey::detail("materials", "M1")));
    }

    #[test]
    fn test_nested_prefix_matches_only_subfamily() {
        let prefix = KeyPrefix::parse("materials.allocation-targets").unwrap();
        assert!(prefix.matches(&CacheKey::new("materials").with("allocation-targets")));
        assert!(!prefix.matches(&CacheKey::detail("materials", "M1")));
        assert!(KeyPrefix::new("materials").covers(&prefix));
        assert!(!prefix.covers(&KeyPrefix::new("materials")));
    }

    proptest! {
        #[test]
        fn parse_display_is_identity(segments in prop::collection::vec("[a-z0-9-]{1,8}", 1..5)) {
            let raw = segments.join(".");
            let key = CacheKey::parse(&raw).unwrap();
            prop_assert_eq!(key.to_string(), raw);
            prop_assert_eq!(key.segments().len(), segments.len());
        }

        #[test]
        fn every_key_is_matched_by_its_domain(segments in prop::collection::vec("[a-z0-9-]{1,8}", 1..5)) {
            let key = CacheKey::parse(&segments.join(".")).unwrap();
            prop_assert!(key.starts_with(&KeyPrefix::new(key.domain())));
            prop_assert!(key.starts_with(&key.as_prefix()));
        }
    }
}
