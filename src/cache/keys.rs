//! Cache key construction and invalidation patterns.
//!
//! Keys are colon-separated strings: `{prefix}:{kind}:{identifier}` with an
//! optional trailing `:{version}`. The same string addresses an entry in
//! every tier, so generation must be pure.

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

const SEPARATOR: char = ':';
const QUERY_HASH_LEN: usize = 16;

/// Join the non-empty parts of a key with `:`.
pub fn generate_cache_key(
    prefix: &str,
    kind: &str,
    identifier: &str,
    version: Option<&str>,
) -> String {
    let parts = [prefix, kind, identifier, version.unwrap_or_default()];
    let mut key = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts.into_iter().filter(|part| !part.is_empty()) {
        if !key.is_empty() {
            key.push(SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Components of a versioned four-segment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub namespace: String,
    pub kind: String,
    pub identifier: String,
    pub version: String,
}

/// Split `namespace:kind:identifier:version`. Any other shape yields `None`.
pub fn parse_cache_key(key: &str) -> Option<ParsedKey> {
    let mut parts = key.split(SEPARATOR);
    let parsed = ParsedKey {
        namespace: parts.next()?.to_string(),
        kind: parts.next()?.to_string(),
        identifier: parts.next()?.to_string(),
        version: parts.next()?.to_string(),
    };
    if parts.next().is_some() {
        return None;
    }
    Some(parsed)
}

/// Order-independent hash of query parameters, for list/filter keys.
///
/// Keys are sorted before hashing, so `{a:1,b:2}` and `{b:2,a:1}` agree.
pub fn hash_query_params(params: &Map<String, Value>) -> String {
    let mut entries: Vec<(&String, &Value)> = params.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut hasher = Sha256::new();
    for (index, (name, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            hasher.update(b"&");
        }
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
    }

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(QUERY_HASH_LEN);
    digest
}

/// Build an invalidation pattern: `ns:*`, `ns:kind:*` or `ns:kind:id:*`.
pub fn cache_pattern(namespace: &str, kind: Option<&str>, identifier: Option<&str>) -> String {
    match (kind, identifier) {
        (Some(kind), Some(identifier)) => format!("{namespace}:{kind}:{identifier}:*"),
        (Some(kind), None) => format!("{namespace}:{kind}:*"),
        _ => format!("{namespace}:*"),
    }
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalidation pattern must not be empty")]
    Empty,
    #[error("invalidation pattern `{pattern}` could not be compiled: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A compiled glob-style invalidation pattern.
///
/// `*` matches any run of characters including `:`, `?` matches exactly one
/// character. Everything else is literal and the match is anchored.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
    literal_prefix_len: usize,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push_str("(?s)^");
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        })?;

        let literal_prefix_len = pattern.find(['*', '?']).unwrap_or(pattern.len());

        Ok(Self {
            source: pattern.to_string(),
            regex,
            literal_prefix_len,
        })
    }

    /// Pattern matching exactly the keys of one namespace.
    pub fn namespace(namespace: &str) -> Result<Self, PatternError> {
        Self::new(&cache_pattern(namespace, None, None))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Text before the first wildcard. Every matching key starts with it.
    pub fn literal_prefix(&self) -> &str {
        &self.source[..self.literal_prefix_len]
    }

    /// True when the pattern has no wildcards.
    pub fn is_exact(&self) -> bool {
        self.literal_prefix_len == self.source.len()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_generation_skips_empty_parts() {
        assert_eq!(generate_cache_key("", "content", "abc123", None), "content:abc123");
        assert_eq!(generate_cache_key("content", "item", "42", None), "content:item:42");
        assert_eq!(generate_cache_key("api", "list", "", None), "api:list");
        assert_eq!(
            generate_cache_key("content", "post", "123", Some("v1")),
            "content:post:123:v1"
        );
    }

    #[test]
    fn key_generation_is_deterministic() {
        let first = generate_cache_key("user", "email", "a@b.c", None);
        let second = generate_cache_key("user", "email", "a@b.c", None);
        assert_eq!(first, second);
    }

    #[test]
    fn parse_versioned_key() {
        let parsed = parse_cache_key("content:post:123:v1").expect("four segments");
        assert_eq!(parsed.namespace, "content");
        assert_eq!(parsed.kind, "post");
        assert_eq!(parsed.identifier, "123");
        assert_eq!(parsed.version, "v1");

        assert!(parse_cache_key("content:post:123").is_none());
        assert!(parse_cache_key("a:b:c:d:e").is_none());
    }

    #[test]
    fn query_hash_ignores_parameter_order() {
        let a = json!({"limit": 10, "sort": "desc", "tag": "rust"});
        let b = json!({"tag": "rust", "limit": 10, "sort": "desc"});
        let c = json!({"tag": "go", "limit": 10, "sort": "desc"});

        let hash_a = hash_query_params(a.as_object().expect("object"));
        let hash_b = hash_query_params(b.as_object().expect("object"));
        let hash_c = hash_query_params(c.as_object().expect("object"));

        assert_eq!(hash_a, hash_b);
        assert_ne!(hash_a, hash_c);
        assert_eq!(hash_a.len(), 16);
    }

    #[test]
    fn pattern_builder_shapes() {
        assert_eq!(cache_pattern("content", None, None), "content:*");
        assert_eq!(cache_pattern("content", Some("post"), None), "content:post:*");
        assert_eq!(
            cache_pattern("content", Some("post"), Some("7")),
            "content:post:7:*"
        );
    }

    #[test]
    fn trailing_star_is_prefix_match() {
        let pattern = KeyPattern::new("content:*").expect("valid pattern");
        assert!(pattern.matches("content:item:1"));
        assert!(pattern.matches("content:"));
        assert!(!pattern.matches("contents:item:1"));
        assert!(!pattern.matches("api:content:1"));
        assert_eq!(pattern.literal_prefix(), "content:");
    }

    #[test]
    fn question_mark_matches_one_character() {
        let pattern = KeyPattern::new("user:id:?").expect("valid pattern");
        assert!(pattern.matches("user:id:7"));
        assert!(!pattern.matches("user:id:77"));
        assert!(!pattern.matches("user:id:"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = KeyPattern::new("api:list:(a|b).+").expect("valid pattern");
        assert!(pattern.matches("api:list:(a|b).+"));
        assert!(!pattern.matches("api:list:a"));
        assert!(pattern.is_exact());
    }

    #[test]
    fn interior_star_crosses_separators() {
        let pattern = KeyPattern::new("content:*:v2").expect("valid pattern");
        assert!(pattern.matches("content:item:1:v2"));
        assert!(!pattern.matches("content:item:1:v1"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(matches!(KeyPattern::new(""), Err(PatternError::Empty)));
    }
}
