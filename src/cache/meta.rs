//! Cache metadata attached to API responses.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use super::service::{CacheResult, CacheSource};

pub const HEADER_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");
pub const HEADER_CACHE_SOURCE: HeaderName = HeaderName::from_static("x-cache-source");
pub const HEADER_CACHE_TTL: HeaderName = HeaderName::from_static("x-cache-ttl");

/// Body fragment serialized under `meta.cache`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMeta {
    pub hit: bool,
    pub source: String,
    /// Whole seconds remaining, floored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl CacheMeta {
    pub fn from_result<T>(result: &CacheResult<T>) -> Self {
        Self {
            hit: result.hit,
            source: result.source.as_str().to_string(),
            ttl: result.ttl.as_ref().map(Duration::as_secs),
        }
    }

    /// A miss that was served by the source of truth.
    pub fn database() -> Self {
        Self {
            hit: false,
            source: "database".to_string(),
            ttl: None,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.hit { "HIT" } else { "MISS" }
    }

    /// Write `X-Cache-Status`, `X-Cache-Source` and, when known, `X-Cache-TTL`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HEADER_CACHE_STATUS, HeaderValue::from_static(self.status()));
        if let Ok(source) = HeaderValue::from_str(&self.source) {
            headers.insert(HEADER_CACHE_SOURCE, source);
        }
        match self.ttl {
            Some(ttl) => {
                headers.insert(HEADER_CACHE_TTL, HeaderValue::from(ttl));
            }
            None => {
                headers.remove(HEADER_CACHE_TTL);
            }
        }
    }
}

impl From<CacheSource> for CacheMeta {
    fn from(source: CacheSource) -> Self {
        Self {
            hit: source != CacheSource::Miss,
            source: source.as_str().to_string(),
            ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_meta_floors_ttl_and_sets_headers() {
        let result = CacheResult {
            hit: true,
            data: Some(1),
            source: CacheSource::Kv,
            ttl: Some(Duration::from_millis(4_900)),
        };
        let meta = CacheMeta::from_result(&result);
        assert_eq!(meta.ttl, Some(4));

        let mut headers = HeaderMap::new();
        meta.apply_headers(&mut headers);
        assert_eq!(headers[&HEADER_CACHE_STATUS], "HIT");
        assert_eq!(headers[&HEADER_CACHE_SOURCE], "kv");
        assert_eq!(headers[&HEADER_CACHE_TTL], "4");
    }

    #[test]
    fn database_meta_has_no_ttl_header() {
        let meta = CacheMeta::database();
        let mut headers = HeaderMap::new();
        meta.apply_headers(&mut headers);
        assert_eq!(headers[&HEADER_CACHE_STATUS], "MISS");
        assert_eq!(headers[&HEADER_CACHE_SOURCE], "database");
        assert!(!headers.contains_key(&HEADER_CACHE_TTL));

        let json = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(json, serde_json::json!({"hit": false, "source": "database"}));
    }

    #[test]
    fn miss_result_meta() {
        let meta = CacheMeta::from_result(&CacheResult::<u8>::miss());
        assert_eq!(meta, CacheMeta::from(CacheSource::Miss));
    }
}
