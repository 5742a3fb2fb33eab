//! Cache key normalization
//!
//! Two requests that differ only in the cache-busting query parameter, their
//! method, their headers or their fragment project onto the same key.

use reqwest::Url;
use std::fmt;

/// Credentials mode recorded on every key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialsMode {
    SameOrigin,
}

/// Canonical identity of a cached same-origin response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    url: Url,
    credentials: CredentialsMode,
}

impl CacheKey {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn credentials(&self) -> CredentialsMode {
        self.credentials
    }

    /// Storage key; the method is always GET so only the URL varies
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET {}", self.url)
    }
}

/// Projects request URLs onto cache keys
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    origin: Url,
    buster_param: String,
}

impl KeyNormalizer {
    pub fn new(origin: Url, buster_param: impl Into<String>) -> Self {
        KeyNormalizer {
            origin,
            buster_param: buster_param.into(),
        }
    }

    /// Normalize `url`, or `None` when it is not same-origin
    pub fn normalize(&self, url: &Url) -> Option<CacheKey> {
        if url.origin() != self.origin.origin() {
            return None;
        }

        let mut url = url.clone();
        url.set_fragment(None);

        if url.query().is_some() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| &**name != self.buster_param.as_str())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();

            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }
        }

        Some(CacheKey {
            url,
            credentials: CredentialsMode::SameOrigin,
        })
    }

    /// Normalize a same-origin path such as a precache entry or the offline shell
    pub fn normalize_path(&self, path: &str) -> Option<CacheKey> {
        let url = self.origin.join(path).ok()?;
        self.normalize(&url)
    }
}
