use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;

/// The numeric key a long URL is shortened to.
///
/// Keys are dense and assigned in strictly increasing order by a single
/// backend instance. Once assigned, a key is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortKey(u64);

impl ShortKey {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Generates the full shortened URL based on the provided base URL.
    pub fn to_url(self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.0)
    }

    /// Extracts the key from either a bare key (`"42"`) or a short URL
    /// rendered under `base_url` (`"http://host/42"`).
    ///
    /// Returns `None` when the input is neither.
    pub fn from_short_url(base_url: &str, value: &str) -> Option<Self> {
        let value = value.trim();
        let base = base_url.trim_end_matches('/');
        let tail = match value.strip_prefix(base) {
            Some(rest) if !base.is_empty() => rest.strip_prefix('/')?,
            _ => value,
        };
        tail.parse().ok()
    }
}

impl Display for ShortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShortKey {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for ShortKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifies the client that created an entry.
///
/// Owner ids share the allocation discipline of [`ShortKey`] but live in a
/// separate namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(u64);

impl OwnerId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for OwnerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_url_trims_trailing_slash() {
        let key = ShortKey::new(17);
        assert_eq!(key.to_url("http://localhost:8080"), "http://localhost:8080/17");
        assert_eq!(key.to_url("http://localhost:8080/"), "http://localhost:8080/17");
    }

    #[test]
    fn from_short_url_accepts_full_url() {
        let key = ShortKey::from_short_url("http://localhost:8080", "http://localhost:8080/42");
        assert_eq!(key, Some(ShortKey::new(42)));
    }

    #[test]
    fn from_short_url_accepts_bare_key() {
        assert_eq!(
            ShortKey::from_short_url("http://localhost:8080/", " 7 "),
            Some(ShortKey::new(7))
        );
    }

    #[test]
    fn from_short_url_rejects_garbage() {
        let base = "http://localhost:8080";
        assert_eq!(ShortKey::from_short_url(base, "abc"), None);
        assert_eq!(ShortKey::from_short_url(base, "http://localhost:8080/x1"), None);
        assert_eq!(ShortKey::from_short_url(base, "http://elsewhere/1"), None);
        assert_eq!(ShortKey::from_short_url(base, "-1"), None);
    }

    #[test]
    fn serializes_as_plain_number() {
        let json = serde_json::to_string(&ShortKey::new(5)).unwrap();
        assert_eq!(json, "5");
        let owner: OwnerId = serde_json::from_str("9").unwrap();
        assert_eq!(owner, OwnerId::new(9));
    }
}
