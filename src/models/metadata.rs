//! User-defined and system metadata carried alongside an object.
//!
//! Keys are header names and are normalized to lower case on insert, so
//! `X-Original-ETag`, `x-original-etag` and `X-ORIGINAL-ETAG` all address the
//! same entry. S3 backends return user metadata lower-cased, which makes the
//! normalization the only way two backends agree on a key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header-name → value mapping attached to an object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

/// A metadata entry this engine owns.
///
/// Reserved fields are persisted on the destination and read back by later
/// runs, possibly by a newer build. The key of a given `version` must never
/// change; a new layout gets a new version and readers keep accepting the
/// old key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedField {
    /// Lower-case header name.
    pub key: &'static str,

    /// Schema version of the field.
    pub version: u32,
}

/// Original source ETag, stamped before upload so a destination that
/// re-digests the payload (different multipart chunking, whole-file MD5)
/// can still be recognised as current on the next run.
pub const ORIGINAL_ETAG: ReservedField = ReservedField {
    key: "x-original-etag",
    version: 1,
};

impl ReservedField {
    /// Read the field from `metadata`, if present.
    pub fn read<'a>(&self, metadata: &'a Metadata) -> Option<&'a str> {
        metadata.get(self.key)
    }

    /// Write `value` into `metadata`, replacing any previous value.
    pub fn write(&self, metadata: &mut Metadata, value: &str) {
        metadata.insert(self.key, value);
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, lower-casing the key. Returns the replaced value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(normalize(key.as_ref()), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&normalize(key)).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&normalize(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Source ETag annotated by a previous copy, if any.
    pub fn original_etag(&self) -> Option<&str> {
        ORIGINAL_ETAG.read(self)
    }

    pub fn set_original_etag(&mut self, etag: &str) {
        ORIGINAL_ETAG.write(self, etag);
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

impl IntoIterator for Metadata {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_normalized() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Original-ETag", "\"abc\"");

        assert_eq!(metadata.get("x-original-etag"), Some("\"abc\""));
        assert_eq!(metadata.get("X-ORIGINAL-ETAG"), Some("\"abc\""));
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn reinserting_with_other_case_replaces() {
        let mut metadata: Metadata = [("Content-Language", "de")].into_iter().collect();
        let previous = metadata.insert("content-language", "en");

        assert_eq!(previous.as_deref(), Some("de"));
        assert_eq!(metadata.get("Content-Language"), Some("en"));
    }

    #[test]
    fn original_etag_uses_reserved_field() {
        let mut metadata = Metadata::new();
        assert!(metadata.original_etag().is_none());

        metadata.set_original_etag("\"d41d8cd98f00b204e9800998ecf8427e-3\"");
        assert_eq!(
            metadata.get(ORIGINAL_ETAG.key),
            Some("\"d41d8cd98f00b204e9800998ecf8427e-3\"")
        );
        assert_eq!(ORIGINAL_ETAG.version, 1);
    }
}
