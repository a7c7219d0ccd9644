//! File metadata: a case-insensitive string map.
//!
//! Metadata travels between peers as HTTP headers, so keys follow header
//! semantics: they are compared case-insensitively and stored lowercased.
//! A handful of reserved keys carry the version ledger and tombstones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const VERSION: &str = "sync-version";
pub const SOURCE: &str = "sync-source";
pub const HISTORY: &str = "sync-history";
pub const CONFLICT: &str = "sync-conflict";
pub const CONTENT_HASH: &str = "content-hash";
pub const ETAG: &str = "etag";
pub const DELETED: &str = "sync-deleted";
pub const RENAME: &str = "sync-rename";

/// Keys owned by rdsync itself (never user metadata)
pub const RESERVED: &[&str] = &[
    VERSION,
    SOURCE,
    HISTORY,
    CONFLICT,
    CONTENT_HASH,
    ETAG,
    DELETED,
    RENAME,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that are not reserved rdsync keys.
    pub fn user_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !RESERVED.contains(k))
    }

    /// Drop all user entries and take the user entries of `other`.
    pub fn replace_user_entries(&mut self, other: &Metadata) {
        self.entries
            .retain(|k, _| RESERVED.contains(&k.as_str()));
        for (k, v) in other.user_entries() {
            self.entries.insert(k.to_string(), v.to_string());
        }
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.get(CONTENT_HASH)
    }

    pub fn is_conflicted(&self) -> bool {
        self.flag(CONFLICT)
    }

    pub fn is_deleted(&self) -> bool {
        self.flag(DELETED)
    }

    pub fn rename_target(&self) -> Option<&str> {
        self.get(RENAME)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Metadata> for BTreeMap<String, String> {
    fn from(meta: Metadata) -> Self {
        meta.entries
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut m = Metadata::new();
        for (k, v) in iter {
            m.insert(k, v);
        }
        m
    }
}
