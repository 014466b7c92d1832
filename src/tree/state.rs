//! Versioned node state snapshot.
//!
//! Each node publishes its current state as an immutable snapshot behind an
//! `ArcSwap`: readers never take the node lock, writers clone, mutate, and
//! store under it. The two versions are backend-assigned; replicas that have
//! synchronized the same backend revision report equal versions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedNodeState {
    properties: BTreeMap<String, String>,
    child_names: BTreeSet<String>,
    properties_version: u64,
    children_version: u64,
}

impl VersionedNodeState {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(|k| k.as_str())
    }

    pub fn child_names(&self) -> &BTreeSet<String> {
        &self.child_names
    }

    pub fn properties_version(&self) -> u64 {
        self.properties_version
    }

    pub fn children_version(&self) -> u64 {
        self.children_version
    }

    pub(crate) fn put_property(&mut self, key: &str, value: &str) -> Option<String> {
        self.properties.insert(key.to_string(), value.to_string())
    }

    pub(crate) fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub(crate) fn replace_properties(&mut self, properties: BTreeMap<String, String>, version: u64) {
        self.properties = properties;
        self.properties_version = version;
    }

    pub(crate) fn set_properties_version(&mut self, version: u64) {
        self.properties_version = version;
    }

    pub(crate) fn add_child_name(&mut self, name: &str) {
        self.child_names.insert(name.to_string());
    }

    pub(crate) fn remove_child_name(&mut self, name: &str) {
        self.child_names.remove(name);
    }

    pub(crate) fn replace_child_names(&mut self, names: BTreeSet<String>, version: u64) {
        self.child_names = names;
        self.children_version = version;
    }

    pub(crate) fn observe_children_version(&mut self, version: u64) {
        self.children_version = self.children_version.max(version);
    }

    /// Serializes the property map into the opaque blob written per node.
    pub(crate) fn encode_properties(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.properties)?)
    }
}

/// Decodes a property blob read back from the backend. A missing entry has
/// no blob; an empty blob is not produced by `encode_properties`.
pub(crate) fn decode_properties(blob: &[u8]) -> Result<BTreeMap<String, String>> {
    if blob.is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(bincode::deserialize(blob)?)
}

/// Keys whose values differ between two property maps, with old and new
/// values. Drives listener notification for remotely observed changes.
pub(crate) fn property_diff(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Vec<(String, Option<String>, Option<String>)> {
    let mut out = Vec::new();
    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) if new_value != old_value => {
                out.push((key.clone(), Some(old_value.clone()), Some(new_value.clone())));
            }
            Some(_) => {}
            None => out.push((key.clone(), Some(old_value.clone()), None)),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            out.push((key.clone(), None, Some(new_value.clone())));
        }
    }
    out
}
