use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Label set of an alert instance. Ordered so that hashing and formatting
/// are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Deterministic identity of a label set inside one rule's cache.
pub fn cache_id(labels: &Labels) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in labels {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Drops internal `__name__` labels before labels are shown to people.
pub fn remove_private_labels(labels: &Labels) -> Labels {
    labels
        .iter()
        .filter(|(k, _)| !k.starts_with("__") && !k.ends_with("__"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn format_labels(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
