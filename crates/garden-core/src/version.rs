//! Content-addressed action versions.
//!
//! A version is the SHA-256 of the action's canonical resolved spec plus the
//! versions of everything it depends on, truncated to a short hex prefix.
//! Re-running the exact same inputs therefore hits the result cache.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix carried by every computed version string.
pub const VERSION_PREFIX: &str = "v-";

const VERSION_HEX_LEN: usize = 12;

/// Canonical JSON encoding: `serde_json`'s map is ordered, so serialisation
/// of an already-built tree is deterministic.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Compute a content version from a resolved spec and dependency versions.
///
/// Dependency versions must be supplied in a stable order (the graph builder
/// uses the sorted dependency list).
pub fn content_version<S: AsRef<str>>(spec: &Value, dep_versions: &[S]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(spec).as_bytes());
    for dep in dep_versions {
        hasher.update(b"\0");
        hasher.update(dep.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest
        .iter()
        .take(VERSION_HEX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}{}", VERSION_PREFIX, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_is_stable_for_equal_input() {
        let spec = json!({"command": ["make"], "env": {"A": "1"}});
        let a = content_version(&spec, &["v-abc"]);
        let b = content_version(&spec, &["v-abc"]);
        assert_eq!(a, b);
        assert!(a.starts_with(VERSION_PREFIX));
        assert_eq!(a.len(), VERSION_PREFIX.len() + VERSION_HEX_LEN);
    }

    #[test]
    fn test_any_spec_change_changes_version() {
        let base = json!({"command": ["make", "build"]});
        let changed = json!({"command": ["make", "buil"]});
        let deps: [&str; 0] = [];
        assert_ne!(content_version(&base, &deps), content_version(&changed, &deps));
    }

    #[test]
    fn test_dependency_version_feeds_into_version() {
        let spec = json!({"command": ["make"]});
        assert_ne!(
            content_version(&spec, &["v-111111111111"]),
            content_version(&spec, &["v-222222222222"])
        );
    }

    #[test]
    fn test_key_order_does_not_matter() {
        // serde_json orders map keys, so logically-equal objects hash equal.
        let a: Value = serde_json::from_str(r#"{"x": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "x": 1}"#).unwrap();
        let deps: [&str; 0] = [];
        assert_eq!(content_version(&a, &deps), content_version(&b, &deps));
    }
}
