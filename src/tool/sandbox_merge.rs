//! Recursive JSON merge used to apply sandbox settings over a tool's config
//! file. Shared between the host (orchestrator) and the small helper binary
//! pushed into the container, so both sides use exactly the same merge
//! semantics.

use serde_json::Value;

/// Merge `overlay` into `base`. Objects merge key-by-key (recursively);
/// any other value in `overlay` (including an array) replaces the
/// corresponding value in `base` wholesale rather than combining them.
pub fn merge_json(mut base: Value, overlay: Value) -> Value {
    match (&mut base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.remove(&key) {
                    Some(base_value) => {
                        base_map.insert(key, merge_json(base_value, overlay_value));
                    }
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
            base
        }
        (_, overlay_value) => overlay_value,
    }
}

/// Wire format for the stdin payload the pushed helper binary reads:
/// `{"base": <value>, "overlay": <value>}`. Defined here so host and
/// in-container sides can't drift.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MergeRequest {
    pub base: Value,
    pub overlay: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_keys_win_on_conflict() {
        let base = json!({"a": 1, "b": 2});
        let overlay = json!({"b": 3});
        assert_eq!(merge_json(base, overlay), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let base = json!({"permissions": {"defaultMode": "ask", "foo": true}});
        let overlay = json!({"permissions": {"defaultMode": "bypassPermissions"}});
        assert_eq!(
            merge_json(base, overlay),
            json!({"permissions": {"defaultMode": "bypassPermissions", "foo": true}})
        );
    }

    #[test]
    fn non_object_overlay_replaces_wholesale() {
        let base = json!({"tags": ["a", "b"]});
        let overlay = json!({"tags": ["c"]});
        assert_eq!(merge_json(base, overlay), json!({"tags": ["c"]}));
    }

    #[test]
    fn keys_absent_from_overlay_are_preserved() {
        let base = json!({"a": 1, "b": {"c": 2}});
        let overlay = json!({});
        assert_eq!(merge_json(base.clone(), overlay), base);
    }
}
