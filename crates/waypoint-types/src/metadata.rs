//! Shallow, last-writer-wins merging of opaque JSON metadata.

use serde_json::{Map, Value};

/// Merge `delta` over `base` and return the result.
///
/// - both objects: each top-level key of `delta` replaces the same key of
///   `base`; keys only in `base` survive. Nested objects are replaced, not
///   merged.
/// - `delta` is `null`: `base` is returned unchanged.
/// - anything else: `delta` replaces `base`.
pub fn merge_metadata(base: Value, delta: Value) -> Value {
    match (base, delta) {
        (base, Value::Null) => base,
        (Value::Object(mut base), Value::Object(delta)) => {
            merge_map(&mut base, delta);
            Value::Object(base)
        }
        (_, delta) => delta,
    }
}

/// Insert every entry of `delta` into `base`, replacing existing keys.
pub fn merge_map(base: &mut Map<String, Value>, delta: Map<String, Value>) {
    for (key, value) in delta {
        base.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_one_level() {
        let merged = merge_metadata(
            json!({"a": 1, "nested": {"x": 1, "y": 2}}),
            json!({"b": 2, "nested": {"x": 9}}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 9}}));
    }

    #[test]
    fn null_delta_keeps_base() {
        assert_eq!(merge_metadata(json!({"a": 1}), Value::Null), json!({"a": 1}));
    }

    #[test]
    fn non_object_delta_replaces() {
        assert_eq!(merge_metadata(json!({"a": 1}), json!([1, 2])), json!([1, 2]));
        assert_eq!(merge_metadata(Value::Null, json!({"a": 1})), json!({"a": 1}));
    }
}
