//! Owned-field merge patches
//!
//! The controller owns labels, annotations and the desired state (`spec`,
//! `data`, `type`) of the objects it writes. Everything else, including
//! `status`, resource versions and server-populated metadata, is left to the
//! API server and to the remote operators.

use crate::error::ContextError;
use serde::Serialize;
use serde_json::{Map, Value, json};

const SERVER_OWNED_TOP_LEVEL: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

/// Builds a JSON merge patch carrying only the fields the controller owns
pub(crate) fn owned_fields_patch<K: Serialize>(object: &K) -> Result<Value, ContextError> {
    let value = serde_json::to_value(object)?;
    let Value::Object(fields) = value else {
        return Ok(Value::Object(Map::new()));
    };

    let mut patch = Map::new();
    let mut metadata = Map::new();
    if let Some(Value::Object(meta)) = fields.get("metadata") {
        for owned in ["labels", "annotations"] {
            if let Some(v) = meta.get(owned) {
                metadata.insert(owned.to_string(), v.clone());
            }
        }
    }
    if !metadata.is_empty() {
        patch.insert("metadata".to_string(), Value::Object(metadata));
    }

    for (field, v) in fields {
        if !SERVER_OWNED_TOP_LEVEL.contains(&field.as_str()) {
            patch.insert(field, v);
        }
    }
    Ok(Value::Object(patch))
}

/// JSON patch turning the `old` status of an object into `new`
///
/// Paths are rooted at the object, so removed datacenters and cleared
/// errors become `remove` operations under `/status`.
pub(crate) fn status_patch<S: Serialize>(
    old: Option<&S>,
    new: &S,
) -> Result<json_patch::Patch, ContextError> {
    // `add` works whether the server omits `status` or returns it as null
    let old = match old {
        Some(status) => json!({ "status": serde_json::to_value(status)? }),
        None => json!({}),
    };
    let new = json!({ "status": serde_json::to_value(new)? });
    Ok(json_patch::diff(&old, &new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_owned_fields_drop_status_and_server_metadata() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "test",
                "resourceVersion": "42",
                "labels": {"a": "b"}
            },
            "data": {"k": "v"},
            "status": {"ready": true}
        });
        let patch = owned_fields_patch(&object).unwrap();
        assert_eq!(patch, json!({"metadata": {"labels": {"a": "b"}}, "data": {"k": "v"}}));
    }

    #[test]
    fn test_status_patch_removes_dropped_entries() {
        let old = json!({
            "datacenters": {"dc1": {"ready": true}, "dc2": {"ready": false}},
            "error": "boom"
        });
        let new = json!({"datacenters": {"dc1": {"ready": true}}});
        let patch = status_patch(Some(&old), &new).unwrap();
        assert_eq!(patch.0.len(), 2);

        let mut live = json!({"metadata": {"name": "test"}, "status": old});
        json_patch::patch(&mut live, &patch).unwrap();
        assert_eq!(live, json!({"metadata": {"name": "test"}, "status": new}));
    }

    #[test]
    fn test_status_patch_from_missing_status() {
        let new = json!({"ready": false});
        let patch = status_patch(None::<&Value>, &new).unwrap();

        let mut live = json!({"metadata": {"name": "test"}});
        json_patch::patch(&mut live, &patch).unwrap();
        assert_eq!(live["status"], new);

        let mut null_status = json!({"metadata": {"name": "test"}, "status": null});
        json_patch::patch(&mut null_status, &patch).unwrap();
        assert_eq!(null_status["status"], new);
    }

    #[test]
    fn test_unchanged_status_yields_empty_patch() {
        let status = json!({"ready": true});
        assert!(status_patch(Some(&status), &status).unwrap().0.is_empty());
    }
}
