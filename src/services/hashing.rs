use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// SHA-256 of the canonical JSON form of `value`, lowercase hex.
///
/// Object keys are sorted recursively before serialization, so two parties
/// holding structurally equal payloads compute the same digest regardless
/// of field order.
pub fn sha256_hex<T: Serialize>(value: &T) -> AppResult<String> {
    let hash_error =
        |error: serde_json::Error| AppError::Internal(format!("Could not hash payload: {error}"));
    let canonical = canonicalize_json(&serde_json::to_value(value).map_err(hash_error)?);
    let bytes = serde_json::to_vec(&canonical).map_err(hash_error)?;
    Ok(hex_digest(&Sha256::digest(&bytes)))
}

pub fn sha256_text(text: &str) -> String {
    hex_digest(&Sha256::digest(text.as_bytes()))
}

pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted = map
                .iter()
                .map(|(key, item)| (key.clone(), canonicalize_json(item)))
                .collect::<BTreeMap<_, _>>();

            let mut obj = Map::new();
            for (key, item) in sorted {
                obj.insert(key, item);
            }
            Value::Object(obj)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::{sha256_hex, sha256_text};

    #[test]
    fn hash_is_stable_and_order_independent() {
        let first = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});
        let second = json!({"a": {"x": "v", "y": [1, 2]}, "b": 1});
        let digest = sha256_hex(&first).expect("hash");
        assert_eq!(digest, sha256_hex(&first).expect("hash"));
        assert_eq!(digest, sha256_hex(&second).expect("hash"));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn any_field_change_changes_hash() {
        let base = json!({"checkIn": "2024-06-15", "guests": [{"doc": "X1"}]});
        let changed = json!({"checkIn": "2024-06-15", "guests": [{"doc": "X2"}]});
        assert_ne!(
            sha256_hex(&base).expect("hash"),
            sha256_hex(&changed).expect("hash")
        );
    }

    #[test]
    fn unserializable_payload_is_an_error() {
        // JSON object keys must be strings.
        let mut payload = HashMap::new();
        payload.insert((1, 2), "value");
        assert!(sha256_hex(&payload).is_err());
    }

    #[test]
    fn hashes_plain_text() {
        assert_eq!(
            sha256_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
