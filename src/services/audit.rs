use serde_json::{Map, Value};

use crate::{
    models::{new_public_id, LifecycleEventKind, NewLifecycleEvent},
    repository::Store,
};

pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Keys whose values never reach logs or event metadata. Matching ignores
/// case, `-` and `_`.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "name",
    "firstname",
    "surname",
    "lastname",
    "fullname",
    "documentnumber",
    "document",
    "idnumber",
    "email",
    "phone",
    "telephone",
    "address",
    "birthdate",
    "dateofbirth",
    "password",
    "token",
    "apikey",
    "secret",
    "authorization",
    "credentials",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key
        .chars()
        .filter(|ch| *ch != '_' && *ch != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    SENSITIVE_FIELDS.contains(&normalized.as_str())
}

/// Recursive copy of `value` with every sensitive key replaced by the marker.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                if is_sensitive_key(key) && !item.is_null() {
                    out.insert(key.clone(), Value::String(REDACTION_MARKER.to_string()));
                } else {
                    out.insert(key.clone(), redact(item));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        _ => value.clone(),
    }
}

pub fn lifecycle_event(kind: LifecycleEventKind, metadata: Value) -> NewLifecycleEvent {
    NewLifecycleEvent {
        public_id: new_public_id(),
        kind,
        metadata: redact(&metadata),
    }
}

/// Appends a lifecycle event. Failures are logged and swallowed; the event
/// log is operational audit and never blocks the caller.
pub async fn write_lifecycle_event(
    store: &dyn Store,
    reservation_id: i64,
    kind: LifecycleEventKind,
    metadata: Value,
) {
    if let Err(error) = store
        .append_event(reservation_id, lifecycle_event(kind, metadata))
        .await
    {
        tracing::warn!(
            reservation_id,
            kind = kind.as_str(),
            error = %error,
            "Could not write lifecycle event"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{redact, REDACTION_MARKER};

    #[test]
    fn redacts_nested_personal_fields() {
        let raw = json!({
            "attempts": 2,
            "guest": {"name": "Ana", "document_number": "X1234567L", "nationality": "ES"},
            "guests": [{"Email": "ana@example.com", "birth_date": "1990-01-01"}],
            "apiKey": "secret"
        });
        let redacted = redact(&raw);
        assert_eq!(redacted["attempts"], json!(2));
        assert_eq!(redacted["guest"]["name"], json!(REDACTION_MARKER));
        assert_eq!(redacted["guest"]["document_number"], json!(REDACTION_MARKER));
        assert_eq!(redacted["guest"]["nationality"], json!("ES"));
        assert_eq!(redacted["guests"][0]["Email"], json!(REDACTION_MARKER));
        assert_eq!(redacted["guests"][0]["birth_date"], json!(REDACTION_MARKER));
        assert_eq!(redacted["apiKey"], json!(REDACTION_MARKER));
    }

    #[test]
    fn leaves_null_sensitive_fields_alone() {
        let redacted = redact(&json!({"phone": null, "state": "sent"}));
        assert_eq!(redacted, json!({"phone": null, "state": "sent"}));
    }
}
