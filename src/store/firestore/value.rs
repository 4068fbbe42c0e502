//! JSON ↔ Firestore typed value conversion.
//!
//! Firestore's REST API wraps every value in a single-key object naming its
//! type, e.g. `{"stringValue": "hi"}` or `{"arrayValue": {"values": [..]}}`.
//! Integers travel as decimal strings.

use serde_json::{Map, Number, Value, json};

/// Encode a JSON value as a Firestore value.
pub fn encode(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or(0.0) }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Encode a JSON object as a Firestore `fields` map.
pub fn encode_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), encode(v))).collect()
}

/// Decode a Firestore value into plain JSON.
pub fn decode(value: &Value) -> Result<Value, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected typed value object, got {value}"))?;
    let (tag, inner) = match object.iter().next() {
        Some(entry) if object.len() == 1 => entry,
        _ => return Err(format!("expected exactly one type tag, got {value}")),
    };

    match tag.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| format!("bad booleanValue {inner}")),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| format!("bad integerValue {inner}"))
        }
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("bad doubleValue {inner}")),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| format!("bad {tag} {inner}")),
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => {
            let values = match inner.get("values") {
                None => return Ok(Value::Array(Vec::new())),
                Some(values) => values
                    .as_array()
                    .ok_or_else(|| format!("bad arrayValue {inner}"))?,
            };
            values
                .iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "mapValue" => match inner.get("fields") {
            None => Ok(Value::Object(Map::new())),
            Some(Value::Object(fields)) => decode_fields(fields).map(Value::Object),
            Some(other) => Err(format!("bad mapValue fields {other}")),
        },
        other => Err(format!("unknown value type {other}")),
    }
}

/// Decode a Firestore `fields` map into a JSON object.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    fields
        .iter()
        .map(|(k, v)| decode(v).map(|decoded| (k.clone(), decoded)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_travel_as_strings() {
        assert_eq!(encode(&json!(42)), json!({"integerValue": "42"}));
        assert_eq!(decode(&json!({"integerValue": "42"})).unwrap(), json!(42));
    }

    #[test]
    fn nested_document_roundtrip() {
        let original = json!({
            "password": null,
            "oauth_user": true,
            "score": 1.5,
            "chat_history": [
                {"message_id": 0, "user_message": "hi", "bot_reply": "hello"}
            ],
            "tags": []
        });
        let fields = encode_fields(original.as_object().unwrap());
        assert_eq!(
            fields["chat_history"]["arrayValue"]["values"][0]["mapValue"]["fields"]["user_message"],
            json!({"stringValue": "hi"})
        );
        let decoded = decode_fields(&fields).unwrap();
        assert_eq!(Value::Object(decoded), original);
    }

    #[test]
    fn empty_containers_may_omit_children() {
        assert_eq!(decode(&json!({"arrayValue": {}})).unwrap(), json!([]));
        assert_eq!(decode(&json!({"mapValue": {}})).unwrap(), json!({}));
    }

    #[test]
    fn timestamps_decode_as_strings() {
        let decoded = decode(&json!({"timestampValue": "2024-01-01T00:00:00Z"})).unwrap();
        assert_eq!(decoded, json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn unknown_or_ambiguous_tags_are_errors() {
        assert!(decode(&json!({"mysteryValue": 1})).is_err());
        assert!(decode(&json!({"stringValue": "a", "booleanValue": true})).is_err());
        assert!(decode(&json!("bare")).is_err());
        assert!(decode(&json!({"integerValue": "ten"})).is_err());
    }
}
