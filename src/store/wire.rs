//! Remote document encoding.
//!
//! Remote documents carry history as tagged objects
//! (`{message_id, user_message, bot_reply, timestamp}`) because the document
//! store does not allow nested arrays. Every other field is stored top-level
//! exactly as `UserRecord` serializes it.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::error::StoreError;
use crate::model::{Exchange, UserRecord};

pub const HISTORY_FIELD: &str = "chat_history";
pub const UPDATED_FIELD: &str = "last_updated";

/// Encode history as tagged objects stamped with `written_at`.
pub fn tagged_history(history: &[Exchange], written_at: DateTime<Utc>) -> Value {
    let timestamp = written_at.to_rfc3339();
    Value::Array(
        history
            .iter()
            .enumerate()
            .map(|(i, exchange)| {
                json!({
                    "message_id": i,
                    "user_message": exchange.prompt,
                    "bot_reply": exchange.reply,
                    "timestamp": timestamp,
                })
            })
            .collect(),
    )
}

/// Encode a full record as remote document fields.
pub fn to_document(
    user_id: &str,
    record: &UserRecord,
    written_at: DateTime<Utc>,
) -> Result<Map<String, Value>, StoreError> {
    let mut fields = match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => return Err(StoreError::malformed(user_id, "record did not encode as an object")),
        Err(e) => return Err(StoreError::malformed(user_id, e.to_string())),
    };
    fields.insert(
        HISTORY_FIELD.to_string(),
        tagged_history(&record.history, written_at),
    );
    Ok(fields)
}

/// The partial document written by a history-only merge.
pub fn history_patch(history: &[Exchange], updated_at: DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(HISTORY_FIELD.to_string(), tagged_history(history, updated_at));
    fields.insert(UPDATED_FIELD.to_string(), Value::String(updated_at.to_rfc3339()));
    fields
}

/// Decode remote document fields into a record.
pub fn from_document(user_id: &str, fields: Map<String, Value>) -> Result<UserRecord, StoreError> {
    UserRecord::from_json(user_id, Value::Object(fields))
}
