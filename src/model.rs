//! User records and chat exchanges.
//!
//! `UserRecord` is the canonical in-memory shape. The two storage encodings of
//! chat history (tagged objects remotely, `[prompt, reply]` pairs on disk) only
//! exist at serialization boundaries; reads accept either.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::StoreError;

/// Firestore rejects document ids longer than this many bytes.
const MAX_USER_ID_BYTES: usize = 1500;

/// One conversation turn.
///
/// An empty `reply` means the response is still pending. Pending exchanges
/// live only in the session and are never written to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub prompt: String,
    pub reply: String,
}

impl Exchange {
    pub fn new(prompt: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reply: reply.into(),
        }
    }

    /// A turn whose reply has not arrived yet.
    pub fn pending(prompt: impl Into<String>) -> Self {
        Self::new(prompt, "")
    }

    pub fn is_complete(&self) -> bool {
        !self.reply.is_empty()
    }

    /// Decode either stored shape: `{"user_message", "bot_reply", ..}` or
    /// `["prompt", "reply"]`. Anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let prompt = map.get("user_message")?.as_str()?;
                let reply = map.get("bot_reply")?.as_str()?;
                Some(Self::new(prompt, reply))
            }
            Value::Array(pair) if pair.len() == 2 => {
                Some(Self::new(pair[0].as_str()?, pair[1].as_str()?))
            }
            _ => None,
        }
    }
}

impl<P: Into<String>, R: Into<String>> From<(P, R)> for Exchange {
    fn from((prompt, reply): (P, R)) -> Self {
        Self::new(prompt, reply)
    }
}

impl Serialize for Exchange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.prompt, &self.reply).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Exchange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| D::Error::custom("expected [prompt, reply] or {user_message, bot_reply}"))
    }
}

/// Normalize stored history entries, silently dropping malformed ones.
pub fn normalize_history(entries: &[Value]) -> Vec<Exchange> {
    let history: Vec<Exchange> = entries.iter().filter_map(Exchange::from_value).collect();
    let dropped = entries.len() - history.len();
    if dropped > 0 {
        debug!(dropped, "Dropped malformed history entries");
    }
    history
}

/// Keep only exchanges that are safe to persist.
pub fn complete_only(history: &[Exchange]) -> Vec<Exchange> {
    history.iter().filter(|e| e.is_complete()).cloned().collect()
}

/// A persisted user: credential, chat history and profile fields.
///
/// Field names on the wire follow the stored documents (`password`,
/// `chat_history`, `oauth_user`). Unknown top-level fields are kept in `extra`
/// so a read-modify-write never loses them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Absent for externally-authenticated identities.
    #[serde(rename = "password", default, deserialize_with = "lenient_string")]
    pub credential: Option<String>,

    #[serde(
        rename = "chat_history",
        default,
        deserialize_with = "deserialize_history"
    )]
    pub history: Vec<Exchange>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub display_name: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub email: Option<String>,

    /// Identity provider that created the account (`google`, `github`, ...).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub provider: Option<String>,

    #[serde(
        rename = "oauth_user",
        default,
        skip_serializing_if = "is_false",
        deserialize_with = "lenient_bool"
    )]
    pub external: bool,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    pub last_login: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    /// A fresh password account created now.
    pub fn with_credential(credential: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            credential: Some(credential.into()),
            created_at: Some(now),
            last_login: Some(now),
            ..Self::default()
        }
    }

    /// Compare a candidate secret with the stored one.
    pub fn credential_matches(&self, candidate: &str) -> bool {
        match &self.credential {
            Some(stored) => stored.as_bytes() == candidate.as_bytes(),
            None => false,
        }
    }

    /// Decode a record from a JSON object, normalizing history.
    pub fn from_json(user_id: &str, value: Value) -> Result<Self, StoreError> {
        if !value.is_object() {
            return Err(StoreError::malformed(user_id, "record is not a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| StoreError::malformed(user_id, e.to_string()))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Profile fields of the wrong type read as absent rather than failing the
/// whole record.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => {
            debug!(value = %other, "Dropped wrong-typed profile field");
            Ok(None)
        }
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn deserialize_history<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Exchange>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(entries)) => Ok(normalize_history(&entries)),
        _ => Ok(Vec::new()),
    }
}

/// Lenient timestamp (de)serialization. Timestamps are advisory: values that
/// do not parse read as absent instead of failing the whole record.
pub(crate) mod timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?
            .as_ref()
            .and_then(Value::as_str)
            .and_then(parse))
    }

    /// Parse RFC 3339, naive ISO-8601 or `%Y-%m-%d %H:%M:%S`.
    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
                return Some(ndt.and_utc());
            }
        }
        None
    }
}

/// Check that `user_id` can serve as a document id and a file name.
pub fn validate_user_id(user_id: &str) -> Result<(), StoreError> {
    let reason = if user_id.is_empty() {
        Some("empty")
    } else if user_id.len() > MAX_USER_ID_BYTES {
        Some("longer than 1500 bytes")
    } else if user_id == "." || user_id == ".." {
        Some("reserved path name")
    } else if user_id.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if user_id.chars().any(char::is_control) {
        Some("contains control characters")
    } else if user_id.len() > 4 && user_id.starts_with("__") && user_id.ends_with("__") {
        Some("reserved __name__ form")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidUserId {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
