//! JSON line envelope codec for the peer message channel.
//!
//! Wire format: one JSON object per line, UTF-8, newline-terminated.
//!
//! ```text
//! call:            {"_Message_":"<name>","_Token_":<int>, ...payload}
//! fire-and-forget: {"_Message_":"<name>", ...payload}
//! reply:           {"_Message_":"_Result_","Token":<int>,"Result":<any>}
//!                  {"_Message_":"_Result_","Token":<int>,"Error":"<string>"}
//! ```
//!
//! `_Message_` is required on every envelope; `_Token_` is present only on
//! calls that expect a reply. Every other field is the open payload. Replies
//! use the fixed name `_Result_` and carry the correlating token inside the
//! payload as `Token`.

use serde_json::{Map, Value};
use thiserror::Error;

/// Reserved field naming the message. Required on every envelope.
pub const MESSAGE_FIELD: &str = "_Message_";

/// Reserved field carrying the RPC token. Present only on calls that expect
/// a reply.
pub const TOKEN_FIELD: &str = "_Token_";

/// Fixed message name used for replies.
pub const RESULT_MESSAGE: &str = "_Result_";

/// Payload field of a `_Result_` envelope holding the correlating token.
pub const RESULT_TOKEN_FIELD: &str = "Token";

/// Payload field of a successful `_Result_` envelope holding the value.
pub const RESULT_VALUE_FIELD: &str = "Result";

/// Payload field of a failed `_Result_` envelope holding the error text.
pub const RESULT_ERROR_FIELD: &str = "Error";

/// Errors that can occur while framing or parsing an envelope line.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The line is valid JSON but not an object.
    #[error("line is not a JSON object")]
    NotAnObject,

    /// The required `_Message_` field is absent.
    #[error("missing required field _Message_")]
    MissingName,

    /// A reserved or result field holds a value of the wrong type.
    #[error("field {0} must be {1}")]
    InvalidField(&'static str, &'static str),

    /// A payload key collides with a reserved field name.
    #[error("payload key collides with reserved field {0}")]
    ReservedField(String),

    /// The line could not be parsed as JSON at all.
    #[error("invalid JSON: {0}")]
    Json(String),
}

/// A decoded message envelope: required name, optional RPC token, and an
/// open payload of everything else in the object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Message name from the `_Message_` field.
    pub name: String,
    /// RPC token from the `_Token_` field, when the sender expects a reply.
    pub token: Option<u64>,
    /// All non-reserved fields of the object.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Creates a fire-and-forget envelope.
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            token: None,
            payload,
        }
    }

    /// Creates a call envelope carrying a token, so the receiver replies
    /// with a correlated `_Result_`.
    pub fn with_token(name: impl Into<String>, token: u64, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            token: Some(token),
            payload,
        }
    }

    /// Creates a successful `_Result_` reply for `token`.
    pub fn result_ok(token: u64, value: Value) -> Self {
        let mut payload = Map::with_capacity(2);
        payload.insert(RESULT_TOKEN_FIELD.to_string(), Value::from(token));
        payload.insert(RESULT_VALUE_FIELD.to_string(), value);
        Self::new(RESULT_MESSAGE, payload)
    }

    /// Creates a failed `_Result_` reply for `token`.
    pub fn result_err(token: u64, error: impl Into<String>) -> Self {
        let mut payload = Map::with_capacity(2);
        payload.insert(RESULT_TOKEN_FIELD.to_string(), Value::from(token));
        payload.insert(RESULT_ERROR_FIELD.to_string(), Value::String(error.into()));
        Self::new(RESULT_MESSAGE, payload)
    }

    /// Returns `true` when this envelope is a `_Result_` reply.
    pub fn is_result(&self) -> bool {
        self.name == RESULT_MESSAGE
    }

    /// Extracts `(token, Ok(value) | Err(text))` from a `_Result_` envelope.
    ///
    /// A reply with neither `Result` nor `Error` yields a generic failure
    /// text; the token itself is required.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] when `Token` is absent or not
    /// a non-negative integer.
    pub fn result_parts(&self) -> Result<(u64, Result<Value, String>), ProtocolError> {
        let token = self
            .payload
            .get(RESULT_TOKEN_FIELD)
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::InvalidField(
                RESULT_TOKEN_FIELD,
                "a non-negative integer",
            ))?;

        let outcome = if let Some(value) = self.payload.get(RESULT_VALUE_FIELD) {
            Ok(value.clone())
        } else {
            match self.payload.get(RESULT_ERROR_FIELD) {
                Some(Value::String(text)) => Err(text.clone()),
                Some(other) => Err(other.to_string()),
                None => Err("remote call failed".to_string()),
            }
        };

        Ok((token, outcome))
    }

    /// Frames this envelope as one newline-terminated JSON line.
    ///
    /// The reserved fields are written first, then the payload fields in
    /// their map order.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReservedField`] when a payload key shadows
    /// `_Message_` or `_Token_`.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        let mut object = Map::with_capacity(self.payload.len() + 2);
        object.insert(MESSAGE_FIELD.to_string(), Value::String(self.name.clone()));
        if let Some(token) = self.token {
            object.insert(TOKEN_FIELD.to_string(), Value::from(token));
        }
        for (key, value) in &self.payload {
            if key == MESSAGE_FIELD || key == TOKEN_FIELD {
                return Err(ProtocolError::ReservedField(key.clone()));
            }
            object.insert(key.clone(), value.clone());
        }

        let mut line = serde_json::to_string(&Value::Object(object))
            .map_err(|e| ProtocolError::Json(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one line (with or without its trailing newline) into an
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the line is not a JSON object, lacks
    /// `_Message_`, or carries a non-integer `_Token_`. Callers treat any of
    /// these as fatal to the connection, not just to the message.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Json(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let name = match object.remove(MESSAGE_FIELD) {
            Some(Value::String(name)) => name,
            Some(_) => return Err(ProtocolError::InvalidField(MESSAGE_FIELD, "a string")),
            None => return Err(ProtocolError::MissingName),
        };

        let token = match object.remove(TOKEN_FIELD) {
            None => None,
            Some(value) => Some(value.as_u64().ok_or(ProtocolError::InvalidField(
                TOKEN_FIELD,
                "a non-negative integer",
            ))?),
        };

        Ok(Self {
            name,
            token,
            payload: object,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_fire_and_forget_encodes_without_token() {
        let env = Envelope::new("ClipboardChanged", payload(&[("Formats", json!(["Text"]))]));
        let line = env.encode_line().unwrap();
        assert_eq!(
            line,
            "{\"_Message_\":\"ClipboardChanged\",\"Formats\":[\"Text\"]}\n"
        );
    }

    #[test]
    fn test_call_encodes_reserved_fields_first() {
        let env = Envelope::with_token("Ping", 7, Map::new());
        assert_eq!(env.encode_line().unwrap(), "{\"_Message_\":\"Ping\",\"_Token_\":7}\n");
    }

    #[test]
    fn test_result_ok_matches_documented_wire_line() {
        let env = Envelope::result_ok(7, json!("pong"));
        assert_eq!(
            env.encode_line().unwrap(),
            "{\"_Message_\":\"_Result_\",\"Token\":7,\"Result\":\"pong\"}\n"
        );
    }

    #[test]
    fn test_result_err_matches_documented_wire_line() {
        let env = Envelope::result_err(3, "no such format");
        assert_eq!(
            env.encode_line().unwrap(),
            "{\"_Message_\":\"_Result_\",\"Token\":3,\"Error\":\"no such format\"}\n"
        );
    }

    #[test]
    fn test_decode_round_trips_name_token_and_payload() {
        let line = "{\"_Message_\":\"RemoteInput\",\"_Token_\":42,\"Events\":\"AAEC\"}";
        let env = Envelope::decode_line(line).unwrap();
        assert_eq!(env.name, "RemoteInput");
        assert_eq!(env.token, Some(42));
        assert_eq!(env.payload.get("Events"), Some(&json!("AAEC")));
    }

    #[test]
    fn test_decode_accepts_trailing_newline() {
        let env = Envelope::decode_line("{\"_Message_\":\"Ping\"}\n").unwrap();
        assert_eq!(env.name, "Ping");
        assert_eq!(env.token, None);
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert_eq!(
            Envelope::decode_line("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        );
    }

    #[test]
    fn test_decode_rejects_missing_name() {
        assert_eq!(
            Envelope::decode_line("{\"_Token_\":1}"),
            Err(ProtocolError::MissingName)
        );
    }

    #[test]
    fn test_decode_rejects_non_string_name() {
        assert!(matches!(
            Envelope::decode_line("{\"_Message_\":9}"),
            Err(ProtocolError::InvalidField(MESSAGE_FIELD, _))
        ));
    }

    #[test]
    fn test_decode_rejects_non_integer_token() {
        assert!(matches!(
            Envelope::decode_line("{\"_Message_\":\"Ping\",\"_Token_\":\"seven\"}"),
            Err(ProtocolError::InvalidField(TOKEN_FIELD, _))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode_line("not json at all"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_encode_rejects_reserved_payload_key() {
        let env = Envelope::new("Evil", payload(&[(MESSAGE_FIELD, json!("spoof"))]));
        assert_eq!(
            env.encode_line(),
            Err(ProtocolError::ReservedField(MESSAGE_FIELD.to_string()))
        );
    }

    #[test]
    fn test_result_parts_success() {
        let env = Envelope::decode_line(
            "{\"_Message_\":\"_Result_\",\"Token\":7,\"Result\":\"pong\"}",
        )
        .unwrap();
        assert!(env.is_result());
        let (token, outcome) = env.result_parts().unwrap();
        assert_eq!(token, 7);
        assert_eq!(outcome, Ok(json!("pong")));
    }

    #[test]
    fn test_result_parts_error() {
        let env = Envelope::result_err(9, "handler exploded");
        let (token, outcome) = env.result_parts().unwrap();
        assert_eq!(token, 9);
        assert_eq!(outcome, Err("handler exploded".to_string()));
    }

    #[test]
    fn test_result_parts_without_value_or_error_is_generic_failure() {
        let env =
            Envelope::decode_line("{\"_Message_\":\"_Result_\",\"Token\":5}").unwrap();
        let (token, outcome) = env.result_parts().unwrap();
        assert_eq!(token, 5);
        assert_eq!(outcome, Err("remote call failed".to_string()));
    }

    #[test]
    fn test_result_parts_without_token_is_an_error() {
        let env =
            Envelope::decode_line("{\"_Message_\":\"_Result_\",\"Result\":1}").unwrap();
        assert!(matches!(
            env.result_parts(),
            Err(ProtocolError::InvalidField(RESULT_TOKEN_FIELD, _))
        ));
    }

    #[test]
    fn test_payload_values_survive_round_trip() {
        let env = Envelope::with_token(
            "ClipboardGetDataPresent",
            12,
            payload(&[("Format", json!("UnicodeText")), ("Sizes", json!([1, 2, 3]))]),
        );
        let line = env.encode_line().unwrap();
        let decoded = Envelope::decode_line(&line).unwrap();
        assert_eq!(decoded.name, env.name);
        assert_eq!(decoded.token, env.token);
        assert_eq!(decoded.payload.get("Format"), Some(&json!("UnicodeText")));
        assert_eq!(decoded.payload.get("Sizes"), Some(&json!([1, 2, 3])));
    }
}
