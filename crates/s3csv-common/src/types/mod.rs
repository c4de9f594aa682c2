//! Protocol messages exchanged between an upstream tap and a target
//!
//! Each message is one JSON object per line, discriminated by its `type`
//! field. Unrecognized types decode to [`Message::Unknown`] so that callers
//! decide how to treat them; malformed lines are errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CommonError, Result};

pub const SCHEMA: &str = "SCHEMA";
pub const RECORD: &str = "RECORD";
pub const STATE: &str = "STATE";
pub const ACTIVATE_VERSION: &str = "ACTIVATE_VERSION";

/// Declares (or re-declares) the structure of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_properties: Option<Vec<String>>,
}

/// One data record of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Map<String, Value>,
    /// Table version, for taps that version full-table replications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// RFC 3339 time the tap extracted the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_extracted: Option<String>,
}

/// Opaque progress marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: i64,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    ActivateVersion(ActivateVersionMessage),
    /// Well-formed JSON with a `type` this crate does not know
    Unknown { message_type: String, raw: Value },
}

impl Message {
    /// Decode one input line
    pub fn parse(line: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(line).map_err(|e| CommonError::decode(line, e))?;

        let message_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommonError::missing_type(line))?
            .to_string();

        let decode = |e| CommonError::decode(line, e);
        let message = match message_type.as_str() {
            SCHEMA => Message::Schema(serde_json::from_value(raw).map_err(decode)?),
            RECORD => Message::Record(serde_json::from_value(raw).map_err(decode)?),
            STATE => Message::State(serde_json::from_value(raw).map_err(decode)?),
            ACTIVATE_VERSION => {
                Message::ActivateVersion(serde_json::from_value(raw).map_err(decode)?)
            },
            _ => Message::Unknown { message_type, raw },
        };

        Ok(message)
    }

    /// The wire name of this message's type
    pub fn message_type(&self) -> &str {
        match self {
            Message::Schema(_) => SCHEMA,
            Message::Record(_) => RECORD,
            Message::State(_) => STATE,
            Message::ActivateVersion(_) => ACTIVATE_VERSION,
            Message::Unknown { message_type, .. } => message_type,
        }
    }
}
