//! Client session messages.
//!
//! One JSON object per line in each direction. The client sends an
//! [`InboundCommand`]; the server answers with zero or more
//! [`SessionMessage::Ack`] lines and exactly one [`SessionMessage::Done`].
//! Peer services speak the same framing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ControlError, ControlResult};
use crate::ids::CommandId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCommand {
    #[serde(default)]
    pub id: CommandId,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl InboundCommand {
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            id: CommandId::default(),
            command_type: command_type.into(),
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn parse_line(line: &str) -> ControlResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| ControlError::MalformedCommand(e.to_string()))
    }

    pub fn to_line(&self) -> ControlResult<String> {
        serde_json::to_string(self).map_err(|e| ControlError::MalformedCommand(e.to_string()))
    }

    /// Decode the payload fields into a typed parameter struct.
    pub fn params<T: DeserializeOwned>(&self) -> ControlResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            ControlError::MalformedCommand(format!("{}: {e}", self.command_type))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub command_id: CommandId,
    pub time_to_complete_ms: u64,
    /// Output location of the frame just finished, on per-frame progress acks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDone {
    pub command_id: CommandId,
    pub successful: bool,
    pub error_num: i32,
    #[serde(default)]
    pub error_string: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl CommandDone {
    pub fn success(command_id: CommandId) -> Self {
        Self {
            command_id,
            successful: true,
            error_num: 0,
            error_string: String::new(),
            fields: Map::new(),
        }
    }

    pub fn failure(command_id: CommandId, error: &ControlError) -> Self {
        Self {
            command_id,
            successful: false,
            error_num: error.code(),
            error_string: error.to_string(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    Ack(Acknowledge),
    Done(CommandDone),
}

impl SessionMessage {
    pub fn parse_line(line: &str) -> ControlResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| ControlError::PeerTransport(e.to_string()))
    }

    pub fn to_line(&self) -> ControlResult<String> {
        serde_json::to_string(self).map_err(|e| ControlError::MalformedCommand(e.to_string()))
    }
}
