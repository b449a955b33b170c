//! Requests to the three peer services.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::command::{CommandDone, InboundCommand};
use crate::error::{ControlError, ControlResult, codes};
use crate::header::HeaderSet;
use crate::ids::CommandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// Telescope interface service.
    Telescope,
    /// Focal-plane calibration service; may be disabled by configuration.
    Calibration,
    /// Data reduction service.
    Reduction,
}

impl PeerKind {
    pub fn aborted_code(self) -> i32 {
        match self {
            Self::Telescope => codes::TELESCOPE_ABORTED,
            Self::Calibration => codes::CALIBRATION_ABORTED,
            Self::Reduction => codes::REDUCTION_ABORTED,
        }
    }

    pub fn comms_code(self) -> i32 {
        match self {
            Self::Telescope => codes::TELESCOPE_COMMS,
            Self::Calibration => codes::CALIBRATION_COMMS,
            Self::Reduction => codes::REDUCTION_COMMS,
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Telescope => "telescope",
            Self::Calibration => "calibration",
            Self::Reduction => "reduction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerCommand {
    OffsetRaDec { ra_arcsec: f64, dec_arcsec: f64 },
    OffsetFocus { offset_mm: f64 },
    MoveFold { position: String },
    GetFitsHeaders,
    Abort,
    Reduce { filename: String },
}

impl PeerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OffsetRaDec { .. } => "offset_ra_dec",
            Self::OffsetFocus { .. } => "offset_focus",
            Self::MoveFold { .. } => "move_fold",
            Self::GetFitsHeaders => "get_fits_headers",
            Self::Abort => "abort",
            Self::Reduce { .. } => "reduce",
        }
    }

    /// Frame this command as an inbound command line for the peer.
    pub fn to_inbound(&self, id: CommandId) -> ControlResult<InboundCommand> {
        let value =
            serde_json::to_value(self).map_err(|e| ControlError::MalformedCommand(e.to_string()))?;
        let Value::Object(mut payload) = value else {
            return Err(ControlError::MalformedCommand(format!(
                "{} did not serialize to an object",
                self.name()
            )));
        };
        payload.remove("type");
        Ok(InboundCommand {
            id,
            command_type: self.name().to_owned(),
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Block until the peer reports completion.
    Block,
    /// Deliver the request but report synthetic success immediately.
    FireAndForget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
    pub target: PeerKind,
    pub command_id: CommandId,
    pub command: PeerCommand,
    pub wait: WaitPolicy,
    /// Whether the owning session's abort request stops the wait.
    pub check_abort: bool,
}

impl PeerRequest {
    pub fn new(target: PeerKind, command: PeerCommand) -> Self {
        Self {
            target,
            command_id: CommandId::generate(),
            command,
            wait: WaitPolicy::Block,
            check_abort: true,
        }
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.wait = WaitPolicy::FireAndForget;
        self
    }

    pub fn ignore_abort(mut self) -> Self {
        self.check_abort = false;
        self
    }
}

impl CommandDone {
    /// Turn an unsuccessful peer completion into an error.
    pub fn into_peer_result(self, peer: PeerKind) -> ControlResult<CommandDone> {
        if self.successful {
            Ok(self)
        } else {
            Err(ControlError::PeerFailed {
                peer,
                code: self.error_num,
                message: self.error_string,
            })
        }
    }

    /// Header cards returned by a `get_fits_headers` peer command.
    pub fn headers(&self) -> ControlResult<HeaderSet> {
        match self.fields.get("headers") {
            None => Ok(HeaderSet::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ControlError::MalformedCommand(format!("headers: {e}"))),
        }
    }
}
