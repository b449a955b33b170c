//! Error types and the stable numeric code table.
//!
//! Every failure that reaches a client is reported as `base + offset`, where
//! the offset identifies the component and step that failed.

use thiserror::Error;

use crate::peer::PeerKind;

/// Base of every numeric error code reported by this server.
pub const ERROR_BASE: i32 = 1_400_000;

/// Offsets from [`ERROR_BASE`].
pub mod codes {
    pub const TELESCOPE_ABORTED: i32 = 1;
    pub const TELESCOPE_COMMS: i32 = 2;
    pub const CALIBRATION_ABORTED: i32 = 3;
    pub const CALIBRATION_COMMS: i32 = 4;
    pub const REDUCTION_ABORTED: i32 = 5;
    pub const REDUCTION_COMMS: i32 = 6;
    pub const SERVER: i32 = 100;
    pub const ABORTED: i32 = 200;
    pub const HEADERS: i32 = 300;
    pub const REDUCE: i32 = 600;
    pub const ACK_SEND: i32 = 601;
    pub const BIAS: i32 = 700;
    pub const CONFIG: i32 = 800;
    pub const MULTRUN: i32 = 1200;
    pub const REBOOT: i32 = 1400;
    pub const ABORT_HANDLER: i32 = 2400;
    pub const STATUS: i32 = 2500;
    pub const LINK_PROTOCOL: i32 = 3000;
    pub const LINK_DOWN: i32 = 3001;
    pub const LINK_REJECTED: i32 = 3002;
    pub const LINK_BUSY: i32 = 3003;
    pub const PIPELINE: i32 = 3100;
    pub const MALFORMED_COMMAND: i32 = 3200;
    pub const UNKNOWN_COMMAND: i32 = 3300;
    pub const PEER_TRANSPORT: i32 = 3400;
    pub const SENSOR: i32 = 3500;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("command aborted")]
    Aborted,
    #[error("{0} command aborted")]
    PeerAborted(PeerKind),
    #[error("{0} command failed: no reply received")]
    PeerComms(PeerKind),
    #[error("{peer} command failed ({code}): {message}")]
    PeerFailed {
        peer: PeerKind,
        code: i32,
        message: String,
    },
    /// The peer connection failed before a completion could be read.
    #[error("peer transport error: {0}")]
    PeerTransport(String),
    #[error("temperature sensor fault: {0}")]
    Sensor(String),
    #[error("link protocol error: {0}")]
    LinkProtocol(String),
    #[error("link down")]
    LinkDown,
    #[error("link command rejected: {0}")]
    LinkRejected(String),
    #[error("link busy: a normal-class command is already pending")]
    LinkBusy,
    #[error("pipeline error: {0}")]
    Pipeline(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
    /// A handler step failure; `offset` is added to [`ERROR_BASE`].
    #[error("{message}")]
    Command { offset: i32, message: String },
}

impl ControlError {
    pub fn command(offset: i32, message: impl Into<String>) -> Self {
        Self::Command {
            offset,
            message: message.into(),
        }
    }

    /// Wrap this error as a handler step failure, leaving aborts untouched so
    /// they stay distinguishable from other failures.
    pub fn at_step(self, offset: i32, step: &str) -> Self {
        if self.is_abort() {
            return self;
        }
        Self::command(offset, format!("{step}: {self}"))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted | Self::PeerAborted(_))
    }

    /// The stable numeric code reported to clients.
    pub fn code(&self) -> i32 {
        let offset = match self {
            Self::Aborted => codes::ABORTED,
            Self::PeerAborted(peer) => peer.aborted_code(),
            Self::PeerComms(peer) => peer.comms_code(),
            Self::PeerFailed { code, .. } => return *code,
            Self::PeerTransport(_) => codes::PEER_TRANSPORT,
            Self::Sensor(_) => codes::SENSOR,
            Self::LinkProtocol(_) => codes::LINK_PROTOCOL,
            Self::LinkDown => codes::LINK_DOWN,
            Self::LinkRejected(_) => codes::LINK_REJECTED,
            Self::LinkBusy => codes::LINK_BUSY,
            Self::Pipeline(_) => codes::PIPELINE,
            Self::MalformedCommand(_) => codes::MALFORMED_COMMAND,
            Self::UnknownCommand(_) => codes::UNKNOWN_COMMAND,
            Self::Command { offset, .. } => *offset,
        };
        ERROR_BASE + offset
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<std::io::Error> for ControlError {
    fn from(error: std::io::Error) -> Self {
        ControlError::Pipeline(error.to_string())
    }
}
