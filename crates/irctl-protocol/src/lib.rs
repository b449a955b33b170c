//! # irctl-protocol
//!
//! Shared types for the irctl instrument control server: identifiers, the
//! error-code table, client and peer session messages, the detector
//! controller link wire format, header cards and boundary ports.
//!
//! No runtime dependencies, so peers and test harnesses can link it alone.
//!
//! ## Module Overview
//!
//! - [`ids`]: SessionId, CommandId
//! - [`error`]: ControlError, ControlResult, numeric code offsets
//! - [`command`]: InboundCommand, Acknowledge, CommandDone, SessionMessage
//! - [`peer`]: PeerKind, PeerCommand, PeerRequest
//! - [`link`]: LinkCommand, LinkReply, reply signature tables
//! - [`header`]: HeaderSet, HeaderCard
//! - [`safety`]: SafetyState
//! - [`ports`]: Peer client, sensor, power, header and image ports

pub mod command;
pub mod error;
pub mod header;
pub mod ids;
pub mod link;
pub mod peer;
pub mod ports;
pub mod safety;

pub use command::{Acknowledge, CommandDone, InboundCommand, SessionMessage};
pub use error::{ControlError, ControlResult, ERROR_BASE, codes};
pub use header::{HeaderCard, HeaderSet, HeaderValue};
pub use ids::{CommandId, SessionId};
pub use link::{
    CommandClass, ConfigDump, LinkCommand, LinkReply, MuxType, ReplyForm,
    RequestLine, SamplingMode,
};
pub use peer::{PeerCommand, PeerKind, PeerRequest, WaitPolicy};
pub use ports::{
    AcknowledgeSink, DiscardAcknowledgements, HeaderWriter, ImageFlipper, PeerServiceClient,
    PowerControl, TemperatureSensor,
};
pub use safety::SafetyState;
