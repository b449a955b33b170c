//! Boundary ports between the control core and its collaborators.
//!
//! - Traits use `async-trait` for dyn dispatch.
//! - Every port reports failures as `ControlError` so callers can convert
//!   them into client-visible codes without inspecting transport details.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Acknowledge, CommandDone, InboundCommand};
use crate::error::ControlResult;
use crate::header::HeaderSet;

/// Receives acknowledgements relayed from a peer while a command runs.
pub trait AcknowledgeSink: Send + Sync {
    fn acknowledge(&self, ack: Acknowledge);
}

/// Discards every acknowledgement.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardAcknowledgements;

impl AcknowledgeSink for DiscardAcknowledgements {
    fn acknowledge(&self, _ack: Acknowledge) {}
}

/// One peer service connection factory. Each `send` is a full exchange.
#[async_trait]
pub trait PeerServiceClient: Send + Sync {
    /// Deliver `command` and wait for its completion. An `Err` means no
    /// completion was received.
    async fn send(
        &self,
        command: InboundCommand,
        acks: Arc<dyn AcknowledgeSink>,
    ) -> ControlResult<CommandDone>;
}

/// Protected temperature reading used by the safety monitor.
#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    async fn read_kelvin(&self) -> ControlResult<f64>;
}

/// Switches off the monitored detector electronics.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_down(&self) -> ControlResult<()>;
}

/// Attaches header cards to a frame on disk.
#[async_trait]
pub trait HeaderWriter: Send + Sync {
    async fn write_headers(&self, frame: &Path, headers: &HeaderSet) -> ControlResult<()>;

    /// Called after a frame has been moved so companion data can follow it.
    async fn frame_moved(&self, _from: &Path, _to: &Path) -> ControlResult<()> {
        Ok(())
    }
}

/// Reorients frame pixel data in place.
#[async_trait]
pub trait ImageFlipper: Send + Sync {
    async fn flip(&self, frame: &Path, flip_x: bool, flip_y: bool) -> ControlResult<()>;
}
