//! Shared instrument status.
//!
//! Tracks what the detector is doing and which normal-class commands are
//! executing, so that an interrupt-class command arriving on another session
//! can find the command it should abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use irctl_protocol::{CommandId, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentMode {
    #[default]
    Idle,
    Configuring,
    Exposing,
    ReadingOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCommandInfo {
    pub session_id: SessionId,
    pub command_id: CommandId,
    pub command_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub mode: InstrumentMode,
    pub exposure_count: u32,
    pub exposure_number: u32,
    pub exposure_length_ms: u64,
    pub exposure_start: Option<DateTime<Utc>>,
    pub config_id: u64,
    pub config_name: Option<String>,
    pub active: Vec<ActiveCommandInfo>,
}

struct ActiveCommand {
    ticket: u64,
    info: ActiveCommandInfo,
    abort: CancellationToken,
}

#[derive(Default)]
struct StatusState {
    mode: InstrumentMode,
    exposure_count: u32,
    exposure_number: u32,
    exposure_length_ms: u64,
    exposure_start: Option<DateTime<Utc>>,
    config_id: u64,
    config_name: Option<String>,
    active: Vec<ActiveCommand>,
}

#[derive(Clone, Default)]
pub struct InstrumentStatus {
    state: Arc<Mutex<StatusState>>,
    next_ticket: Arc<AtomicU64>,
}

impl InstrumentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executing normal-class command. It stays abortable until
    /// the returned guard is dropped.
    pub fn begin(
        &self,
        session_id: SessionId,
        command_id: CommandId,
        command_type: impl Into<String>,
        abort: CancellationToken,
    ) -> ActiveGuard {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let info = ActiveCommandInfo {
            session_id,
            command_id,
            command_type: command_type.into(),
        };
        debug!(ticket, command_id = %info.command_id, "command active");
        self.state.lock().active.push(ActiveCommand {
            ticket,
            info,
            abort,
        });
        ActiveGuard {
            status: self.clone(),
            ticket,
        }
    }

    /// Set AbortRequested on the most recently started active command.
    pub fn request_abort(&self) -> Option<ActiveCommandInfo> {
        let state = self.state.lock();
        let target = state.active.last()?;
        target.abort.cancel();
        info!(
            session_id = %target.info.session_id,
            command_id = %target.info.command_id,
            command_type = %target.info.command_type,
            "abort requested"
        );
        Some(target.info.clone())
    }

    pub fn active(&self) -> Vec<ActiveCommandInfo> {
        self.state
            .lock()
            .active
            .iter()
            .map(|command| command.info.clone())
            .collect()
    }

    pub fn mode(&self) -> InstrumentMode {
        self.state.lock().mode
    }

    pub fn set_mode(&self, mode: InstrumentMode) {
        self.state.lock().mode = mode;
    }

    pub fn begin_exposures(&self, count: u32, length_ms: u64) {
        let mut state = self.state.lock();
        state.exposure_count = count;
        state.exposure_number = 0;
        state.exposure_length_ms = length_ms;
    }

    pub fn exposure_started(&self, number: u32, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.exposure_number = number;
        state.exposure_start = Some(at);
        state.mode = InstrumentMode::Exposing;
    }

    pub fn config_id(&self) -> u64 {
        self.state.lock().config_id
    }

    pub fn config_name(&self) -> Option<String> {
        self.state.lock().config_name.clone()
    }

    /// Record a newly applied configuration and return its id.
    pub fn configured(&self, name: impl Into<String>) -> u64 {
        let mut state = self.state.lock();
        state.config_id += 1;
        state.config_name = Some(name.into());
        state.config_id
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock();
        StatusSnapshot {
            mode: state.mode,
            exposure_count: state.exposure_count,
            exposure_number: state.exposure_number,
            exposure_length_ms: state.exposure_length_ms,
            exposure_start: state.exposure_start,
            config_id: state.config_id,
            config_name: state.config_name.clone(),
            active: state.active.iter().map(|c| c.info.clone()).collect(),
        }
    }

    fn finish(&self, ticket: u64) {
        let mut state = self.state.lock();
        state.active.retain(|command| command.ticket != ticket);
    }
}

/// Deregisters its command on drop.
pub struct ActiveGuard {
    status: InstrumentStatus,
    ticket: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.status.finish(self.ticket);
    }
}
