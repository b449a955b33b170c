//! # irctl-runtime
//!
//! Client session lifecycle and the instrument command handlers.
//!
//! Each accepted connection is served by a [`SessionDispatcher`]: it reads one
//! command at a time, acknowledges it, runs the matching [`CommandHandler`]
//! and answers with exactly one completion. Normal-class handlers run on the
//! main runtime and register an abort token with the shared
//! [`InstrumentStatus`]; interrupt-class handlers run on the
//! [`InterruptLane`] and use that registry to abort work started elsewhere.

mod config;
pub mod handlers;
mod lane;
mod registry;
mod session;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use irctl_link::ReplyBroker;
use irctl_peers::PeerProxies;
use irctl_pipeline::{CorrelatorHandle, ExposureKind, FrameName, FrameNamer};
use irctl_protocol::SafetyState;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use config::{
    AckPolicy, FowlerSettings, RampSettings, RebootLevel, RebootPolicy, RebootSettings,
    RuntimeConfig,
};
pub use lane::InterruptLane;
pub use registry::{CommandContext, CommandHandler, HandlerRegistry};
pub use session::{SessionDispatcher, SessionPhase};
pub use status::{ActiveCommandInfo, ActiveGuard, InstrumentMode, InstrumentStatus, StatusSnapshot};

/// Everything an [`InstrumentRuntime`] is assembled from.
pub struct RuntimeParts {
    pub config: RuntimeConfig,
    pub link: ReplyBroker,
    pub peers: PeerProxies,
    pub correlator: CorrelatorHandle,
    pub namer: FrameNamer,
    pub safety: Option<watch::Receiver<SafetyState>>,
    /// Cancelled when a command asks the daemon to exit.
    pub shutdown: CancellationToken,
}

struct RuntimeInner {
    config: RuntimeConfig,
    link: ReplyBroker,
    peers: PeerProxies,
    correlator: CorrelatorHandle,
    namer: Mutex<FrameNamer>,
    status: InstrumentStatus,
    safety: Option<watch::Receiver<SafetyState>>,
    shutdown: CancellationToken,
    reboot: Mutex<Option<RebootLevel>>,
}

/// Collaborators shared by every session. Cloning is cheap.
#[derive(Clone)]
pub struct InstrumentRuntime {
    inner: Arc<RuntimeInner>,
}

impl InstrumentRuntime {
    pub fn new(parts: RuntimeParts) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config: parts.config,
                link: parts.link,
                peers: parts.peers,
                correlator: parts.correlator,
                namer: Mutex::new(parts.namer),
                status: InstrumentStatus::new(),
                safety: parts.safety,
                shutdown: parts.shutdown,
                reboot: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &ReplyBroker {
        &self.inner.link
    }

    pub fn peers(&self) -> &PeerProxies {
        &self.inner.peers
    }

    pub fn correlator(&self) -> &CorrelatorHandle {
        &self.inner.correlator
    }

    pub fn status(&self) -> &InstrumentStatus {
        &self.inner.status
    }

    /// `None` when no safety monitor is attached.
    pub fn safety_state(&self) -> Option<SafetyState> {
        self.inner.safety.as_ref().map(|state| *state.borrow())
    }

    /// Record the reboot and ask the daemon to exit; restarting it, or the
    /// host, is up to the supervisor.
    pub fn request_shutdown(&self, level: RebootLevel) {
        warn!(%level, "daemon shutdown requested");
        *self.inner.reboot.lock() = Some(level);
        self.inner.shutdown.cancel();
    }

    /// The reboot level behind a requested shutdown, if any.
    pub fn requested_reboot(&self) -> Option<RebootLevel> {
        *self.inner.reboot.lock()
    }

    pub fn next_multrun(&self, now: DateTime<Utc>) -> u32 {
        self.inner.namer.lock().next_multrun(now)
    }

    pub fn next_run(&self, kind: ExposureKind, now: DateTime<Utc>) -> FrameName {
        self.inner.namer.lock().next_run(kind, now)
    }

    /// Where correlated frames end up.
    pub fn output_directory(&self) -> PathBuf {
        self.inner.namer.lock().directory().clone()
    }
}

#[cfg(test)]
pub(crate) mod testing;
