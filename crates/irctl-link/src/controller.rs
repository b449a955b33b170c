//! Detector controller bring-up.

use irctl_protocol::{ControlResult, LinkCommand, MuxType, PowerControl};
use tracing::{info, instrument, warn};

use crate::ReplyBroker;

/// `INITIALIZE` reply code asking for a full re-initialisation.
const NEEDS_FULL_INITIALIZE: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSetup {
    /// Run the sequence when the daemon starts.
    pub enabled: bool,
    /// 1 to 3; 3 reloads everything.
    pub initialize_level: u8,
    pub mux: MuxType,
    pub n_outputs: u32,
    pub gain: u8,
}

impl Default for ControllerSetup {
    fn default() -> Self {
        Self {
            enabled: true,
            initialize_level: 2,
            mux: MuxType::H2rg,
            n_outputs: 32,
            gain: 8,
        }
    }
}

impl ReplyBroker {
    /// Initialise the controller, then describe the detector to it and set
    /// the preamp gain. Every step must answer with code 0.
    #[instrument(skip(self, setup), fields(level = setup.initialize_level))]
    pub async fn start_controller(&self, setup: &ControllerSetup) -> ControlResult<()> {
        let initialize = self
            .send(LinkCommand::Initialize {
                level: setup.initialize_level,
            })
            .await?;
        if initialize.reply.code() == NEEDS_FULL_INITIALIZE {
            warn!(reply = %initialize.reply.message(), "controller asked for a full initialise");
            self.send(LinkCommand::Initialize { level: 3 })
                .await?
                .into_success()?;
        } else {
            initialize.into_success()?;
        }

        self.send(LinkCommand::SetDetector {
            mux: setup.mux,
            n_outputs: setup.n_outputs,
        })
        .await?
        .into_success()?;
        self.send(LinkCommand::SetGain(setup.gain))
            .await?
            .into_success()?;
        info!(mux = ?setup.mux, outputs = setup.n_outputs, gain = setup.gain, "controller ready");
        Ok(())
    }

    /// Power the detector electronics down ahead of a restart.
    pub async fn stop_controller(&self) -> ControlResult<()> {
        self.power_down().await?;
        info!("controller powered down");
        Ok(())
    }
}
