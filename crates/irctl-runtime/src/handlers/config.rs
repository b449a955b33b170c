use async_trait::async_trait;
use irctl_protocol::{
    CommandDone, ControlError, ControlResult, InboundCommand, LinkCommand, PeerCommand, PeerKind,
    PeerRequest, codes,
};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};
use crate::status::InstrumentMode;

use super::link_step;

const PARAMETERS: i32 = codes::CONFIG + 1;
const NO_SAMPLING: i32 = codes::CONFIG + 2;
const SAMPLING_LINK: i32 = codes::CONFIG + 3;
const SAMPLING_REPLY: i32 = codes::CONFIG + 4;
const FOCUS: i32 = codes::CONFIG + 5;
const BINNING: i32 = codes::CONFIG + 7;

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ConfigParams {
    name: String,
    #[serde(default = "one")]
    x_bin: u32,
    #[serde(default = "one")]
    y_bin: u32,
}

/// Applies an instrument configuration.
pub struct ConfigHandler;

#[async_trait]
impl CommandHandler for ConfigHandler {
    fn command_type(&self) -> &'static str {
        "config"
    }

    fn acknowledge_time(
        &self,
        _command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        let acks = &runtime.config().acks;
        Ok(if acks.config_ms > 0 {
            acks.config_ms
        } else {
            acks.default_ms
        })
    }

    #[instrument(skip(self, ctx), fields(command_id = %ctx.command_id()))]
    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let result = run(ctx).await;
        ctx.runtime().status().set_mode(InstrumentMode::Idle);
        result
    }
}

async fn run(ctx: &CommandContext) -> ControlResult<CommandDone> {
    let params: ConfigParams = ctx
        .command()
        .params()
        .map_err(|e| e.at_step(PARAMETERS, "config parameters"))?;
    let runtime = ctx.runtime();
    ctx.check_abort()?;

    if params.x_bin != 1 || params.y_bin != 1 {
        return Err(ControlError::command(
            BINNING,
            format!("binning {}x{} is not supported", params.x_bin, params.y_bin),
        ));
    }
    let sampling = runtime.config().configured_sampling.ok_or_else(|| {
        ControlError::command(NO_SAMPLING, "no sampling mode configured")
    })?;

    runtime.status().set_mode(InstrumentMode::Configuring);
    link_step(ctx, LinkCommand::SetFsMode(sampling), SAMPLING_REPLY, SAMPLING_LINK).await?;
    runtime.status().set_mode(InstrumentMode::Idle);
    ctx.check_abort()?;

    let focus = PeerRequest::new(
        PeerKind::Telescope,
        PeerCommand::OffsetFocus {
            offset_mm: runtime.config().focus_offset_mm,
        },
    );
    ctx.call_peer(focus)
        .await
        .map_err(|e| e.at_step(FOCUS, "focus offset"))?;

    let config_id = runtime.status().configured(params.name.as_str());
    info!(config_id, name = %params.name, %sampling, "configuration applied");
    Ok(CommandDone::success(ctx.command_id().clone())
        .with_field("config_id", config_id)
        .with_field("config_name", params.name))
}
