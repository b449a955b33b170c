use async_trait::async_trait;
use irctl_protocol::{CommandClass, CommandDone, ControlResult, InboundCommand, codes};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::InstrumentRuntime;
use crate::config::RebootLevel;
use crate::registry::{CommandContext, CommandHandler};

const PARAMETERS: i32 = codes::REBOOT;
const CONTROLLER: i32 = codes::REBOOT + 2;

#[derive(Debug, Deserialize)]
struct RebootParams {
    level: RebootLevel,
}

fn level(command: &InboundCommand) -> ControlResult<RebootLevel> {
    let params: RebootParams = command
        .params()
        .map_err(|e| e.at_step(PARAMETERS, "reboot level"))?;
    Ok(params.level)
}

/// Restarts the controller or the daemon, as far as the level is enabled.
pub struct RebootHandler;

#[async_trait]
impl CommandHandler for RebootHandler {
    fn command_type(&self) -> &'static str {
        "reboot"
    }

    fn class(&self) -> CommandClass {
        CommandClass::Interrupt
    }

    fn acknowledge_time(
        &self,
        command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        let level = level(command)?;
        Ok(runtime.config().reboot.policy(level).acknowledge_ms)
    }

    #[instrument(skip(self, ctx), fields(command_id = %ctx.command_id()))]
    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let level = level(ctx.command())?;
        let runtime = ctx.runtime();
        let done = CommandDone::success(ctx.command_id().clone()).with_field("level", level.name());
        if !runtime.config().reboot.policy(level).enabled {
            info!(%level, "reboot level disabled, nothing done");
            return Ok(done.with_field("performed", false));
        }

        let link = runtime.link();
        match level {
            RebootLevel::Redatum => {
                link.stop_controller()
                    .await
                    .map_err(|e| e.at_step(CONTROLLER, "POWERDOWNASIC"))?;
                link.start_controller(&runtime.config().controller)
                    .await
                    .map_err(|e| e.at_step(CONTROLLER, "controller start-up"))?;
            }
            RebootLevel::Software => runtime.request_shutdown(level),
            RebootLevel::Hardware | RebootLevel::PowerOff => {
                link.stop_controller()
                    .await
                    .map_err(|e| e.at_step(CONTROLLER, "POWERDOWNASIC"))?;
                runtime.request_shutdown(level);
            }
        }
        info!(%level, "reboot done");
        Ok(done.with_field("performed", true))
    }
}
