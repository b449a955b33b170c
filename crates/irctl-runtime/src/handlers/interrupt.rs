use async_trait::async_trait;
use irctl_protocol::{CommandClass, CommandDone, ControlResult, InboundCommand};

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};

/// Flags the active command for abort and returns without waiting for it.
pub struct InterruptHandler;

#[async_trait]
impl CommandHandler for InterruptHandler {
    fn command_type(&self) -> &'static str {
        "interrupt"
    }

    fn class(&self) -> CommandClass {
        CommandClass::Interrupt
    }

    fn acknowledge_time(
        &self,
        _command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        Ok(runtime.config().acks.min_ms)
    }

    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let done = CommandDone::success(ctx.command_id().clone());
        Ok(match ctx.runtime().status().request_abort() {
            Some(target) => done.with_field("aborted_command_id", target.command_id.as_str()),
            None => done,
        })
    }
}
