use async_trait::async_trait;
use irctl_protocol::link::EXPOSURE_IN_PROGRESS;
use irctl_protocol::{
    CommandClass, CommandDone, ControlResult, InboundCommand, LinkCommand, PeerCommand, PeerKind,
    PeerRequest, codes,
};
use tracing::{info, instrument};

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};

/// Stops the running exposure: flags the active command, stops an acquisition
/// in progress and tells the reduction service to give up.
pub struct AbortHandler;

#[async_trait]
impl CommandHandler for AbortHandler {
    fn command_type(&self) -> &'static str {
        "abort"
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

    #[instrument(skip(self, ctx), fields(command_id = %ctx.command_id()))]
    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let runtime = ctx.runtime();
        let aborted = runtime.status().request_abort();

        // The link is shared with the exposure being aborted, so use the
        // broker directly rather than this command's own abort token.
        let ping = runtime
            .link()
            .send(LinkCommand::Ping)
            .await
            .map_err(|e| e.at_step(codes::ABORT_HANDLER, "PING"))?;
        let stopped = ping.reply.code() == EXPOSURE_IN_PROGRESS;
        if stopped {
            runtime
                .link()
                .send(LinkCommand::StopAcquisition)
                .await
                .and_then(|exchange| exchange.into_success())
                .map_err(|e| e.at_step(codes::ABORT_HANDLER, "STOPACQUISITION"))?;
        }

        let reduction =
            PeerRequest::new(PeerKind::Reduction, PeerCommand::Abort).fire_and_forget();
        ctx.call_peer(reduction).await?;

        info!(
            aborted_command = aborted.as_ref().map(|a| a.command_id.as_str()),
            stopped, "abort handled"
        );
        let mut done =
            CommandDone::success(ctx.command_id().clone()).with_field("acquisition_stopped", stopped);
        if let Some(aborted) = aborted {
            done = done.with_field("aborted_command_id", aborted.command_id.as_str());
        }
        Ok(done)
    }
}
