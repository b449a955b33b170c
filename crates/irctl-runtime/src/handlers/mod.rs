//! Instrument command handlers.

mod abort;
mod bias;
mod config;
mod exposure;
mod interrupt;
mod multrun;
mod reboot;
mod status;

use irctl_link::LinkExchange;
use irctl_protocol::{ControlResult, LinkCommand, SamplingMode};

use crate::registry::CommandContext;

pub use abort::AbortHandler;
pub use bias::BiasHandler;
pub use config::ConfigHandler;
pub use exposure::{ExposurePlan, bias_plan, plan_fowler, plan_ramp};
pub use interrupt::InterruptHandler;
pub use multrun::MultrunHandler;
pub use reboot::RebootHandler;
pub use status::GetStatusHandler;

/// Send a link command as one handler step. Failing to get a reply maps to
/// `link_offset`, a non-zero reply to `reply_offset`.
pub(crate) async fn link_step(
    ctx: &CommandContext,
    command: LinkCommand,
    reply_offset: i32,
    link_offset: i32,
) -> ControlResult<LinkExchange> {
    let step = command.opcode();
    let exchange = ctx
        .send_link(command)
        .await
        .map_err(|e| e.at_step(link_offset, step))?;
    exchange
        .into_success()
        .map_err(|e| e.at_step(reply_offset, step))
}

/// Ask the controller which sampling mode it is set to.
pub(crate) async fn current_sampling(
    ctx: &CommandContext,
    offset: i32,
) -> ControlResult<SamplingMode> {
    let exchange = link_step(ctx, LinkCommand::GetConfig, offset, offset).await?;
    let mode = exchange
        .reply
        .config()
        .and_then(|dump| dump.value_i64("bFS"))
        .and_then(SamplingMode::from_wire)
        .map_err(|e| e.at_step(offset, "GETCONFIG"))?;
    Ok(mode)
}
