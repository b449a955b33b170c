use async_trait::async_trait;
use chrono::Utc;
use irctl_pipeline::ExposureKind;
use irctl_protocol::{
    CommandDone, ControlResult, HeaderCard, HeaderSet, InboundCommand, SamplingMode, codes,
};
use tracing::{info, instrument};

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};
use crate::status::InstrumentMode;

use super::exposure::{AcquireOffsets, Frame, acquire_frame, bias_plan, wait_for_pipeline};
use super::{current_sampling, link_step};

const FOWLER_REPLY: i32 = codes::BIAS + 1;
const FOWLER_LINK: i32 = codes::BIAS + 2;
const RAMP_REPLY: i32 = codes::BIAS + 3;
const RAMP_LINK: i32 = codes::BIAS + 4;
const ACQUIRE_REPLY: i32 = codes::BIAS + 5;
const ACQUIRE_LINK: i32 = codes::BIAS + 6;
const ENQUEUE: i32 = codes::BIAS + 7;

/// One zero-length ramp.
pub struct BiasHandler;

#[async_trait]
impl CommandHandler for BiasHandler {
    fn command_type(&self) -> &'static str {
        "bias"
    }

    fn acknowledge_time(
        &self,
        _command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        Ok(runtime.config().acks.default_ms)
    }

    #[instrument(skip(self, ctx), fields(command_id = %ctx.command_id()))]
    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let result = run(ctx).await;
        ctx.runtime().status().set_mode(InstrumentMode::Idle);
        result
    }
}

async fn run(ctx: &CommandContext) -> ControlResult<CommandDone> {
    let runtime = ctx.runtime();
    let config = runtime.config();
    ctx.check_abort()?;
    runtime.status().begin_exposures(1, 0);
    let multrun = config
        .rename_frames
        .then(|| runtime.next_multrun(Utc::now()));

    let sampling = current_sampling(ctx, codes::BIAS).await?;
    let plan = bias_plan(config, sampling);
    let (reply, link) = match sampling {
        SamplingMode::Fowler => (FOWLER_REPLY, FOWLER_LINK),
        SamplingMode::UpTheRamp => (RAMP_REPLY, RAMP_LINK),
    };
    link_step(ctx, plan.command, reply, link).await?;
    ctx.acknowledge(plan.overhead_ms + config.acks.default_ms)?;

    let mut headers = HeaderSet::new();
    headers.add_value("INSTRUME", config.instrument.as_str());
    headers.add_value("OBSTYPE", "BIAS");
    headers.add("EXPTIME", HeaderCard::new(0.0).with_units("s"));
    headers.add_value("SAMPLING", sampling.to_string());
    if let Some(multrun) = multrun {
        headers.add_value("RUNNUM", i64::from(multrun));
    }

    let frame = Frame {
        number: 1,
        sampling,
        kind: ExposureKind::Bias,
        headers: &headers,
    };
    let offsets = AcquireOffsets {
        reply: ACQUIRE_REPLY,
        link: ACQUIRE_LINK,
        enqueue: ENQUEUE,
    };
    let location = acquire_frame(ctx, frame, offsets).await?;
    ctx.acknowledge_frame(config.acks.default_ms, location.clone())?;

    wait_for_pipeline(ctx, config.acks.default_ms).await?;
    info!(%location, "bias complete");
    Ok(CommandDone::success(ctx.command_id().clone()).with_field("filename", location))
}
