use async_trait::async_trait;
use chrono::Utc;
use irctl_pipeline::ExposureKind;
use irctl_protocol::{
    CommandDone, ControlError, ControlResult, HeaderCard, HeaderSet, InboundCommand, PeerCommand,
    PeerKind, PeerRequest, SamplingMode, codes,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};
use crate::status::InstrumentMode;

use super::exposure::{AcquireOffsets, Frame, acquire_frame, plan_fowler, plan_ramp, wait_for_pipeline};
use super::{current_sampling, link_step};

const FRAME_SETUP: i32 = codes::MULTRUN + 1;
const PARAMETERS: i32 = codes::MULTRUN + 2;
const FOWLER_REPLY: i32 = codes::MULTRUN + 4;
const RAMP_REPLY: i32 = codes::MULTRUN + 5;
const SAMPLING: i32 = codes::MULTRUN + 6;
const FOWLER_LINK: i32 = codes::MULTRUN + 7;
const RAMP_LINK: i32 = codes::MULTRUN + 8;
const ACQUIRE_REPLY: i32 = codes::MULTRUN + 9;
const FOLD: i32 = codes::MULTRUN + 11;
const RESET_OFFSET: i32 = codes::MULTRUN + 13;
const ENQUEUE: i32 = codes::MULTRUN + 14;
const RAMP_TOO_SHORT: i32 = codes::MULTRUN + 16;

#[derive(Debug, Clone, Deserialize)]
struct MultrunParams {
    exposure_time_ms: u64,
    count: u32,
    #[serde(default)]
    standard: bool,
}

fn params(command: &InboundCommand) -> ControlResult<MultrunParams> {
    let params: MultrunParams = command
        .params()
        .map_err(|e| e.at_step(PARAMETERS, "multrun parameters"))?;
    if params.count == 0 {
        return Err(ControlError::command(PARAMETERS, "multrun needs at least one exposure"));
    }
    Ok(params)
}

/// A run of `count` exposures of one length.
pub struct MultrunHandler;

#[async_trait]
impl CommandHandler for MultrunHandler {
    fn command_type(&self) -> &'static str {
        "multrun"
    }

    fn acknowledge_time(
        &self,
        command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        let params = params(command)?;
        Ok(params.exposure_time_ms + runtime.config().acks.default_ms)
    }

    #[instrument(skip(self, ctx), fields(command_id = %ctx.command_id()))]
    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let result = run(ctx).await;
        ctx.runtime().status().set_mode(InstrumentMode::Idle);
        result
    }
}

async fn run(ctx: &CommandContext) -> ControlResult<CommandDone> {
    let params = params(ctx.command())?;
    let runtime = ctx.runtime();
    let config = runtime.config();
    info!(
        exposure_ms = params.exposure_time_ms,
        count = params.count,
        standard = params.standard,
        "multrun starting"
    );
    ctx.check_abort()?;
    runtime
        .status()
        .begin_exposures(params.count, params.exposure_time_ms);
    let multrun = config
        .rename_frames
        .then(|| runtime.next_multrun(Utc::now()));

    if let Some(position) = &config.fold_position {
        let fold = PeerRequest::new(
            PeerKind::Telescope,
            PeerCommand::MoveFold {
                position: position.clone(),
            },
        );
        ctx.call_peer(fold)
            .await
            .map_err(|e| e.at_step(FOLD, "move fold"))?;
        ctx.check_abort()?;
    }

    let sampling = current_sampling(ctx, SAMPLING).await?;
    let plan = match sampling {
        SamplingMode::Fowler => {
            let plan = plan_fowler(&config.fowler, params.exposure_time_ms)
                .map_err(|e| e.at_step(FOWLER_LINK, "Fowler parameters"))?;
            link_step(ctx, plan.command.clone(), FOWLER_REPLY, FOWLER_LINK).await?;
            plan
        }
        SamplingMode::UpTheRamp => {
            let plan = plan_ramp(&config.ramp, params.exposure_time_ms)
                .map_err(|e| e.at_step(RAMP_TOO_SHORT, "ramp parameters"))?;
            link_step(ctx, plan.command.clone(), RAMP_REPLY, RAMP_LINK).await?;
            plan
        }
    };

    let exposures = expose(ctx, &params, sampling, multrun, plan.overhead_ms).await;

    // The telescope goes back to the pointing centre even after a failure.
    if !config.multrun_offsets.is_empty() {
        let reset = PeerRequest::new(
            PeerKind::Telescope,
            PeerCommand::OffsetRaDec {
                ra_arcsec: 0.0,
                dec_arcsec: 0.0,
            },
        )
        .ignore_abort();
        let reset = ctx
            .call_peer(reset)
            .await
            .map_err(|e| e.at_step(RESET_OFFSET, "reset telescope offset"));
        match (&exposures, reset) {
            (Ok(_), Err(error)) => return Err(error),
            (Err(_), Err(error)) => warn!(%error, "telescope offset not reset"),
            _ => {}
        }
    }
    let filenames = exposures?;

    wait_for_pipeline(ctx, config.acks.default_ms).await?;
    info!(frames = filenames.len(), "multrun complete");

    let mut done = CommandDone::success(ctx.command_id().clone())
        .with_field(
            "filenames",
            Value::Array(filenames.iter().cloned().map(Value::String).collect()),
        );
    if let Some(last) = filenames.last() {
        done = done.with_field("filename", last.clone());
    }
    if let Some(multrun) = multrun {
        done = done.with_field("multrun", multrun);
    }
    Ok(done)
}

async fn expose(
    ctx: &CommandContext,
    params: &MultrunParams,
    sampling: SamplingMode,
    multrun: Option<u32>,
    overhead_ms: u64,
) -> ControlResult<Vec<String>> {
    let runtime = ctx.runtime();
    let config = runtime.config();
    let frame_ms = params.exposure_time_ms + overhead_ms + config.acks.default_ms;
    let (kind, obstype) = if params.standard {
        (ExposureKind::Standard, "STANDARD")
    } else {
        (ExposureKind::Exposure, "EXPOSE")
    };

    let mut headers = HeaderSet::new();
    let mut filenames = Vec::with_capacity(params.count as usize);
    for index in 0..params.count {
        ctx.acknowledge(frame_ms)?;

        headers.clear();
        headers.add_value("INSTRUME", config.instrument.as_str());
        headers.add_value("OBSTYPE", obstype);
        headers.add(
            "EXPTIME",
            HeaderCard::new(params.exposure_time_ms as f64 / 1000.0).with_units("s"),
        );
        headers.add_value("SAMPLING", sampling.to_string());
        headers.add_value("EXPNUM", i64::from(index + 1));
        headers.add_value("EXPTOTAL", i64::from(params.count));
        if let Some(multrun) = multrun {
            headers.add_value("RUNNUM", i64::from(multrun));
        }
        headers.add_value("CONFIGID", runtime.status().config_id() as i64);
        if let Some(name) = runtime.status().config_name() {
            headers.add_value("CONFNAME", name);
        }

        // The telescope moves while the peers report their headers.
        let offset = async {
            if config.multrun_offsets.is_empty() {
                return Ok(());
            }
            let (ra, dec) = config.multrun_offsets[index as usize % config.multrun_offsets.len()];
            let offset = PeerRequest::new(
                PeerKind::Telescope,
                PeerCommand::OffsetRaDec {
                    ra_arcsec: ra,
                    dec_arcsec: dec,
                },
            );
            ctx.call_peer(offset)
                .await
                .map(|_| ())
                .map_err(|e| e.at_step(FRAME_SETUP, "telescope offset"))
        };
        let (offset, telescope, calibration) = tokio::join!(
            offset,
            fetch_headers(ctx, PeerKind::Telescope),
            fetch_headers(ctx, PeerKind::Calibration),
        );
        offset?;
        headers.merge(&telescope?);
        headers.merge(&calibration?);

        let frame = Frame {
            number: index + 1,
            sampling,
            kind,
            headers: &headers,
        };
        let offsets = AcquireOffsets {
            reply: ACQUIRE_REPLY,
            link: codes::MULTRUN,
            enqueue: ENQUEUE,
        };
        let location = acquire_frame(ctx, frame, offsets).await?;
        ctx.acknowledge_frame(frame_ms, location.clone())?;
        filenames.push(location);
        ctx.check_abort()?;
    }
    Ok(filenames)
}

async fn fetch_headers(ctx: &CommandContext, peer: PeerKind) -> ControlResult<HeaderSet> {
    ctx.call_peer(PeerRequest::new(peer, PeerCommand::GetFitsHeaders))
        .await
        .and_then(|done| done.headers())
        .map_err(|e| e.at_step(FRAME_SETUP, "fetch headers"))
}
