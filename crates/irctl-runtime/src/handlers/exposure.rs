//! Exposure planning and the per-frame acquisition shared by `multrun` and
//! `bias`.

use chrono::Utc;
use irctl_pipeline::{ExposureKind, ExposureRecord};
use irctl_protocol::{
    ControlError, ControlResult, HeaderCard, HeaderSet, LinkCommand, SamplingMode,
};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::{FowlerSettings, RampSettings, RuntimeConfig};
use crate::registry::CommandContext;
use crate::status::InstrumentMode;

use super::link_step;

/// Controller parameters for one exposure length.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposurePlan {
    pub command: LinkCommand,
    /// Time spent resetting and reading out, on top of the exposure.
    pub overhead_ms: u64,
}

/// Fowler sampling: the controller adds the read time to the requested
/// exposure, so it is shortened by the reads before sending.
pub fn plan_fowler(settings: &FowlerSettings, exposure_ms: u64) -> ControlResult<ExposurePlan> {
    let read = settings.read_execution_ms as i64;
    let requested = exposure_ms as i64;
    let mut adjusted = requested - i64::from(settings.n_read) * read;
    if adjusted > read {
        adjusted -= read;
        // Below one read the controller no longer adds the extra read.
        if adjusted < read {
            return Err(ControlError::LinkRejected(format!(
                "exposure {requested} ms adjusts to {adjusted} ms, shorter than one read"
            )));
        }
    }
    if adjusted < 0 {
        return Err(ControlError::LinkRejected(format!(
            "exposure {requested} ms is shorter than the read overhead"
        )));
    }

    Ok(ExposurePlan {
        command: LinkCommand::SetFsParam {
            n_reset: settings.n_reset,
            n_read: settings.n_read,
            n_group: 1,
            exposure_secs: adjusted as f64 / 1000.0,
            n_ramps: 1,
        },
        overhead_ms: settings.reset_execution_ms * u64::from(settings.n_reset)
            + 2 * u64::from(settings.n_read) * settings.read_execution_ms,
    })
}

/// Up-the-ramp: the exposure is a whole number of read groups.
pub fn plan_ramp(settings: &RampSettings, exposure_ms: u64) -> ControlResult<ExposurePlan> {
    let n_group = exposure_ms / settings.group_execution_ms.max(1);
    if n_group < 1 {
        return Err(ControlError::LinkRejected(format!(
            "exposure {exposure_ms} ms is shorter than one group of {} ms",
            settings.group_execution_ms
        )));
    }
    let n_group = u32::try_from(n_group)
        .map_err(|_| ControlError::LinkRejected(format!("{n_group} groups is too many")))?;

    Ok(ExposurePlan {
        command: LinkCommand::SetRampParam {
            n_reset: settings.n_reset,
            n_read: settings.n_read,
            n_group,
            n_drop: settings.n_drop,
            n_ramps: 1,
        },
        overhead_ms: u64::from(settings.n_reset) * settings.reset_execution_ms,
    })
}

/// A zero-length ramp in either sampling mode.
pub fn bias_plan(config: &RuntimeConfig, sampling: SamplingMode) -> ExposurePlan {
    match sampling {
        SamplingMode::Fowler => {
            let fowler = &config.fowler;
            ExposurePlan {
                command: LinkCommand::SetFsParam {
                    n_reset: fowler.n_reset,
                    n_read: fowler.n_read,
                    n_group: 1,
                    exposure_secs: 0.0,
                    n_ramps: 1,
                },
                overhead_ms: fowler.reset_execution_ms * u64::from(fowler.n_reset)
                    + 2 * u64::from(fowler.n_read) * fowler.read_execution_ms,
            }
        }
        SamplingMode::UpTheRamp => {
            let ramp = &config.ramp;
            ExposurePlan {
                command: LinkCommand::SetRampParam {
                    n_reset: ramp.n_reset,
                    n_read: ramp.n_read,
                    n_group: 1,
                    n_drop: ramp.n_drop,
                    n_ramps: 1,
                },
                overhead_ms: u64::from(ramp.n_reset) * ramp.reset_execution_ms
                    + ramp.group_execution_ms,
            }
        }
    }
}

/// Error offsets for the acquisition steps of one handler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcquireOffsets {
    pub reply: i32,
    pub link: i32,
    pub enqueue: i32,
}

/// One frame to acquire.
pub(crate) struct Frame<'a> {
    pub number: u32,
    pub sampling: SamplingMode,
    pub kind: ExposureKind,
    pub headers: &'a HeaderSet,
}

/// Acquire one ramp and queue it for correlation. Returns the expected output
/// location of its first frame.
pub(crate) async fn acquire_frame(
    ctx: &CommandContext,
    frame: Frame<'_>,
    offsets: AcquireOffsets,
) -> ControlResult<String> {
    let runtime = ctx.runtime();
    ctx.check_abort()?;

    let started_at = Utc::now();
    runtime.status().exposure_started(frame.number, started_at);
    debug!(number = frame.number, %started_at, "acquiring ramp");
    link_step(ctx, LinkCommand::AcquireRamp, offsets.reply, offsets.link).await?;
    runtime.status().set_mode(InstrumentMode::ReadingOut);

    let naming = runtime
        .config()
        .rename_frames
        .then(|| runtime.next_run(frame.kind, started_at));
    let location = match &naming {
        Some(name) => name.path(1).display().to_string(),
        None => runtime.output_directory().display().to_string(),
    };

    // The live header set is rebuilt for the next frame; the record keeps a copy.
    let mut headers = frame.headers.clone();
    headers.add(
        "DATE-OBS",
        HeaderCard::new(started_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
            .with_comment("start of the ramp"),
    );
    runtime
        .correlator()
        .enqueue(ExposureRecord {
            started_at,
            sampling: frame.sampling,
            headers,
            kind: frame.kind,
            naming,
        })
        .map_err(|e| e.at_step(offsets.enqueue, "enqueue exposure"))?;
    info!(number = frame.number, %location, "ramp acquired");
    Ok(location)
}

/// Hold the command open until the correlator has drained, re-acknowledging
/// on every poll.
pub(crate) async fn wait_for_pipeline(ctx: &CommandContext, ack_ms: u64) -> ControlResult<()> {
    let runtime = ctx.runtime();
    let poll = runtime.config().drain_poll;
    loop {
        ctx.acknowledge(ack_ms)?;
        let depth = runtime.correlator().queue_depth();
        if depth == 0 {
            return Ok(());
        }
        debug!(depth, "waiting for data correlator");
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fowler(n_read: u32, read_ms: u64) -> FowlerSettings {
        FowlerSettings {
            n_reset: 1,
            n_read,
            reset_execution_ms: 1_000,
            read_execution_ms: read_ms,
        }
    }

    fn exposure_secs(plan: &ExposurePlan) -> f64 {
        match plan.command {
            LinkCommand::SetFsParam { exposure_secs, .. } => exposure_secs,
            _ => f64::NAN,
        }
    }

    #[test]
    fn fowler_exposure_is_shortened_by_reads() {
        let plan = plan_fowler(&fowler(2, 1_400), 10_000).unwrap();
        // 10000 - 2*1400 - 1400
        assert_eq!(exposure_secs(&plan), 5.8);
        assert_eq!(plan.overhead_ms, 1_000 + 2 * 2 * 1_400);
        assert_eq!(plan.command.to_line(), "SETFSPARAM(1, 2, 1, 5.8, 1)");
    }

    #[test]
    fn fowler_rejects_lengths_in_the_dead_band() {
        // 4000 - 1400 = 2600 > 1400, then 1200 < 1400
        assert!(plan_fowler(&fowler(1, 1_400), 4_000).is_err());
        // 2000 - 1400 = 600, not above one read, sent as is
        let plan = plan_fowler(&fowler(1, 1_400), 2_000).unwrap();
        assert_eq!(exposure_secs(&plan), 0.6);
        assert!(plan_fowler(&fowler(2, 1_400), 1_000).is_err());
    }

    #[test]
    fn ramp_groups_follow_exposure_length() {
        let settings = RampSettings {
            n_reset: 2,
            n_read: 1,
            n_drop: 3,
            reset_execution_ms: 700,
            group_execution_ms: 1_500,
        };
        let plan = plan_ramp(&settings, 7_600).unwrap();
        assert_eq!(plan.command.to_line(), "SETRAMPPARAM(2, 1, 5, 3, 1)");
        assert_eq!(plan.overhead_ms, 1_400);
        assert!(plan_ramp(&settings, 1_499).is_err());
    }

    #[test]
    fn bias_is_a_single_group() {
        let config = RuntimeConfig::default();
        let ramp = bias_plan(&config, SamplingMode::UpTheRamp);
        assert!(matches!(ramp.command, LinkCommand::SetRampParam { n_group: 1, .. }));
        let fowler = bias_plan(&config, SamplingMode::Fowler);
        assert_eq!(exposure_secs(&fowler), 0.0);
    }
}
