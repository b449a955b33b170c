//! Fast path for interrupt-class commands.
//!
//! A single-worker runtime on its own OS thread. Normal-class work saturating
//! the main runtime cannot delay an abort queued here.

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use irctl_protocol::{ControlError, ControlResult, codes};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

type LaneJob = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct InterruptLane {
    jobs: mpsc::UnboundedSender<LaneJob>,
}

impl InterruptLane {
    pub fn start() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed building interrupt lane runtime")?;
        let (jobs, mut queue) = mpsc::unbounded_channel::<LaneJob>();

        std::thread::Builder::new()
            .name("irctl-interrupt".to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    info!("interrupt lane started");
                    while let Some(job) = queue.recv().await {
                        tokio::spawn(job);
                    }
                    debug!("interrupt lane stopped");
                });
            })
            .context("failed spawning interrupt lane thread")?;

        Ok(Self { jobs })
    }

    /// Run `work` on the lane and wait for its result.
    pub async fn run<F, T>(&self, work: F) -> ControlResult<T>
    where
        F: Future<Output = ControlResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: LaneJob = Box::pin(async move {
            let _ = result_tx.send(work.await);
        });
        self.jobs
            .send(job)
            .map_err(|_| ControlError::command(codes::SERVER, "interrupt lane is not running"))?;
        result_rx.await.map_err(|_| {
            ControlError::command(codes::SERVER, "interrupt lane dropped the command")
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn work_runs_on_the_lane_thread() -> Result<()> {
        let lane = InterruptLane::start()?;
        let name = lane
            .run(async { Ok(std::thread::current().name().map(str::to_owned)) })
            .await?;
        assert_eq!(name.as_deref(), Some("irctl-interrupt"));
        Ok(())
    }

    #[tokio::test]
    async fn errors_pass_through() -> Result<()> {
        let lane = InterruptLane::start()?;
        let err = lane
            .run(async { Err::<(), _>(ControlError::Aborted) })
            .await
            .expect_err("handler error");
        assert_eq!(err, ControlError::Aborted);
        Ok(())
    }
}
