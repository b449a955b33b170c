//! Command proxies for the three peer services.
//!
//! Every call follows one pattern: hand the request to a worker task, then
//! wait for either its completion or the owning session's abort token. A
//! missing completion becomes a comms failure for that peer, an abort becomes
//! an aborted failure, and the worker is left to finish on its own.

mod client;

use std::sync::Arc;

use irctl_protocol::{
    AcknowledgeSink, CommandDone, ControlError, ControlResult, PeerKind, PeerRequest,
    PeerServiceClient, WaitPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use client::TcpPeerClient;

#[derive(Clone)]
pub struct PeerProxy {
    kind: PeerKind,
    enabled: bool,
    client: Arc<dyn PeerServiceClient>,
}

impl PeerProxy {
    pub fn new(kind: PeerKind, client: Arc<dyn PeerServiceClient>) -> Self {
        Self {
            kind,
            enabled: true,
            client,
        }
    }

    /// A disabled proxy answers every call with success and does no I/O.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[instrument(
        skip(self, request, abort, acks),
        fields(peer = %self.kind, command = request.command.name(), command_id = %request.command_id)
    )]
    pub async fn call(
        &self,
        request: PeerRequest,
        abort: &CancellationToken,
        acks: Arc<dyn AcknowledgeSink>,
    ) -> ControlResult<CommandDone> {
        if !self.enabled {
            debug!("peer disabled, reporting success");
            return Ok(CommandDone::success(request.command_id));
        }
        if request.check_abort && abort.is_cancelled() {
            return Err(ControlError::PeerAborted(self.kind));
        }

        let command = request.command.to_inbound(request.command_id.clone())?;
        let client = self.client.clone();
        let worker = tokio::spawn(async move { client.send(command, acks).await });

        if request.wait == WaitPolicy::FireAndForget {
            let kind = self.kind;
            tokio::spawn(async move {
                match worker.await {
                    Ok(Ok(done)) if done.successful => debug!(peer = %kind, "background command completed"),
                    Ok(Ok(done)) => warn!(
                        peer = %kind,
                        error_num = done.error_num,
                        error = %done.error_string,
                        "background command failed"
                    ),
                    Ok(Err(error)) => warn!(peer = %kind, %error, "background command not delivered"),
                    Err(error) => warn!(peer = %kind, %error, "background command worker failed"),
                }
            });
            return Ok(CommandDone::success(request.command_id));
        }

        let outcome = if request.check_abort {
            tokio::select! {
                outcome = worker => outcome,
                _ = abort.cancelled() => {
                    info!("abort requested, no longer waiting for peer");
                    return Err(ControlError::PeerAborted(self.kind));
                }
            }
        } else {
            worker.await
        };

        match outcome {
            Ok(Ok(done)) => done.into_peer_result(self.kind),
            Ok(Err(error)) => {
                warn!(%error, "peer exchange produced no completion");
                Err(ControlError::PeerComms(self.kind))
            }
            Err(error) => {
                warn!(%error, "peer worker failed");
                Err(ControlError::PeerComms(self.kind))
            }
        }
    }
}

/// The three proxies, addressed by [`PeerKind`].
#[derive(Clone)]
pub struct PeerProxies {
    telescope: PeerProxy,
    calibration: PeerProxy,
    reduction: PeerProxy,
}

impl PeerProxies {
    pub fn new(telescope: PeerProxy, calibration: PeerProxy, reduction: PeerProxy) -> Self {
        Self {
            telescope,
            calibration,
            reduction,
        }
    }

    pub fn get(&self, kind: PeerKind) -> &PeerProxy {
        match kind {
            PeerKind::Telescope => &self.telescope,
            PeerKind::Calibration => &self.calibration,
            PeerKind::Reduction => &self.reduction,
        }
    }

    pub async fn call(
        &self,
        request: PeerRequest,
        abort: &CancellationToken,
        acks: Arc<dyn AcknowledgeSink>,
    ) -> ControlResult<CommandDone> {
        self.get(request.target).call(request, abort, acks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use irctl_protocol::{DiscardAcknowledgements, InboundCommand, PeerCommand};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::{Duration, Instant, sleep, timeout};

    /// Never completes until the test releases it.
    #[derive(Default)]
    struct StuckPeer {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl PeerServiceClient for StuckPeer {
        async fn send(
            &self,
            command: InboundCommand,
            _acks: Arc<dyn AcknowledgeSink>,
        ) -> ControlResult<CommandDone> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(CommandDone::success(command.id))
        }
    }

    struct DeadPeer;

    #[async_trait]
    impl PeerServiceClient for DeadPeer {
        async fn send(
            &self,
            _command: InboundCommand,
            _acks: Arc<dyn AcknowledgeSink>,
        ) -> ControlResult<CommandDone> {
            Err(ControlError::PeerTransport("connection refused".to_owned()))
        }
    }

    fn acks() -> Arc<dyn AcknowledgeSink> {
        Arc::new(DiscardAcknowledgements)
    }

    #[tokio::test]
    async fn abort_stops_the_wait_promptly() -> Result<()> {
        let peer = Arc::new(StuckPeer::default());
        let proxy = PeerProxy::new(PeerKind::Telescope, peer.clone());
        let abort = CancellationToken::new();

        let call = tokio::spawn({
            let abort = abort.clone();
            async move {
                proxy
                    .call(
                        PeerRequest::new(PeerKind::Telescope, PeerCommand::GetFitsHeaders),
                        &abort,
                        acks(),
                    )
                    .await
            }
        });
        sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        abort.cancel();

        let err = timeout(Duration::from_millis(200), call)
            .await??
            .expect_err("aborted");
        assert_eq!(err, ControlError::PeerAborted(PeerKind::Telescope));
        assert_eq!(err.code(), 1_400_001);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn abort_is_ignored_when_policy_says_so() -> Result<()> {
        let peer = Arc::new(StuckPeer::default());
        let proxy = PeerProxy::new(PeerKind::Reduction, peer.clone());
        let abort = CancellationToken::new();
        abort.cancel();

        let call = tokio::spawn(async move {
            proxy
                .call(
                    PeerRequest::new(PeerKind::Reduction, PeerCommand::Abort).ignore_abort(),
                    &abort,
                    acks(),
                )
                .await
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());
        peer.release.notify_one();
        assert!(call.await??.successful);
        Ok(())
    }

    #[tokio::test]
    async fn missing_completion_is_a_comms_failure() -> Result<()> {
        let proxy = PeerProxy::new(PeerKind::Reduction, Arc::new(DeadPeer));
        let err = proxy
            .call(
                PeerRequest::new(
                    PeerKind::Reduction,
                    PeerCommand::Reduce {
                        filename: "frame.fits".to_owned(),
                    },
                ),
                &CancellationToken::new(),
                acks(),
            )
            .await
            .expect_err("dead peer");
        assert_eq!(err, ControlError::PeerComms(PeerKind::Reduction));
        assert_eq!(err.code(), 1_400_006);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_peer_succeeds_without_io() -> Result<()> {
        let peer = Arc::new(StuckPeer::default());
        let proxy = PeerProxy::new(PeerKind::Calibration, peer.clone()).enabled(false);
        let done = proxy
            .call(
                PeerRequest::new(PeerKind::Calibration, PeerCommand::GetFitsHeaders),
                &CancellationToken::new(),
                acks(),
            )
            .await?;
        assert!(done.successful);
        assert_eq!(peer.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn fire_and_forget_returns_before_the_peer_answers() -> Result<()> {
        let peer = Arc::new(StuckPeer::default());
        let proxy = PeerProxy::new(PeerKind::Reduction, peer.clone());
        let done = timeout(
            Duration::from_millis(200),
            proxy.call(
                PeerRequest::new(PeerKind::Reduction, PeerCommand::Abort).fire_and_forget(),
                &CancellationToken::new(),
                acks(),
            ),
        )
        .await??;
        assert!(done.successful);

        for _ in 0..50 {
            if peer.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1);
        peer.release.notify_one();
        Ok(())
    }

    #[tokio::test]
    async fn proxies_route_by_target() -> Result<()> {
        let telescope = Arc::new(StuckPeer::default());
        let proxies = PeerProxies::new(
            PeerProxy::new(PeerKind::Telescope, telescope.clone()),
            PeerProxy::new(PeerKind::Calibration, Arc::new(DeadPeer)).enabled(false),
            PeerProxy::new(PeerKind::Reduction, Arc::new(DeadPeer)),
        );
        assert!(!proxies.get(PeerKind::Calibration).is_enabled());

        let err = proxies
            .call(
                PeerRequest::new(PeerKind::Reduction, PeerCommand::Abort),
                &CancellationToken::new(),
                acks(),
            )
            .await
            .expect_err("reduction peer is dead");
        assert_eq!(err, ControlError::PeerComms(PeerKind::Reduction));
        assert_eq!(telescope.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
