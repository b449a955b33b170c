use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use irctl_protocol::{
    CommandClass, CommandDone, ControlError, ControlResult, InboundCommand, SessionId,
    SessionMessage, codes,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::{CommandContext, CommandHandler, HandlerRegistry};
use crate::{InstrumentRuntime, InterruptLane};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Reading,
    Acknowledging,
    Executing,
    Completing,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Reading => "reading",
            Self::Acknowledging => "acknowledging",
            Self::Executing => "executing",
            Self::Completing => "completing",
        };
        f.write_str(name)
    }
}

/// Serves client connections against one handler registry.
#[derive(Clone)]
pub struct SessionDispatcher {
    registry: Arc<HandlerRegistry>,
    runtime: InstrumentRuntime,
    lane: InterruptLane,
}

impl SessionDispatcher {
    pub fn new(registry: HandlerRegistry, runtime: InstrumentRuntime, lane: InterruptLane) -> Self {
        Self {
            registry: Arc::new(registry),
            runtime,
            lane,
        }
    }

    pub fn runtime(&self) -> &InstrumentRuntime {
        &self.runtime
    }

    /// Run one session until the client disconnects. Commands are handled
    /// strictly one after another; a malformed command ends the session.
    #[instrument(skip(self, stream), fields(session_id = %session_id))]
    pub async fn serve_connection<S>(&self, session_id: SessionId, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (replies, outgoing) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, outgoing));
        let mut lines = BufReader::new(reader).lines();
        info!("session opened");

        let outcome = loop {
            debug!(phase = %SessionPhase::Reading, "awaiting command");
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(error) => {
                    break Err(anyhow::Error::new(error).context("failed reading from client"));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let command = match InboundCommand::parse_line(&line) {
                Ok(command) => command,
                Err(error) => {
                    warn!(%error, "malformed command, closing session");
                    break Err(anyhow!(error));
                }
            };

            let done = self.handle(&session_id, command, &replies).await;
            debug!(phase = %SessionPhase::Completing, successful = done.successful, "completing");
            if replies.send(SessionMessage::Done(done)).is_err() {
                break Err(anyhow!("client writer stopped"));
            }
            debug!(phase = %SessionPhase::Idle, "command complete");
        };

        drop(replies);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "client writer failed"),
            Err(error) => warn!(%error, "client writer task failed"),
        }
        info!("session closed");
        outcome
    }

    #[instrument(
        skip(self, session_id, command, replies),
        fields(command_id = %command.id, command_type = %command.command_type)
    )]
    async fn handle(
        &self,
        session_id: &SessionId,
        command: InboundCommand,
        replies: &mpsc::UnboundedSender<SessionMessage>,
    ) -> CommandDone {
        let command_id = command.id.clone();
        let Some(handler) = self.registry.get(&command.command_type) else {
            warn!("no handler for command type");
            let error = ControlError::UnknownCommand(command.command_type.clone());
            return CommandDone::failure(command_id, &error);
        };

        debug!(phase = %SessionPhase::Acknowledging, "acknowledging");
        let time_to_complete_ms = match handler.acknowledge_time(&command, &self.runtime) {
            Ok(ms) => ms,
            Err(error) => return CommandDone::failure(command_id, &error),
        };
        let ack = irctl_protocol::Acknowledge {
            command_id: command_id.clone(),
            time_to_complete_ms,
            filename: None,
        };
        if replies.send(SessionMessage::Ack(ack)).is_err() {
            let error = ControlError::command(codes::ACK_SEND, "client connection closed");
            return CommandDone::failure(command_id, &error);
        }

        debug!(phase = %SessionPhase::Executing, class = ?handler.class(), "executing");
        let abort = CancellationToken::new();
        let ctx = CommandContext::new(
            session_id.clone(),
            command,
            abort.clone(),
            replies.clone(),
            self.runtime.clone(),
        );
        let result = match handler.class() {
            CommandClass::Interrupt => self.lane.run(execute(handler, ctx)).await,
            CommandClass::Normal => {
                let _active = self.runtime.status().begin(
                    session_id.clone(),
                    command_id.clone(),
                    handler.command_type(),
                    abort,
                );
                match tokio::spawn(execute(handler, ctx)).await {
                    Ok(result) => result,
                    Err(error) => {
                        warn!(%error, "handler task failed");
                        Err(ControlError::command(codes::SERVER, format!("handler failed: {error}")))
                    }
                }
            }
        };

        match result {
            Ok(done) => done,
            Err(error) => {
                if error.is_abort() {
                    info!(code = error.code(), "command aborted");
                } else {
                    warn!(code = error.code(), %error, "command failed");
                }
                CommandDone::failure(command_id, &error)
            }
        }
    }
}

async fn execute(handler: Arc<dyn CommandHandler>, ctx: CommandContext) -> ControlResult<CommandDone> {
    handler.execute(&ctx).await
}

async fn write_loop<W>(mut writer: W, mut outgoing: mpsc::UnboundedReceiver<SessionMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(error) => bail!("failed encoding reply: {error}"),
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, client};
    use anyhow::Result;
    use irctl_protocol::{PeerCommand, PeerKind};
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn unknown_command_fails_and_session_continues() -> Result<()> {
        let harness = Harness::start().await?;
        let (mut client, session) = client(&harness.dispatcher);

        client.send(r#"{"id":"u1","type":"focus"}"#).await?;
        let done = client.done().await?;
        assert!(!done.successful);
        assert_eq!(done.error_num, 1_403_300);
        assert!(done.error_string.contains("focus"));

        client.send(r#"{"id":"u2","type":"interrupt"}"#).await?;
        let ack = client.ack().await?;
        assert_eq!(ack.time_to_complete_ms, harness.runtime.config().acks.min_ms);
        let done = client.done().await?;
        assert!(done.successful);
        assert_eq!(done.command_id.as_str(), "u2");

        drop(client);
        timeout(Duration::from_secs(2), session).await???;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_command_terminates_session() -> Result<()> {
        let harness = Harness::start().await?;
        let (mut client, session) = client(&harness.dispatcher);

        client.send("this is not a command").await?;
        let outcome = timeout(Duration::from_secs(2), session).await??;
        assert!(outcome.is_err());
        assert!(client.next().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_aborts_a_command_blocked_on_a_peer() -> Result<()> {
        let harness = Harness::start().await?;
        harness.telescope.block(PeerCommand::GetFitsHeaders.name());
        let (mut exposing, exposing_session) = client(&harness.dispatcher);
        let (mut operator, _operator_session) = client(&harness.dispatcher);

        let controller = harness.controller.clone();
        controller.answer("GETCONFIG", "nResets=1 nReads=1 bFS=0");
        controller.answer("SETRAMPPARAM", "0:Ramp parameters set");

        exposing
            .send(r#"{"id":"m1","type":"multrun","exposure_time_ms":3000,"count":2}"#)
            .await?;
        exposing.ack().await?;
        harness.telescope.wait_blocked().await?;

        operator.send(r#"{"id":"i1","type":"interrupt"}"#).await?;
        let done = operator.done_skipping_acks().await?;
        assert!(done.successful);
        assert_eq!(done.fields.get("aborted_command_id").and_then(|v| v.as_str()), Some("m1"));

        let done = timeout(Duration::from_millis(500), exposing.done_skipping_acks()).await??;
        assert!(!done.successful);
        assert_eq!(done.command_id.as_str(), "m1");
        assert_eq!(done.error_num, 1_400_000 + PeerKind::Telescope.aborted_code());
        assert!(harness.runtime.status().active().is_empty());

        drop(exposing);
        timeout(Duration::from_secs(2), exposing_session).await???;
        Ok(())
    }
}
