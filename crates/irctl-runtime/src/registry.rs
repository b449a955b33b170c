use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use irctl_link::LinkExchange;
use irctl_protocol::{
    Acknowledge, AcknowledgeSink, CommandClass, CommandDone, CommandId, ControlError,
    ControlResult, InboundCommand, LinkCommand, PeerRequest, SessionId, SessionMessage, codes,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::InstrumentRuntime;
use crate::handlers;

/// Executes one inbound command type.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_type(&self) -> &'static str;

    fn class(&self) -> CommandClass {
        CommandClass::Normal
    }

    /// Estimated time to completion sent in the first acknowledgement.
    fn acknowledge_time(
        &self,
        command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64>;

    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone>;
}

/// Command type to handler lookup, built once at start-up.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .insert(handler.command_type().to_owned(), handler);
    }

    pub fn get(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command_type).cloned()
    }

    pub fn command_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn with_instrument_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(handlers::AbortHandler));
        registry.register(Arc::new(handlers::InterruptHandler));
        registry.register(Arc::new(handlers::GetStatusHandler));
        registry.register(Arc::new(handlers::ConfigHandler));
        registry.register(Arc::new(handlers::MultrunHandler));
        registry.register(Arc::new(handlers::BiasHandler));
        registry.register(Arc::new(handlers::RebootHandler));
        registry
    }
}

/// What a handler sees of the session running it.
#[derive(Clone)]
pub struct CommandContext {
    session_id: SessionId,
    command: Arc<InboundCommand>,
    abort: CancellationToken,
    replies: mpsc::UnboundedSender<SessionMessage>,
    runtime: InstrumentRuntime,
}

impl CommandContext {
    pub fn new(
        session_id: SessionId,
        command: InboundCommand,
        abort: CancellationToken,
        replies: mpsc::UnboundedSender<SessionMessage>,
        runtime: InstrumentRuntime,
    ) -> Self {
        Self {
            session_id,
            command: Arc::new(command),
            abort,
            replies,
            runtime,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn command(&self) -> &InboundCommand {
        &self.command
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command.id
    }

    pub fn runtime(&self) -> &InstrumentRuntime {
        &self.runtime
    }

    /// This command's AbortRequested flag.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Abort checkpoint.
    pub fn check_abort(&self) -> ControlResult<()> {
        if self.abort.is_cancelled() {
            debug!(command_id = %self.command.id, "abort observed at checkpoint");
            return Err(ControlError::Aborted);
        }
        Ok(())
    }

    pub fn acknowledge(&self, time_to_complete_ms: u64) -> ControlResult<()> {
        self.send_ack(Acknowledge {
            command_id: self.command.id.clone(),
            time_to_complete_ms,
            filename: None,
        })
    }

    /// Per-frame progress acknowledgement carrying the frame's output location.
    pub fn acknowledge_frame(
        &self,
        time_to_complete_ms: u64,
        filename: impl Into<String>,
    ) -> ControlResult<()> {
        self.send_ack(Acknowledge {
            command_id: self.command.id.clone(),
            time_to_complete_ms,
            filename: Some(filename.into()),
        })
    }

    fn send_ack(&self, ack: Acknowledge) -> ControlResult<()> {
        self.replies
            .send(SessionMessage::Ack(ack))
            .map_err(|_| ControlError::command(codes::ACK_SEND, "client connection closed"))
    }

    /// Relays peer acknowledgements to this command's client.
    pub fn acks(&self) -> Arc<dyn AcknowledgeSink> {
        Arc::new(ForwardAcks {
            command_id: self.command.id.clone(),
            replies: self.replies.clone(),
        })
    }

    pub async fn call_peer(&self, request: PeerRequest) -> ControlResult<CommandDone> {
        self.runtime
            .peers()
            .call(request, &self.abort, self.acks())
            .await
    }

    /// Send over the controller link; the wait ends early on abort.
    pub async fn send_link(&self, command: LinkCommand) -> ControlResult<LinkExchange> {
        self.runtime
            .link()
            .send_cancellable(command, &self.abort)
            .await
    }
}

struct ForwardAcks {
    command_id: CommandId,
    replies: mpsc::UnboundedSender<SessionMessage>,
}

impl AcknowledgeSink for ForwardAcks {
    fn acknowledge(&self, ack: Acknowledge) {
        let _ = self.replies.send(SessionMessage::Ack(Acknowledge {
            command_id: self.command_id.clone(),
            ..ack
        }));
    }
}
