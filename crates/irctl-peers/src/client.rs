use std::sync::Arc;

use async_trait::async_trait;
use irctl_protocol::{
    AcknowledgeSink, CommandDone, ControlError, ControlResult, InboundCommand, PeerServiceClient,
    SessionMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument};

/// Opens one short-lived connection per command and speaks JSON lines: the
/// command goes out, acknowledgements and one completion come back.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    address: String,
    connect_timeout: Duration,
}

impl TcpPeerClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn comms(error: impl std::fmt::Display) -> ControlError {
    ControlError::PeerTransport(error.to_string())
}

#[async_trait]
impl PeerServiceClient for TcpPeerClient {
    #[instrument(skip(self, command, acks), fields(address = %self.address, command = %command.command_type))]
    async fn send(
        &self,
        command: InboundCommand,
        acks: Arc<dyn AcknowledgeSink>,
    ) -> ControlResult<CommandDone> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| comms(format!("connect to {} timed out", self.address)))?
            .map_err(comms)?;
        let (reader, mut writer) = stream.into_split();

        let line = format!("{}\n", command.to_line()?);
        writer.write_all(line.as_bytes()).await.map_err(comms)?;
        writer.flush().await.map_err(comms)?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await.map_err(comms)? {
            if line.trim().is_empty() {
                continue;
            }
            match SessionMessage::parse_line(&line)? {
                SessionMessage::Ack(ack) => {
                    debug!(time_to_complete_ms = ack.time_to_complete_ms, "peer acknowledged");
                    acks.acknowledge(ack);
                }
                SessionMessage::Done(done) => return Ok(done),
            }
        }
        Err(comms("peer closed the connection before completing"))
    }
}
