//! Shared fakes for runtime tests: a scripted detector controller on an
//! in-memory link, scripted peer services and a client driver.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use irctl_link::ReplyBroker;
use irctl_peers::{PeerProxies, PeerProxy};
use irctl_pipeline::{CorrelatorSettings, DataCorrelator, FrameNamer, JsonSidecarWriter, directory_name};
use irctl_protocol::{
    Acknowledge, AcknowledgeSink, CommandDone, ControlResult, InboundCommand, PeerKind,
    PeerServiceClient, RequestLine, SessionId, SessionMessage,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf, duplex,
    split,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    HandlerRegistry, InstrumentRuntime, InterruptLane, RuntimeConfig, RuntimeParts,
    SessionDispatcher,
};

pub fn unique_test_root(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("irctl-runtime-{name}-{nanos}"))
}

/// Scripted detector controller. Replies by opcode; `ACQUIRERAMP` also
/// writes a ramp directory under the up-the-ramp root.
#[derive(Clone, Default)]
pub struct FakeController {
    state: Arc<Mutex<ControllerState>>,
}

#[derive(Default)]
struct ControllerState {
    replies: HashMap<String, String>,
    silent: HashSet<String>,
    requests: Vec<String>,
}

impl FakeController {
    pub fn answer(&self, opcode: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(opcode.to_owned(), reply.to_owned());
    }

    /// Never reply to `opcode`.
    pub fn silence(&self, opcode: &str) {
        self.state.lock().silent.insert(opcode.to_owned());
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    fn reply_for(&self, request: &str) -> Option<String> {
        let opcode = RequestLine::parse(request)
            .map(|line| line.opcode)
            .unwrap_or_else(|_| request.to_owned());
        let mut state = self.state.lock();
        state.requests.push(request.to_owned());
        if state.silent.contains(&opcode) {
            return None;
        }
        let reply = state.replies.get(&opcode).cloned().unwrap_or_else(|| {
            match opcode.as_str() {
                "ACQUIRERAMP" => "0:Ramp acquisition succeeded",
                "PING" => "0:The system is idle",
                "GETCONFIG" => "nResets=1 nReads=1 bFS=0",
                _ => "0:OK",
            }
            .to_owned()
        });
        Some(reply)
    }

    fn spawn(
        self,
        mut requests: Lines<BufReader<ReadHalf<DuplexStream>>>,
        mut replies: WriteHalf<DuplexStream>,
        ramp_root: PathBuf,
    ) {
        tokio::spawn(async move {
            while let Ok(Some(request)) = requests.next_line().await {
                if request.starts_with("ACQUIRERAMP") {
                    let _ = write_ramp(&ramp_root).await;
                }
                let Some(reply) = self.reply_for(&request) else {
                    continue;
                };
                if replies.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn write_ramp(root: &Path) -> Result<()> {
    // One directory per ramp, as the controller does; later ramps in the same
    // second take the next free second.
    let mut stamp = Utc::now();
    let mut directory = root.join(directory_name(stamp));
    while tokio::fs::metadata(&directory).await.is_ok() {
        stamp += chrono::Duration::seconds(1);
        directory = root.join(directory_name(stamp));
    }
    tokio::fs::create_dir_all(&directory).await?;
    for n in 1u8..=3 {
        tokio::fs::write(directory.join(format!("H2RG_R01_M01_N{n:02}.fits")), [n]).await?;
    }
    Ok(())
}

/// Scripted peer service. Completes every command at once unless its
/// command type has been blocked, in which case it never completes.
#[derive(Clone, Default)]
pub struct FakePeer {
    state: Arc<Mutex<PeerState>>,
    blocked_reached: Arc<Notify>,
}

#[derive(Default)]
struct PeerState {
    blocked: HashSet<String>,
    received: Vec<InboundCommand>,
}

impl FakePeer {
    pub fn block(&self, command_type: &str) {
        self.state.lock().blocked.insert(command_type.to_owned());
    }

    pub fn received(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .map(|command| command.command_type.clone())
            .collect()
    }

    pub async fn wait_blocked(&self) -> Result<()> {
        timeout(Duration::from_secs(2), self.blocked_reached.notified()).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerServiceClient for FakePeer {
    async fn send(
        &self,
        command: InboundCommand,
        acks: Arc<dyn AcknowledgeSink>,
    ) -> ControlResult<CommandDone> {
        let blocked = {
            let mut state = self.state.lock();
            state.received.push(command.clone());
            state.blocked.contains(&command.command_type)
        };
        if blocked {
            self.blocked_reached.notify_one();
            std::future::pending::<()>().await;
        }
        acks.acknowledge(Acknowledge {
            command_id: command.id.clone(),
            time_to_complete_ms: 1_000,
            filename: None,
        });
        let mut done = CommandDone::success(command.id);
        if command.command_type == "get_fits_headers" {
            done = done.with_field("headers", json!({"TELFOCUS": {"value": 1.5}}));
        }
        Ok(done)
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub runtime: InstrumentRuntime,
    pub dispatcher: SessionDispatcher,
    pub controller: FakeController,
    pub telescope: FakePeer,
    pub calibration: FakePeer,
    pub reduction: FakePeer,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub async fn start() -> Result<Self> {
        Self::with_config(RuntimeConfig {
            drain_poll: Duration::from_millis(20),
            ..RuntimeConfig::default()
        })
        .await
    }

    pub async fn with_config(config: RuntimeConfig) -> Result<Self> {
        let root = unique_test_root("harness");
        let output = root.join("out");
        let settings = CorrelatorSettings::new(root.join("data"), &output);
        tokio::fs::create_dir_all(&settings.up_the_ramp_root).await?;
        tokio::fs::create_dir_all(&settings.fowler_root).await?;

        let (ours, theirs) = duplex(4096);
        let (reader, writer) = split(ours);
        let (requests, replies) = split(theirs);
        let link = ReplyBroker::spawn(reader, writer);
        let controller = FakeController::default();
        controller.clone().spawn(
            BufReader::new(requests).lines(),
            replies,
            settings.up_the_ramp_root.clone(),
        );

        let telescope = FakePeer::default();
        let calibration = FakePeer::default();
        let reduction = FakePeer::default();
        let peers = PeerProxies::new(
            PeerProxy::new(PeerKind::Telescope, Arc::new(telescope.clone())),
            PeerProxy::new(PeerKind::Calibration, Arc::new(calibration.clone())),
            PeerProxy::new(PeerKind::Reduction, Arc::new(reduction.clone())),
        );

        let shutdown = CancellationToken::new();
        let correlator =
            DataCorrelator::new(settings, Arc::new(JsonSidecarWriter)).spawn(shutdown.clone());
        let namer = FrameNamer::new(&output, config.instrument.clone());

        let runtime = InstrumentRuntime::new(RuntimeParts {
            config,
            link,
            peers,
            correlator,
            namer,
            safety: None,
            shutdown: shutdown.child_token(),
        });
        let dispatcher = SessionDispatcher::new(
            HandlerRegistry::with_instrument_handlers(),
            runtime.clone(),
            InterruptLane::start()?,
        );

        Ok(Self {
            root,
            runtime,
            dispatcher,
            controller,
            telescope,
            calibration,
            reduction,
            shutdown,
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub struct TestClient {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<SessionMessage>> {
        let line = timeout(Duration::from_secs(5), self.lines.next_line()).await??;
        Ok(match line {
            Some(line) => Some(SessionMessage::parse_line(&line)?),
            None => None,
        })
    }

    pub async fn ack(&mut self) -> Result<Acknowledge> {
        match self.next().await? {
            Some(SessionMessage::Ack(ack)) => Ok(ack),
            other => bail!("expected ack, got {other:?}"),
        }
    }

    pub async fn done(&mut self) -> Result<CommandDone> {
        match self.next().await? {
            Some(SessionMessage::Done(done)) => Ok(done),
            other => bail!("expected done, got {other:?}"),
        }
    }

    /// Collect acks until the completion arrives.
    pub async fn done_with_acks(&mut self) -> Result<(Vec<Acknowledge>, CommandDone)> {
        let mut acks = Vec::new();
        loop {
            match self.next().await? {
                Some(SessionMessage::Ack(ack)) => acks.push(ack),
                Some(SessionMessage::Done(done)) => return Ok((acks, done)),
                None => bail!("session closed before completion"),
            }
        }
    }

    pub async fn done_skipping_acks(&mut self) -> Result<CommandDone> {
        Ok(self.done_with_acks().await?.1)
    }
}

/// Open a session on an in-memory connection.
pub fn client(dispatcher: &SessionDispatcher) -> (TestClient, JoinHandle<Result<()>>) {
    let (ours, theirs) = duplex(16 * 1024);
    let dispatcher = dispatcher.clone();
    let session = tokio::spawn(async move {
        dispatcher
            .serve_connection(SessionId::generate(), theirs)
            .await
    });
    let (reader, writer) = split(ours);
    let client = TestClient {
        lines: BufReader::new(reader).lines(),
        writer,
    };
    (client, session)
}
