//! Reply broker for the detector controller link.
//!
//! The controller speaks one request per line and answers one reply per line,
//! but interrupt-class commands (`PING`, `STOPACQUISITION`, `POWERDOWNASIC`)
//! may be sent while a long `ACQUIRERAMP` is still outstanding. The broker
//! owns both halves of the link: senders register a pending entry and write
//! their request under one lock, and a single reader task routes every reply
//! line to a pending entry with [`route`].

mod controller;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use irctl_protocol::link::{exact_reply_opcode, prefix_reply_opcode};
use irctl_protocol::{
    CommandClass, ControlError, ControlResult, LinkCommand, LinkReply, PowerControl,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use controller::ControllerSetup;

/// How well a reply line matches a pending command. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRank {
    /// The line is a well-known reply of this command's opcode.
    Signature,
    /// The line starts with a multi-field reply prefix of this opcode.
    Prefix,
    /// Interrupt-class commands pre-empt normal-class replies.
    Interrupt,
    /// Anything else is served first-registered, first-served.
    Oldest,
}

pub fn match_rank(line: &str, opcode: &str, class: CommandClass) -> MatchRank {
    if exact_reply_opcode(line) == Some(opcode) {
        MatchRank::Signature
    } else if prefix_reply_opcode(line) == Some(opcode) {
        MatchRank::Prefix
    } else if class == CommandClass::Interrupt {
        MatchRank::Interrupt
    } else {
        MatchRank::Oldest
    }
}

/// Pick the pending command a reply belongs to, given pending commands in
/// registration order. Equal ranks go to the earliest registration.
pub fn route<'a>(
    line: &str,
    pending: impl IntoIterator<Item = (&'a str, CommandClass)>,
) -> Option<usize> {
    pending
        .into_iter()
        .enumerate()
        .min_by_key(|(index, (opcode, class))| (match_rank(line, opcode, *class), *index))
        .map(|(index, _)| index)
}

/// One completed request/reply exchange over the link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkExchange {
    pub command: LinkCommand,
    pub request: String,
    pub reply: LinkReply,
}

impl LinkExchange {
    /// Fail unless the controller answered with code 0.
    pub fn into_success(self) -> ControlResult<Self> {
        if self.reply.is_success() {
            Ok(self)
        } else {
            Err(ControlError::LinkRejected(format!(
                "{} returned {}:{}",
                self.request,
                self.reply.code(),
                self.reply.message()
            )))
        }
    }
}

struct PendingEntry {
    ticket: u64,
    opcode: &'static str,
    class: CommandClass,
    reply: oneshot::Sender<Option<String>>,
    // Held for normal-class entries until the entry leaves the set.
    _slot: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct PendingSet {
    entries: Vec<PendingEntry>,
    closed: bool,
}

type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long an abandoned entry may wait for its late reply.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(60);

struct BrokerInner {
    writer: tokio::sync::Mutex<LinkWriter>,
    pending: Mutex<PendingSet>,
    normal_slot: Arc<Semaphore>,
    next_ticket: AtomicU64,
    orphan_grace_ms: AtomicU64,
    stopped: CancellationToken,
}

impl BrokerInner {
    fn evict(&self, ticket: u64) {
        let entry = {
            let mut pending = self.pending.lock();
            let index = pending.entries.iter().position(|entry| entry.ticket == ticket);
            index.map(|index| pending.entries.remove(index))
        };
        if let Some(entry) = entry {
            warn!(ticket, opcode = entry.opcode, "no late reply for abandoned command, evicted");
        }
    }

    fn deliver(&self, line: String) {
        let entry = {
            let mut pending = self.pending.lock();
            let index = route(
                &line,
                pending.entries.iter().map(|entry| (entry.opcode, entry.class)),
            );
            index.map(|index| pending.entries.remove(index))
        };

        match entry {
            Some(entry) => {
                debug!(ticket = entry.ticket, opcode = entry.opcode, reply = %line, "reply routed");
                if entry.reply.send(Some(line)).is_err() {
                    debug!(ticket = entry.ticket, "waiter gone before reply arrived");
                }
            }
            None => warn!(reply = %line, "no pending command for reply, dropped"),
        }
    }

    fn fail_all(&self) {
        let entries = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.entries)
        };
        self.normal_slot.close();
        self.stopped.cancel();

        if !entries.is_empty() {
            warn!(pending = entries.len(), "link failed, failing pending commands");
        }
        for entry in entries {
            let _ = entry.reply.send(None);
        }
    }
}

/// Handle to the shared link. Cloning is cheap; all clones share one link.
#[derive(Clone)]
pub struct ReplyBroker {
    inner: Arc<BrokerInner>,
}

impl ReplyBroker {
    /// Take ownership of the link halves and start the reader task.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(BrokerInner {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(PendingSet::default()),
            normal_slot: Arc::new(Semaphore::new(1)),
            next_ticket: AtomicU64::new(1),
            orphan_grace_ms: AtomicU64::new(DEFAULT_ORPHAN_GRACE.as_millis() as u64),
            stopped: CancellationToken::new(),
        });
        tokio::spawn(read_loop(reader, inner.clone()));
        Self { inner }
    }

    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed connecting to detector controller at {address}"))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        info!(%address, "detector controller link connected");
        Ok(Self::spawn(reader, writer))
    }

    /// Send and wait for the reply. A normal-class command queues behind any
    /// normal-class command already pending.
    pub async fn send(&self, command: LinkCommand) -> ControlResult<LinkExchange> {
        self.send_cancellable(command, &CancellationToken::new())
            .await
    }

    /// As [`send`](Self::send), but stop waiting with `Aborted` once `cancel`
    /// fires. A command already written stays pending for the orphan grace
    /// period so its late reply is still consumed by the right entry; after
    /// that it is evicted and releases the normal slot.
    #[instrument(skip(self, command, cancel), fields(opcode = command.opcode()))]
    pub async fn send_cancellable(
        &self,
        command: LinkCommand,
        cancel: &CancellationToken,
    ) -> ControlResult<LinkExchange> {
        command.validate()?;
        let slot = match command.class() {
            CommandClass::Interrupt => None,
            CommandClass::Normal => {
                let acquire = self.inner.normal_slot.clone().acquire_owned();
                tokio::select! {
                    permit = acquire => Some(permit.map_err(|_| ControlError::LinkDown)?),
                    _ = cancel.cancelled() => return Err(ControlError::Aborted),
                }
            }
        };
        self.exchange(command, slot, cancel).await
    }

    /// Send without queueing: a normal-class command is rejected with
    /// `LinkBusy` while another one is pending.
    pub async fn try_send(&self, command: LinkCommand) -> ControlResult<LinkExchange> {
        command.validate()?;
        let slot = match command.class() {
            CommandClass::Interrupt => None,
            CommandClass::Normal => Some(
                self.inner
                    .normal_slot
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| ControlError::LinkBusy)?,
            ),
        };
        self.exchange(command, slot, &CancellationToken::new())
            .await
    }

    async fn exchange(
        &self,
        command: LinkCommand,
        slot: Option<OwnedSemaphorePermit>,
        cancel: &CancellationToken,
    ) -> ControlResult<LinkExchange> {
        let request = command.to_line();
        let (reply_tx, reply_rx) = oneshot::channel();

        let mut orphan;
        let written = {
            let mut writer = self.inner.writer.lock().await;
            let ticket = {
                let mut pending = self.inner.pending.lock();
                if pending.closed {
                    return Err(ControlError::LinkDown);
                }
                let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                pending.entries.push(PendingEntry {
                    ticket,
                    opcode: command.opcode(),
                    class: command.class(),
                    reply: reply_tx,
                    _slot: slot,
                });
                ticket
            };
            orphan = OrphanGuard {
                inner: self.inner.clone(),
                ticket,
                armed: true,
            };
            debug!(ticket, request = %request, "sending");
            let line = format!("{request}\n");
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(error) => Err(error),
            }
        };
        if let Err(error) = written {
            warn!(%error, request = %request, "link write failed");
            self.inner.fail_all();
        }

        let reply = tokio::select! {
            reply = reply_rx => reply,
            _ = cancel.cancelled() => {
                debug!(request = %request, "stopped waiting for reply");
                return Err(ControlError::Aborted);
            }
        };
        orphan.armed = false;
        match reply {
            Ok(Some(line)) => {
                let reply = LinkReply::parse(command.reply_form(), &line)?;
                Ok(LinkExchange {
                    command,
                    request,
                    reply,
                })
            }
            Ok(None) | Err(_) => Err(ControlError::LinkDown),
        }
    }

    /// Applies to entries abandoned from now on.
    pub fn set_orphan_grace(&self, grace: Duration) {
        self.inner
            .orphan_grace_ms
            .store(grace.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    pub fn normal_pending(&self) -> usize {
        self.inner
            .pending
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.class == CommandClass::Normal)
            .count()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.is_cancelled()
    }

    /// Stop the reader; every pending command fails with `LinkDown`.
    pub fn shutdown(&self) {
        self.inner.stopped.cancel();
    }
}

/// Schedules eviction of a written entry whose waiter went away before the
/// reply arrived.
struct OrphanGuard {
    inner: Arc<BrokerInner>,
    ticket: u64,
    armed: bool,
}

impl Drop for OrphanGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner.clone();
        let ticket = self.ticket;
        match Handle::try_current() {
            Ok(handle) => {
                let grace = Duration::from_millis(inner.orphan_grace_ms.load(Ordering::Relaxed));
                handle.spawn(async move {
                    tokio::select! {
                        _ = sleep(grace) => inner.evict(ticket),
                        _ = inner.stopped.cancelled() => {}
                    }
                });
            }
            Err(_) => inner.evict(ticket),
        }
    }
}

async fn read_loop<R>(reader: R, inner: Arc<BrokerInner>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = inner.stopped.cancelled() => {
                debug!("link reader stopping");
                break;
            }
            next = lines.next_line() => match next {
                Ok(Some(line)) => inner.deliver(line),
                Ok(None) => {
                    warn!("detector controller closed the link");
                    break;
                }
                Err(error) => {
                    warn!(%error, "link read failed");
                    break;
                }
            },
        }
    }
    inner.fail_all();
}

#[async_trait]
impl PowerControl for ReplyBroker {
    async fn power_down(&self) -> ControlResult<()> {
        self.send(LinkCommand::PowerDownAsic)
            .await?
            .into_success()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf, duplex, split};
    use tokio::time::{Duration, sleep, timeout};

    struct Controller {
        requests: Lines<BufReader<ReadHalf<DuplexStream>>>,
        replies: WriteHalf<DuplexStream>,
    }

    impl Controller {
        async fn expect(&mut self, request: &str) -> Result<()> {
            let line = timeout(Duration::from_secs(2), self.requests.next_line()).await??;
            assert_eq!(line.as_deref(), Some(request));
            Ok(())
        }

        async fn reply(&mut self, line: &str) -> Result<()> {
            self.replies.write_all(format!("{line}\n").as_bytes()).await?;
            Ok(())
        }
    }

    fn link() -> (ReplyBroker, Controller) {
        let (ours, theirs) = duplex(4096);
        let (reader, writer) = split(ours);
        let (requests, replies) = split(theirs);
        let broker = ReplyBroker::spawn(reader, writer);
        let controller = Controller {
            requests: BufReader::new(requests).lines(),
            replies,
        };
        (broker, controller)
    }

    #[test]
    fn ranked_match_prefers_signature_then_interrupt_then_oldest() {
        let pending = [
            ("ACQUIRERAMP", CommandClass::Normal),
            ("PING", CommandClass::Interrupt),
            ("STOPACQUISITION", CommandClass::Interrupt),
        ];
        assert_eq!(route("0:Ramp acquisition succeeded", pending), Some(0));
        assert_eq!(route("0:The system is idle", pending), Some(1));
        assert_eq!(route("0:Acquisition stopped", pending), Some(1));
        assert_eq!(
            route("0:Acquisition stopped", [("ACQUIRERAMP", CommandClass::Normal)]),
            Some(0)
        );
        assert_eq!(
            route("nResets=1 bFS=0", [("PING", CommandClass::Interrupt), ("GETCONFIG", CommandClass::Normal)]),
            Some(1)
        );
        assert_eq!(route("0:anything", []), None);
    }

    #[tokio::test]
    async fn interrupt_reply_reaches_interrupt_command_registered_later() -> Result<()> {
        let (broker, mut controller) = link();

        let acquire = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::AcquireRamp).await }
        });
        controller.expect("ACQUIRERAMP").await?;

        let ping = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::Ping).await }
        });
        controller.expect("PING").await?;
        assert_eq!(broker.pending_len(), 2);

        controller.reply("-1:Exposure is in progress").await?;
        let ping = ping.await??;
        assert_eq!(ping.reply.code(), -1);
        assert_eq!(broker.pending_len(), 1);
        assert!(!acquire.is_finished());

        controller.reply("0:Ramp acquisition succeeded").await?;
        let acquire = acquire.await??;
        assert!(acquire.reply.is_success());
        assert_eq!(broker.pending_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn second_normal_command_is_queued_or_rejected() -> Result<()> {
        let (broker, mut controller) = link();

        let acquire = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::AcquireRamp).await }
        });
        controller.expect("ACQUIRERAMP").await?;

        let busy = broker
            .try_send(LinkCommand::GetConfig)
            .await
            .expect_err("normal slot is taken");
        assert_eq!(busy, ControlError::LinkBusy);

        let config = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::GetConfig).await }
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.normal_pending(), 1);
        assert!(
            timeout(Duration::from_millis(50), controller.requests.next_line())
                .await
                .is_err(),
            "queued command must not reach the link yet"
        );

        controller.reply("0:Ramp acquisition succeeded").await?;
        acquire.await??;

        controller.expect("GETCONFIG").await?;
        assert_eq!(broker.normal_pending(), 1);
        controller.reply("nResets=1 nReads=2 bFS=1").await?;
        let config = config.await??;
        assert_eq!(config.reply.config()?.value_i64("bFS")?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn link_failure_fails_every_pending_command() -> Result<()> {
        let (broker, mut controller) = link();

        let mut waiters = Vec::new();
        for (command, line) in [
            (LinkCommand::AcquireRamp, "ACQUIRERAMP"),
            (LinkCommand::Ping, "PING"),
            (LinkCommand::StopAcquisition, "STOPACQUISITION"),
        ] {
            let broker_for_task = broker.clone();
            waiters.push(tokio::spawn(async move { broker_for_task.send(command).await }));
            controller.expect(line).await?;
        }
        assert_eq!(broker.pending_len(), 3);

        drop(controller);

        for waiter in waiters {
            let err = waiter.await?.expect_err("link is down");
            assert_eq!(err, ControlError::LinkDown);
        }
        assert_eq!(broker.pending_len(), 0);
        assert!(!broker.is_running());

        let err = broker
            .send(LinkCommand::Ping)
            .await
            .expect_err("broker stopped");
        assert_eq!(err, ControlError::LinkDown);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_entry_to_absorb_late_reply() -> Result<()> {
        let (broker, mut controller) = link();
        let cancel = CancellationToken::new();

        let acquire = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move {
                broker
                    .send_cancellable(LinkCommand::AcquireRamp, &cancel)
                    .await
            }
        });
        controller.expect("ACQUIRERAMP").await?;
        cancel.cancel();
        let err = acquire.await?.expect_err("cancelled");
        assert_eq!(err, ControlError::Aborted);
        assert_eq!(broker.pending_len(), 1);

        controller.reply("0:Ramp acquisition succeeded").await?;
        for _ in 0..100 {
            if broker.pending_len() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.pending_len(), 0);

        let config = tokio::spawn({
            let broker = broker.clone();
            async move { broker.try_send(LinkCommand::GetConfig).await }
        });
        controller.expect("GETCONFIG").await?;
        controller.reply("nResets=1").await?;
        config.await??;
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_command_releases_the_slot_after_grace() -> Result<()> {
        let (broker, mut controller) = link();
        broker.set_orphan_grace(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let acquire = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move {
                broker
                    .send_cancellable(LinkCommand::AcquireRamp, &cancel)
                    .await
            }
        });
        controller.expect("ACQUIRERAMP").await?;
        cancel.cancel();
        assert_eq!(acquire.await?.expect_err("cancelled"), ControlError::Aborted);
        assert_eq!(broker.normal_pending(), 1);

        let config = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::GetConfig).await }
        });
        controller.expect("GETCONFIG").await?;
        assert_eq!(broker.normal_pending(), 1);
        controller.reply("nResets=1").await?;
        timeout(Duration::from_secs(2), config).await???;
        assert_eq!(broker.pending_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_sender_is_evicted_too() -> Result<()> {
        let (broker, mut controller) = link();
        broker.set_orphan_grace(Duration::from_millis(20));

        let acquire = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send(LinkCommand::AcquireRamp).await }
        });
        controller.expect("ACQUIRERAMP").await?;
        acquire.abort();
        let _ = acquire.await;

        for _ in 0..100 {
            if broker.pending_len() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.pending_len(), 0);
        let config = tokio::spawn({
            let broker = broker.clone();
            async move { broker.try_send(LinkCommand::GetConfig).await }
        });
        controller.expect("GETCONFIG").await?;
        controller.reply("nResets=1").await?;
        config.await??;
        Ok(())
    }

    #[tokio::test]
    async fn rejected_parameters_never_reach_the_link() -> Result<()> {
        let (broker, mut controller) = link();
        let err = broker
            .send(LinkCommand::Initialize { level: 9 })
            .await
            .expect_err("level out of range");
        assert!(matches!(err, ControlError::LinkRejected(_)));
        assert!(
            timeout(Duration::from_millis(50), controller.requests.next_line())
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn power_down_requires_zero_reply_code() -> Result<()> {
        let (broker, mut controller) = link();

        let attempt = tokio::spawn({
            let broker = broker.clone();
            async move { broker.power_down().await }
        });
        controller.expect("POWERDOWNASIC").await?;
        controller.reply("-2:ASIC not responding").await?;
        assert!(attempt.await?.is_err());

        let attempt = tokio::spawn({
            let broker = broker.clone();
            async move { broker.power_down().await }
        });
        controller.expect("POWERDOWNASIC").await?;
        controller.reply("0:Powered down").await?;
        attempt.await??;
        Ok(())
    }
}
