//! Wires the instrument together: detector controller link, peer proxies,
//! data correlator, safety monitor and the client-facing session dispatcher.

mod config;
mod properties;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use irctl_link::ReplyBroker;
use irctl_peers::{PeerProxies, PeerProxy, TcpPeerClient};
use irctl_pipeline::{DataCorrelator, FrameNamer, JsonSidecarWriter};
use irctl_protocol::{
    HeaderWriter, ImageFlipper, PeerKind, PeerServiceClient, SafetyState, SessionId,
    TemperatureSensor,
};
use irctl_runtime::{
    HandlerRegistry, InstrumentRuntime, InterruptLane, RebootLevel, RuntimeParts,
    SessionDispatcher,
};
use irctl_safety::{FileTemperatureSensor, SafetyMonitor};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use config::{InstrumentConfig, PeerEndpoint};
pub use properties::Properties;

/// Upper bound on each wait for the safety monitor during shutdown.
const SAFETY_STOP_WAIT: Duration = Duration::from_secs(5);

pub struct KernelBuilder {
    config: InstrumentConfig,
    sensor: Option<Arc<dyn TemperatureSensor>>,
    header_writer: Option<Arc<dyn HeaderWriter>>,
    flipper: Option<Arc<dyn ImageFlipper>>,
    telescope: Option<Arc<dyn PeerServiceClient>>,
    calibration: Option<Arc<dyn PeerServiceClient>>,
    reduction: Option<Arc<dyn PeerServiceClient>>,
}

impl KernelBuilder {
    pub fn new(config: InstrumentConfig) -> Self {
        Self {
            config,
            sensor: None,
            header_writer: None,
            flipper: None,
            telescope: None,
            calibration: None,
            reduction: None,
        }
    }

    /// Overrides the file sensor named by the configuration.
    pub fn temperature_sensor(mut self, sensor: Arc<dyn TemperatureSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    /// Defaults to JSON sidecar files next to each frame.
    pub fn header_writer(mut self, writer: Arc<dyn HeaderWriter>) -> Self {
        self.header_writer = Some(writer);
        self
    }

    pub fn image_flipper(mut self, flipper: Arc<dyn ImageFlipper>) -> Self {
        self.flipper = Some(flipper);
        self
    }

    /// Replaces the TCP client for one peer service.
    pub fn peer_client(mut self, kind: PeerKind, client: Arc<dyn PeerServiceClient>) -> Self {
        let slot = match kind {
            PeerKind::Telescope => &mut self.telescope,
            PeerKind::Calibration => &mut self.calibration,
            PeerKind::Reduction => &mut self.reduction,
        };
        *slot = Some(client);
        self
    }

    /// Connect the detector controller link and start every background task.
    #[instrument(skip(self), fields(link = %self.config.link_address))]
    pub async fn start(self) -> Result<InstrumentKernel> {
        let config = self.config;
        let shutdown = CancellationToken::new();

        let link = ReplyBroker::connect(&config.link_address).await?;
        link.set_orphan_grace(config.link_orphan_grace);
        if config.runtime.controller.enabled {
            if let Err(startup_error) = link.start_controller(&config.runtime.controller).await {
                link.shutdown();
                return Err(startup_error).context("detector controller start-up failed");
            }
        } else {
            info!("controller start-up disabled");
        }

        let connect_timeout = config.peer_connect_timeout;
        let client = |endpoint: &PeerEndpoint, custom: Option<Arc<dyn PeerServiceClient>>| {
            custom.unwrap_or_else(|| {
                Arc::new(
                    TcpPeerClient::new(endpoint.address.clone()).connect_timeout(connect_timeout),
                ) as Arc<dyn PeerServiceClient>
            })
        };
        let peers = PeerProxies::new(
            PeerProxy::new(PeerKind::Telescope, client(&config.telescope, self.telescope))
                .enabled(config.telescope.enabled),
            PeerProxy::new(
                PeerKind::Calibration,
                client(&config.calibration, self.calibration),
            )
            .enabled(config.calibration.enabled),
            PeerProxy::new(PeerKind::Reduction, client(&config.reduction, self.reduction))
                .enabled(config.reduction.enabled),
        );

        let header_writer = self
            .header_writer
            .unwrap_or_else(|| Arc::new(JsonSidecarWriter) as Arc<dyn HeaderWriter>);
        let mut correlator = DataCorrelator::new(config.correlator.clone(), header_writer);
        match self.flipper {
            Some(flipper) => correlator = correlator.flipper(flipper),
            None if config.correlator.flip_x || config.correlator.flip_y => {
                warn!("frame flipping configured without an image flipper");
            }
            None => {}
        }
        let correlator = correlator.spawn(shutdown.child_token());

        let sensor = self.sensor.or_else(|| {
            config.temperature_file.as_ref().map(|path| {
                Arc::new(FileTemperatureSensor::new(path)) as Arc<dyn TemperatureSensor>
            })
        });
        let (safety, safety_task) = match sensor {
            Some(sensor) => {
                let monitor =
                    SafetyMonitor::new(config.safety.clone(), sensor, Arc::new(link.clone()));
                let task = monitor.spawn();
                (Some(monitor), Some(task))
            }
            None => {
                info!("no temperature sensor configured, safety monitor not started");
                (None, None)
            }
        };

        let namer = FrameNamer::new(
            config.correlator.output_directory.clone(),
            config.runtime.instrument.clone(),
        );
        let runtime = InstrumentRuntime::new(RuntimeParts {
            config: config.runtime.clone(),
            link: link.clone(),
            peers,
            correlator,
            namer,
            safety: safety.as_ref().map(SafetyMonitor::subscribe),
            shutdown: shutdown.clone(),
        });
        let lane = InterruptLane::start()?;
        let dispatcher =
            SessionDispatcher::new(HandlerRegistry::with_instrument_handlers(), runtime, lane);

        info!(listen = %config.listen, "instrument kernel started");
        Ok(InstrumentKernel {
            config: Arc::new(config),
            dispatcher,
            link,
            safety,
            safety_task: Arc::new(Mutex::new(safety_task)),
            shutdown,
        })
    }
}

/// A running instrument. Cloning is cheap.
#[derive(Clone)]
pub struct InstrumentKernel {
    config: Arc<InstrumentConfig>,
    dispatcher: SessionDispatcher,
    link: ReplyBroker,
    safety: Option<SafetyMonitor>,
    safety_task: Arc<Mutex<Option<JoinHandle<SafetyState>>>>,
    shutdown: CancellationToken,
}

impl InstrumentKernel {
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn runtime(&self) -> &InstrumentRuntime {
        self.dispatcher.runtime()
    }

    pub fn safety_state(&self) -> Option<SafetyState> {
        self.safety.as_ref().map(SafetyMonitor::state)
    }

    /// Set when a `reboot` command asked the daemon to exit.
    pub fn requested_reboot(&self) -> Option<RebootLevel> {
        self.runtime().requested_reboot()
    }

    /// Fires when [`InstrumentKernel::shutdown`] is called or a command asks
    /// the daemon to exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("failed binding client listener on {}", self.config.listen))
    }

    /// Accept client connections until shutdown, one session per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        info!(%local, "accepting client connections");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    accepted.context("failed to accept client connection")?
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(peer = %peer, %error, "could not disable nagle");
            }
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let session_id = SessionId::generate();
                if let Err(error) = dispatcher.serve_connection(session_id, stream).await {
                    warn!(peer = %peer, "client session ended with error: {error:?}");
                }
            });
        }
        info!("client listener stopped");
        Ok(())
    }

    /// Stop accepting clients and the background tasks, then drop the link.
    /// Returns even if the controller has stopped answering.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(safety) = &self.safety {
            match timeout(SAFETY_STOP_WAIT, safety.stop()).await {
                Ok(state) => info!(%state, "safety monitor stopped"),
                Err(_) => warn!("safety monitor still running, closing the link under it"),
            }
        }
        self.link.shutdown();

        let task = self.safety_task.lock().await.take();
        if let Some(task) = task {
            match timeout(SAFETY_STOP_WAIT, task).await {
                Ok(Ok(state)) => debug!(%state, "safety task finished"),
                Ok(Err(join_error)) => error!(%join_error, "safety task failed"),
                Err(_) => warn!("safety task did not finish"),
            }
        }
    }
}
