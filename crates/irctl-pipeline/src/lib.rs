//! Data correlator.
//!
//! The controller writes each ramp into a fresh timestamp-named directory
//! that it chooses itself. Handlers enqueue an [`ExposureRecord`] per finished
//! exposure; one background worker matches each record to its directory,
//! annotates and relocates the frames, then removes the directory.

mod correlate;
mod naming;
mod sidecar;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use irctl_protocol::{
    ControlError, ControlResult, HeaderSet, HeaderWriter, ImageFlipper, SamplingMode,
};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use correlate::{
    DIRECTORY_TIMESTAMP, closest_after, directory_name, list_frames, locate_output,
    parse_directory_name, pseudo_cds, reclaim,
};
pub use naming::{ExposureKind, FrameName, FrameNamer, night_of};
pub use sidecar::JsonSidecarWriter;

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub up_the_ramp_root: PathBuf,
    pub fowler_root: PathBuf,
    /// Destination for frames that are not renamed.
    pub output_directory: PathBuf,
    pub extension: String,
    pub read_up_ramp_as_cds: bool,
    pub annotate: bool,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl CorrelatorSettings {
    pub fn new(data_root: impl Into<PathBuf>, output_directory: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            up_the_ramp_root: data_root.join("up_the_ramp"),
            fowler_root: data_root.join("fowler"),
            output_directory: output_directory.into(),
            extension: "fits".to_owned(),
            read_up_ramp_as_cds: false,
            annotate: true,
            flip_x: false,
            flip_y: false,
        }
    }

    pub fn root_for(&self, sampling: SamplingMode) -> &Path {
        match sampling {
            SamplingMode::UpTheRamp => &self.up_the_ramp_root,
            SamplingMode::Fowler => &self.fowler_root,
        }
    }
}

/// One finished exposure waiting to be correlated with its output.
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    pub started_at: DateTime<Utc>,
    pub sampling: SamplingMode,
    /// Private copy, taken when the exposure finished.
    pub headers: HeaderSet,
    pub kind: ExposureKind,
    pub naming: Option<FrameName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedExposure {
    pub source: PathBuf,
    pub frames: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct DataCorrelator {
    settings: CorrelatorSettings,
    headers: Arc<dyn HeaderWriter>,
    flipper: Option<Arc<dyn ImageFlipper>>,
}

impl DataCorrelator {
    pub fn new(settings: CorrelatorSettings, headers: Arc<dyn HeaderWriter>) -> Self {
        Self {
            settings,
            headers,
            flipper: None,
        }
    }

    pub fn flipper(mut self, flipper: Arc<dyn ImageFlipper>) -> Self {
        self.flipper = Some(flipper);
        self
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    #[instrument(skip(self, record), fields(started_at = %record.started_at, sampling = %record.sampling))]
    pub async fn process(&self, record: ExposureRecord) -> ControlResult<ProcessedExposure> {
        let source = locate_output(self.settings.root_for(record.sampling), record.started_at).await?;
        let mut frames = list_frames(&source, &self.settings.extension).await?;
        if record.sampling == SamplingMode::UpTheRamp && self.settings.read_up_ramp_as_cds {
            frames = pseudo_cds(frames);
        }
        if frames.is_empty() {
            warn!(source = %source.display(), "output directory holds no frames");
        }

        if self.settings.annotate {
            for frame in &frames {
                self.headers.write_headers(frame, &record.headers).await?;
            }
        }

        if self.settings.flip_x || self.settings.flip_y {
            let flipper = self.flipper.as_ref().ok_or_else(|| {
                ControlError::Pipeline("flip requested but no image flipper configured".to_owned())
            })?;
            for frame in &frames {
                flipper
                    .flip(frame, self.settings.flip_x, self.settings.flip_y)
                    .await?;
            }
        }

        let mut relocated = Vec::with_capacity(frames.len());
        for (index, frame) in frames.iter().enumerate() {
            let target = match &record.naming {
                Some(name) => name.path(index as u32 + 1),
                None => {
                    let file_name = frame.file_name().ok_or_else(|| {
                        ControlError::Pipeline(format!("frame {} has no file name", frame.display()))
                    })?;
                    self.settings.output_directory.join(file_name)
                }
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            move_file(frame, &target).await?;
            self.headers.frame_moved(frame, &target).await?;
            debug!(from = %frame.display(), to = %target.display(), "frame relocated");
            relocated.push(target);
        }

        reclaim(&source).await?;
        Ok(ProcessedExposure {
            source,
            frames: relocated,
        })
    }

    /// Start the worker. It stops after its current entry once `shutdown`
    /// fires or every handle has been dropped.
    pub fn spawn(self, shutdown: CancellationToken) -> CorrelatorHandle {
        let (queue, mut records) = mpsc::unbounded_channel::<ExposureRecord>();
        let state = Arc::new(QueueState::default());
        let worker_state = state.clone();

        tokio::spawn(async move {
            info!("data correlator started");
            loop {
                let record = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    record = records.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                match self.process(record).await {
                    Ok(done) => {
                        worker_state.processed.fetch_add(1, Ordering::SeqCst);
                        info!(
                            source = %done.source.display(),
                            frames = done.frames.len(),
                            "exposure processed"
                        );
                    }
                    Err(error) => {
                        worker_state.failed.fetch_add(1, Ordering::SeqCst);
                        warn!(%error, "exposure processing failed");
                    }
                }
                worker_state.depth.fetch_sub(1, Ordering::SeqCst);
            }
            info!("data correlator stopped");
        });

        CorrelatorHandle { queue, state }
    }
}

async fn move_file(from: &Path, to: &Path) -> ControlResult<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await.map_err(|e| {
        ControlError::Pipeline(format!("cannot move {} to {}: {e}", from.display(), to.display()))
    })?;
    fs::remove_file(from).await?;
    Ok(())
}

#[derive(Debug, Default)]
struct QueueState {
    // Queued plus in-progress records.
    depth: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct CorrelatorHandle {
    queue: mpsc::UnboundedSender<ExposureRecord>,
    state: Arc<QueueState>,
}

impl CorrelatorHandle {
    pub fn enqueue(&self, record: ExposureRecord) -> ControlResult<()> {
        self.state.depth.fetch_add(1, Ordering::SeqCst);
        self.queue.send(record).map_err(|_| {
            self.state.depth.fetch_sub(1, Ordering::SeqCst);
            ControlError::Pipeline("data correlator is not running".to_owned())
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.state.depth.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing being processed.
    pub fn is_idle(&self) -> bool {
        self.queue_depth() == 0
    }

    pub fn processed(&self) -> u64 {
        self.state.processed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.state.failed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::time::{Duration, sleep};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("irctl-correlator-{name}-{nanos}"))
    }

    async fn ramp(root: &Path, stamp: &str, frames: usize) -> Result<PathBuf> {
        let directory = root.join("up_the_ramp").join(stamp);
        fs::create_dir_all(directory.join("Result")).await?;
        for n in 1..=frames {
            fs::write(directory.join(format!("H2RG_R01_M01_N{n:02}.fits")), [n as u8]).await?;
        }
        fs::write(directory.join("Result").join("CDS.fits"), b"x").await?;
        Ok(directory)
    }

    fn record(stamp: &str, naming: Option<FrameName>) -> ExposureRecord {
        let mut headers = HeaderSet::new();
        headers.add_value("OBJECT", "flat");
        ExposureRecord {
            started_at: parse_directory_name(stamp).expect("stamp"),
            sampling: SamplingMode::UpTheRamp,
            headers,
            kind: ExposureKind::Exposure,
            naming,
        }
    }

    async fn wait_idle(handle: &CorrelatorHandle) {
        for _ in 0..200 {
            if handle.is_idle() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn cds_ramp_is_annotated_renamed_and_reclaimed() -> Result<()> {
        let root = unique_test_root("cds");
        let output = root.join("out");
        let source = ramp(&root, "20240101120005", 6).await?;

        let mut settings = CorrelatorSettings::new(&root, &output);
        settings.read_up_ramp_as_cds = true;
        let correlator = DataCorrelator::new(settings, Arc::new(JsonSidecarWriter));

        let mut namer = FrameNamer::new(&output, "i");
        let started = parse_directory_name("20240101120002").expect("stamp");
        namer.next_multrun(started);
        let name = namer.next_run(ExposureKind::Exposure, started);

        let done = correlator
            .process(record("20240101120002", Some(name.clone())))
            .await?;
        assert_eq!(done.source, source);
        assert_eq!(done.frames.len(), 4);
        assert_eq!(done.frames[3], name.path(4));
        assert_eq!(fs::read(&done.frames[2]).await?, vec![5u8]);
        let sidecar = fs::read_to_string(JsonSidecarWriter::sidecar_path(&done.frames[0])).await?;
        assert!(sidecar.contains("OBJECT"));
        assert!(fs::metadata(&source).await.is_err());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn flip_without_flipper_fails_and_with_one_succeeds() -> Result<()> {
        struct CountingFlipper(AtomicUsize);

        #[async_trait]
        impl ImageFlipper for CountingFlipper {
            async fn flip(&self, _frame: &Path, flip_x: bool, flip_y: bool) -> ControlResult<()> {
                assert!(flip_x && !flip_y);
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let root = unique_test_root("flip");
        ramp(&root, "20240101120005", 2).await?;
        let mut settings = CorrelatorSettings::new(&root, root.join("out"));
        settings.flip_x = true;
        settings.annotate = false;

        let bare = DataCorrelator::new(settings.clone(), Arc::new(JsonSidecarWriter));
        let err = bare
            .process(record("20240101120001", None))
            .await
            .expect_err("no flipper");
        assert!(err.to_string().contains("flipper"));

        let flipper = Arc::new(CountingFlipper(AtomicUsize::new(0)));
        let done = DataCorrelator::new(settings, Arc::new(JsonSidecarWriter))
            .flipper(flipper.clone())
            .process(record("20240101120001", None))
            .await?;
        assert_eq!(flipper.0.load(Ordering::SeqCst), 2);
        assert!(done.frames[0].starts_with(root.join("out")));
        assert!(done.frames[0].ends_with("H2RG_R01_M01_N01.fits"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn worker_survives_a_failed_entry() -> Result<()> {
        let root = unique_test_root("worker");
        ramp(&root, "20240101120005", 2).await?;
        let correlator = DataCorrelator::new(
            CorrelatorSettings::new(&root, root.join("out")),
            Arc::new(JsonSidecarWriter),
        );
        let shutdown = CancellationToken::new();
        let handle = correlator.spawn(shutdown.clone());

        handle.enqueue(record("20240101130000", None))?;
        handle.enqueue(record("20240101120003", None))?;
        wait_idle(&handle).await;

        assert!(handle.is_idle());
        assert_eq!(handle.failed(), 1);
        assert_eq!(handle.processed(), 1);

        shutdown.cancel();
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
