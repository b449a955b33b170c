//! Detector temperature watchdog.
//!
//! Runs independently of client sessions. When the protected temperature
//! rises above the failure threshold (or cannot be read, if configured so)
//! it powers the detector electronics down itself and stops. Every state
//! other than `Running` is final; a new monitor is needed to resume.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use irctl_protocol::{
    ControlError, ControlResult, PowerControl, SafetyState, TemperatureSensor,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SafetySettings {
    pub enabled: bool,
    /// The temperature subsystem itself; the monitor cannot run without it.
    pub temperature_control_enabled: bool,
    pub interval: Duration,
    /// Kelvin.
    pub fail_temperature: f64,
    pub fail_on_comms_fault: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            temperature_control_enabled: true,
            interval: Duration::from_secs(60),
            fail_temperature: 173.0,
            fail_on_comms_fault: false,
        }
    }
}

struct MonitorInner {
    settings: SafetySettings,
    sensor: Arc<dyn TemperatureSensor>,
    power: Arc<dyn PowerControl>,
    state: watch::Sender<SafetyState>,
    stop: CancellationToken,
}

#[derive(Clone)]
pub struct SafetyMonitor {
    inner: Arc<MonitorInner>,
}

impl SafetyMonitor {
    pub fn new(
        settings: SafetySettings,
        sensor: Arc<dyn TemperatureSensor>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        let (state, _) = watch::channel(SafetyState::Init);
        Self {
            inner: Arc::new(MonitorInner {
                settings,
                sensor,
                power,
                state,
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> SafetyState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SafetyState> {
        self.inner.state.subscribe()
    }

    pub fn spawn(&self) -> JoinHandle<SafetyState> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    fn set_state(&self, state: SafetyState) {
        info!(state = %state, "safety monitor state");
        self.inner.state.send_replace(state);
    }

    #[instrument(skip(self), fields(threshold = self.inner.settings.fail_temperature))]
    pub async fn run(&self) -> SafetyState {
        let settings = &self.inner.settings;
        if !settings.enabled || !settings.temperature_control_enabled {
            self.set_state(SafetyState::NotRunning);
            return SafetyState::NotRunning;
        }

        self.set_state(SafetyState::Running);
        let outcome = loop {
            let reading = timeout(settings.interval, self.inner.sensor.read_kelvin())
                .await
                .unwrap_or_else(|_| Err(ControlError::Sensor("read timed out".to_owned())));
            match reading {
                Err(read_error) => {
                    warn!(error = %read_error, "temperature read failed");
                    if settings.fail_on_comms_fault && self.power_down().await {
                        break SafetyState::FailComms;
                    }
                }
                Ok(kelvin) => {
                    debug!(kelvin, "temperature read");
                    if kelvin > settings.fail_temperature {
                        warn!(kelvin, "temperature above failure threshold");
                        if self.power_down().await {
                            break SafetyState::FailTemperature;
                        }
                    }
                }
            }

            if self.inner.stop.is_cancelled() {
                break SafetyState::Stopped;
            }
            tokio::select! {
                _ = sleep(settings.interval) => {}
                _ = self.inner.stop.cancelled() => {}
            }
        };
        self.set_state(outcome);
        outcome
    }

    /// One attempt, bounded by the poll interval and abandoned on stop. A
    /// failed attempt is retried on the next tick.
    async fn power_down(&self) -> bool {
        let limit = self.inner.settings.interval;
        let attempt = tokio::select! {
            result = timeout(limit, self.inner.power.power_down()) => result,
            _ = self.inner.stop.cancelled() => {
                warn!("power down abandoned, monitor stopping");
                return false;
            }
        };
        match attempt {
            Ok(Ok(())) => {
                warn!("detector electronics powered down");
                true
            }
            Ok(Err(power_error)) => {
                error!(error = %power_error, "power down failed");
                false
            }
            Err(_) => {
                error!(?limit, "power down got no reply");
                false
            }
        }
    }

    /// Ask the loop to stop and wait until it has left `Running`.
    pub async fn stop(&self) -> SafetyState {
        self.inner.stop.cancel();
        let mut states = self.subscribe();
        loop {
            let state = *states.borrow_and_update();
            if state != SafetyState::Running {
                return state;
            }
            // Re-check periodically in case the change notification is missed.
            let _ = timeout(Duration::from_secs(10), states.changed()).await;
        }
    }
}

/// Reads a temperature in Kelvin from the first token of a text file, as
/// published by the cryostat temperature controller's logger.
#[derive(Debug, Clone)]
pub struct FileTemperatureSensor {
    path: PathBuf,
}

impl FileTemperatureSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TemperatureSensor for FileTemperatureSensor {
    async fn read_kelvin(&self) -> ControlResult<f64> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ControlError::Sensor(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let token = text.split_whitespace().next().unwrap_or_default();
        token.parse().map_err(|_| {
            ControlError::Sensor(format!(
                "{} does not hold a temperature: '{token}'",
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSensor(Option<f64>);

    #[async_trait]
    impl TemperatureSensor for FixedSensor {
        async fn read_kelvin(&self) -> ControlResult<f64> {
            self.0
                .ok_or_else(|| ControlError::Sensor("sensor offline".to_owned()))
        }
    }

    struct CountingPower {
        calls: AtomicUsize,
        works: bool,
    }

    impl CountingPower {
        fn new(works: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                works,
            })
        }
    }

    #[async_trait]
    impl PowerControl for CountingPower {
        async fn power_down(&self) -> ControlResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.works {
                Ok(())
            } else {
                Err(ControlError::LinkDown)
            }
        }
    }

    fn fast() -> SafetySettings {
        SafetySettings {
            interval: Duration::from_millis(10),
            ..SafetySettings::default()
        }
    }

    #[tokio::test]
    async fn over_temperature_powers_down_once() -> Result<()> {
        let power = CountingPower::new(true);
        let monitor = SafetyMonitor::new(fast(), Arc::new(FixedSensor(Some(174.0))), power.clone());
        let mut states = monitor.subscribe();

        let end = timeout(Duration::from_secs(2), monitor.spawn()).await??;
        assert_eq!(end, SafetyState::FailTemperature);
        assert_eq!(monitor.state(), SafetyState::FailTemperature);
        assert_eq!(power.calls.load(Ordering::SeqCst), 1);
        assert!(states.has_changed()?);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_monitor_never_runs() -> Result<()> {
        let power = CountingPower::new(true);
        let settings = SafetySettings {
            temperature_control_enabled: false,
            ..fast()
        };
        let monitor = SafetyMonitor::new(settings, Arc::new(FixedSensor(Some(300.0))), power.clone());
        assert_eq!(monitor.run().await, SafetyState::NotRunning);
        assert_eq!(power.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn comms_fault_is_fatal_only_when_configured() -> Result<()> {
        let power = CountingPower::new(true);
        let settings = SafetySettings {
            fail_on_comms_fault: true,
            ..fast()
        };
        let monitor = SafetyMonitor::new(settings, Arc::new(FixedSensor(None)), power.clone());
        assert_eq!(monitor.run().await, SafetyState::FailComms);
        assert_eq!(power.calls.load(Ordering::SeqCst), 1);

        let tolerant = SafetyMonitor::new(fast(), Arc::new(FixedSensor(None)), power.clone());
        let task = tolerant.spawn();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(tolerant.state(), SafetyState::Running);
        assert_eq!(tolerant.stop().await, SafetyState::Stopped);
        assert_eq!(task.await?, SafetyState::Stopped);
        assert_eq!(power.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_power_down_keeps_monitoring() -> Result<()> {
        let power = CountingPower::new(false);
        let monitor = SafetyMonitor::new(fast(), Arc::new(FixedSensor(Some(200.0))), power.clone());
        let task = monitor.spawn();
        sleep(Duration::from_millis(60)).await;

        assert_eq!(monitor.state(), SafetyState::Running);
        assert!(power.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(monitor.stop().await, SafetyState::Stopped);
        task.await?;
        Ok(())
    }

    struct SilentPower {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PowerControl for SilentPower {
        async fn power_down(&self) -> ControlResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn unanswered_power_down_is_retried() -> Result<()> {
        let power = Arc::new(SilentPower {
            calls: AtomicUsize::new(0),
        });
        let monitor = SafetyMonitor::new(fast(), Arc::new(FixedSensor(Some(174.0))), power.clone());
        let task = monitor.spawn();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(monitor.state(), SafetyState::Running);
        assert!(power.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(timeout(Duration::from_secs(2), monitor.stop()).await?, SafetyState::Stopped);
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn stop_abandons_a_stuck_power_down() -> Result<()> {
        let power = Arc::new(SilentPower {
            calls: AtomicUsize::new(0),
        });
        let settings = SafetySettings {
            interval: Duration::from_secs(60),
            ..SafetySettings::default()
        };
        let monitor = SafetyMonitor::new(settings, Arc::new(FixedSensor(Some(174.0))), power.clone());
        let task = monitor.spawn();
        while power.calls.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(timeout(Duration::from_secs(2), monitor.stop()).await?, SafetyState::Stopped);
        assert_eq!(timeout(Duration::from_secs(2), task).await??, SafetyState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn file_sensor_parses_first_token() -> Result<()> {
        let path = std::env::temp_dir().join(format!(
            "irctl-safety-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_nanos()
        ));
        tokio::fs::write(&path, "77.25 K\n").await?;
        let sensor = FileTemperatureSensor::new(&path);
        assert_eq!(sensor.read_kelvin().await?, 77.25);

        tokio::fs::write(&path, "n/a\n").await?;
        assert!(matches!(sensor.read_kelvin().await, Err(ControlError::Sensor(_))));
        let _ = tokio::fs::remove_file(&path).await;
        let missing = sensor.read_kelvin().await.err().map(|e| e.code());
        assert_eq!(missing, Some(ControlError::Sensor(String::new()).code()));
        Ok(())
    }
}
