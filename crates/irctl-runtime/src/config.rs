use std::collections::HashMap;
use std::fmt;

use irctl_link::ControllerSetup;
use irctl_protocol::SamplingMode;
use serde::Deserialize;
use tokio::time::Duration;

/// Acknowledgement times sent to clients, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPolicy {
    /// Added to every estimate and used by commands without their own policy.
    pub default_ms: u64,
    /// Used by the generic interrupt command.
    pub min_ms: u64,
    pub config_ms: u64,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            default_ms: 60_000,
            min_ms: 20_000,
            config_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FowlerSettings {
    pub n_reset: u32,
    pub n_read: u32,
    pub reset_execution_ms: u64,
    pub read_execution_ms: u64,
}

impl Default for FowlerSettings {
    fn default() -> Self {
        Self {
            n_reset: 1,
            n_read: 4,
            reset_execution_ms: 1_500,
            read_execution_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampSettings {
    pub n_reset: u32,
    pub n_read: u32,
    pub n_drop: u32,
    pub reset_execution_ms: u64,
    pub group_execution_ms: u64,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            n_reset: 1,
            n_read: 1,
            n_drop: 0,
            reset_execution_ms: 1_500,
            group_execution_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootLevel {
    /// Power the controller down and bring it back up.
    Redatum,
    /// Restart the daemon.
    Software,
    Hardware,
    PowerOff,
}

impl RebootLevel {
    pub const ALL: [Self; 4] = [Self::Redatum, Self::Software, Self::Hardware, Self::PowerOff];

    pub fn name(self) -> &'static str {
        match self {
            Self::Redatum => "redatum",
            Self::Software => "software",
            Self::Hardware => "hardware",
            Self::PowerOff => "power_off",
        }
    }
}

impl fmt::Display for RebootLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootPolicy {
    /// A disabled level is acknowledged and reported done without acting.
    pub enabled: bool,
    pub acknowledge_ms: u64,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            acknowledge_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootSettings {
    policies: HashMap<RebootLevel, RebootPolicy>,
}

impl RebootSettings {
    pub fn set(mut self, level: RebootLevel, policy: RebootPolicy) -> Self {
        self.policies.insert(level, policy);
        self
    }

    pub fn policy(&self, level: RebootLevel) -> RebootPolicy {
        self.policies.get(&level).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub instrument: String,
    pub acks: AckPolicy,
    /// Sampling mode applied by `config`; `None` makes `config` fail.
    pub configured_sampling: Option<SamplingMode>,
    pub fowler: FowlerSettings,
    pub ramp: RampSettings,
    pub rename_frames: bool,
    pub focus_offset_mm: f64,
    pub fold_position: Option<String>,
    /// Telescope offsets cycled through a multrun, arcseconds.
    pub multrun_offsets: Vec<(f64, f64)>,
    pub drain_poll: Duration,
    pub controller: ControllerSetup,
    pub reboot: RebootSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instrument: "i".to_owned(),
            acks: AckPolicy::default(),
            configured_sampling: Some(SamplingMode::UpTheRamp),
            fowler: FowlerSettings::default(),
            ramp: RampSettings::default(),
            rename_frames: true,
            focus_offset_mm: 0.0,
            fold_position: None,
            multrun_offsets: Vec::new(),
            drain_poll: Duration::from_secs(1),
            controller: ControllerSetup::default(),
            reboot: RebootSettings::default(),
        }
    }
}
