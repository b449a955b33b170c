//! Safety monitor states.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    Init,
    NotRunning,
    Running,
    FailTemperature,
    FailComms,
    Stopped,
}

impl SafetyState {
    /// Every state except `Init` and `Running` ends the monitor's lifetime.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Init | Self::Running)
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::NotRunning => "NOT_RUNNING",
            Self::Running => "RUNNING",
            Self::FailTemperature => "FAIL_TEMP",
            Self::FailComms => "FAIL_COMMS",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}
