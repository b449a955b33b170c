//! Archive frame names.
//!
//! `<instrument>_<code>_<night>_<multrun>_<run>_<window>_0.fits`, where the
//! night is the UTC date of the preceding noon.

use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureKind {
    Exposure,
    Bias,
    Standard,
}

impl ExposureKind {
    pub fn code(self) -> char {
        match self {
            Self::Exposure => 'e',
            Self::Bias => 'b',
            Self::Standard => 's',
        }
    }
}

pub fn night_of(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::hours(12)).date_naive()
}

/// A snapshot of the naming counters for one exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub directory: PathBuf,
    pub instrument: String,
    pub kind: ExposureKind,
    pub night: NaiveDate,
    pub multrun: u32,
    pub run: u32,
}

impl FrameName {
    pub fn file_name(&self, window: u32) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_0.fits",
            self.instrument,
            self.kind.code(),
            self.night.format("%Y%m%d"),
            self.multrun,
            self.run,
            window
        )
    }

    pub fn path(&self, window: u32) -> PathBuf {
        self.directory.join(self.file_name(window))
    }
}

#[derive(Debug, Clone)]
pub struct FrameNamer {
    directory: PathBuf,
    instrument: String,
    night: Option<NaiveDate>,
    multrun: u32,
    run: u32,
}

impl FrameNamer {
    pub fn new(directory: impl Into<PathBuf>, instrument: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            instrument: instrument.into(),
            night: None,
            multrun: 0,
            run: 0,
        }
    }

    /// Start a new multrun; the count restarts each night.
    pub fn next_multrun(&mut self, now: DateTime<Utc>) -> u32 {
        let night = night_of(now);
        if self.night != Some(night) {
            self.night = Some(night);
            self.multrun = 0;
        }
        self.multrun += 1;
        self.run = 0;
        self.multrun
    }

    pub fn next_run(&mut self, kind: ExposureKind, now: DateTime<Utc>) -> FrameName {
        if self.night.is_none() || self.multrun == 0 {
            self.next_multrun(now);
        }
        self.run += 1;
        FrameName {
            directory: self.directory.clone(),
            instrument: self.instrument.clone(),
            kind,
            night: self.night.unwrap_or_else(|| night_of(now)),
            multrun: self.multrun,
            run: self.run,
        }
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }
}
