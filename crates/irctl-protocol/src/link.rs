//! Detector controller link wire format.
//!
//! Requests are one line each: an opcode optionally followed by a
//! parenthesised, comma separated parameter list. Replies are either
//! `<code>:<message>` or, for `GETCONFIG`, a run of `keyword=value` tokens.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ControlError, ControlResult};

/// Exact reply lines that identify the command they answer.
pub const REPLY_SIGNATURES: &[(&str, &str)] = &[
    ("0:Ramp acquisition succeeded", "ACQUIRERAMP"),
    ("0:The system is idle", "PING"),
    ("-1:Exposure is in progress", "PING"),
];

/// Reply prefixes that identify a multi-field reply.
pub const REPLY_PREFIXES: &[(&str, &str)] = &[("nResets=", "GETCONFIG")];

/// Reply code returned by `PING` while a ramp is being acquired.
pub const EXPOSURE_IN_PROGRESS: i32 = -1;

pub fn exact_reply_opcode(line: &str) -> Option<&'static str> {
    REPLY_SIGNATURES
        .iter()
        .find(|(reply, _)| *reply == line)
        .map(|(_, opcode)| *opcode)
}

pub fn prefix_reply_opcode(line: &str) -> Option<&'static str> {
    REPLY_PREFIXES
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .map(|(_, opcode)| *opcode)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    UpTheRamp,
    Fowler,
}

impl SamplingMode {
    pub fn wire_value(self) -> i64 {
        match self {
            Self::UpTheRamp => 0,
            Self::Fowler => 1,
        }
    }

    pub fn from_wire(value: i64) -> ControlResult<Self> {
        match value {
            0 => Ok(Self::UpTheRamp),
            1 => Ok(Self::Fowler),
            other => Err(ControlError::LinkProtocol(format!(
                "unknown sampling mode {other}"
            ))),
        }
    }

    pub fn parse(name: &str) -> ControlResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "UP_THE_RAMP" | "UPTHERAMP" => Ok(Self::UpTheRamp),
            "FOWLER" => Ok(Self::Fowler),
            other => Err(ControlError::MalformedCommand(format!(
                "unknown sampling mode {other}"
            ))),
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpTheRamp => f.write_str("up_the_ramp"),
            Self::Fowler => f.write_str("fowler"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxType {
    H1rg,
    H2rg,
    H4rg,
}

impl MuxType {
    /// Multiplexer names as configured: `H1RG`, `H2RG` or `H4RG`.
    pub fn parse(name: &str) -> ControlResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "H1RG" => Ok(Self::H1rg),
            "H2RG" => Ok(Self::H2rg),
            "H4RG" => Ok(Self::H4rg),
            other => Err(ControlError::MalformedCommand(format!(
                "unknown multiplexer type {other}"
            ))),
        }
    }

    fn wire_value(self) -> u8 {
        match self {
            Self::H1rg => 1,
            Self::H2rg => 2,
            Self::H4rg => 4,
        }
    }
}

/// Scheduling class of a pending low-level command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Long-running; at most one outstanding on the link.
    Normal,
    /// May be answered ahead of an outstanding normal-class command.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyForm {
    Standard,
    ConfigDump,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Ping,
    AcquireRamp,
    StopAcquisition,
    GetConfig,
    Initialize {
        level: u8,
    },
    PowerDownAsic,
    SetFsMode(SamplingMode),
    SetFsParam {
        n_reset: u32,
        n_read: u32,
        n_group: u32,
        exposure_secs: f64,
        n_ramps: u32,
    },
    SetRampParam {
        n_reset: u32,
        n_read: u32,
        n_group: u32,
        n_drop: u32,
        n_ramps: u32,
    },
    SetGain(u8),
    SetDetector {
        mux: MuxType,
        n_outputs: u32,
    },
}

impl LinkCommand {
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::AcquireRamp => "ACQUIRERAMP",
            Self::StopAcquisition => "STOPACQUISITION",
            Self::GetConfig => "GETCONFIG",
            Self::Initialize { .. } => "INITIALIZE",
            Self::PowerDownAsic => "POWERDOWNASIC",
            Self::SetFsMode(_) => "SETFSMODE",
            Self::SetFsParam { .. } => "SETFSPARAM",
            Self::SetRampParam { .. } => "SETRAMPPARAM",
            Self::SetGain(_) => "SetGain",
            Self::SetDetector { .. } => "SETDETECTOR",
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Self::Ping | Self::StopAcquisition | Self::PowerDownAsic => CommandClass::Interrupt,
            _ => CommandClass::Normal,
        }
    }

    pub fn reply_form(&self) -> ReplyForm {
        match self {
            Self::GetConfig => ReplyForm::ConfigDump,
            _ => ReplyForm::Standard,
        }
    }

    /// Reject parameter values the controller does not accept.
    pub fn validate(&self) -> ControlResult<()> {
        match self {
            Self::Initialize { level } if !(1..=3).contains(level) => Err(
                ControlError::LinkRejected(format!("INITIALIZE level {level} not in 1..=3")),
            ),
            Self::SetGain(gain) if *gain > 15 => Err(ControlError::LinkRejected(format!(
                "gain {gain} not in 0..=15"
            ))),
            Self::SetFsParam {
                exposure_secs,
                n_group,
                ..
            } if *exposure_secs < 0.0 || *n_group < 1 => Err(ControlError::LinkRejected(
                format!("SETFSPARAM exposure {exposure_secs} s with {n_group} groups"),
            )),
            Self::SetRampParam { n_group, .. } if *n_group < 1 => Err(
                ControlError::LinkRejected("SETRAMPPARAM needs at least one group".to_owned()),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Initialize { level } => format!("INITIALIZE{level}"),
            Self::SetFsMode(mode) => format!("SETFSMODE({})", mode.wire_value()),
            Self::SetFsParam {
                n_reset,
                n_read,
                n_group,
                exposure_secs,
                n_ramps,
            } => format!(
                "SETFSPARAM({n_reset}, {n_read}, {n_group}, {}, {n_ramps})",
                format_seconds(*exposure_secs)
            ),
            Self::SetRampParam {
                n_reset,
                n_read,
                n_group,
                n_drop,
                n_ramps,
            } => format!("SETRAMPPARAM({n_reset}, {n_read}, {n_group}, {n_drop}, {n_ramps})"),
            Self::SetGain(gain) => format!("SetGain({gain})"),
            Self::SetDetector { mux, n_outputs } => {
                format!("SETDETECTOR({},{n_outputs})", mux.wire_value())
            }
            other => other.opcode().to_owned(),
        }
    }
}

impl fmt::Display for LinkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Between one and three decimal places.
fn format_seconds(seconds: f64) -> String {
    let rendered = format!("{seconds:.3}");
    let trimmed = rendered.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{trimmed}0")
    } else {
        trimmed.to_owned()
    }
}

/// A request line split into opcode and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub opcode: String,
    pub params: Vec<String>,
}

impl RequestLine {
    pub fn parse(line: &str) -> ControlResult<Self> {
        let line = line.trim();
        let Some(open) = line.find('(') else {
            if line.is_empty() {
                return Err(ControlError::LinkProtocol("empty request".to_owned()));
            }
            return Ok(Self {
                opcode: line.to_owned(),
                params: Vec::new(),
            });
        };
        let Some(body) = line[open + 1..].strip_suffix(')') else {
            return Err(ControlError::LinkProtocol(format!(
                "unterminated parameter list: {line}"
            )));
        };
        let params = if body.trim().is_empty() {
            Vec::new()
        } else {
            body.split(',').map(|p| p.trim().to_owned()).collect()
        };
        Ok(Self {
            opcode: line[..open].trim().to_owned(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardReply {
    pub code: i32,
    pub message: String,
}

impl StandardReply {
    fn parse(line: &str, colon: usize) -> ControlResult<Self> {
        let code = line[..colon].trim().parse::<i32>().map_err(|_| {
            ControlError::LinkProtocol(format!("bad error code in reply '{line}'"))
        })?;
        Ok(Self {
            code,
            message: line[colon + 1..].to_owned(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDump {
    values: IndexMap<String, String>,
}

impl ConfigDump {
    fn parse(line: &str) -> ControlResult<Self> {
        let mut values = IndexMap::new();
        let bytes = line.as_bytes();
        let is_keyword = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
        let mut cursor = 0;
        while let Some(found) = line[cursor..].find('=') {
            let eq = cursor + found;
            let mut start = eq;
            while start > cursor && is_keyword(bytes[start - 1]) {
                start -= 1;
            }
            let mut end = eq + 1;
            if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
                end += 1;
            }
            if end < bytes.len() && bytes[end].is_ascii_lowercase() {
                end += 1;
            }
            while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
                end += 1;
            }
            let keyword = &line[start..eq];
            let value = &line[eq + 1..end];
            if value.is_empty() {
                return Err(ControlError::LinkProtocol(format!(
                    "keyword '{keyword}' has no value in '{line}'"
                )));
            }
            if !keyword.is_empty() {
                values.insert(keyword.to_owned(), value.to_owned());
            }
            cursor = end;
        }
        if values.is_empty() {
            return Err(ControlError::LinkProtocol(format!(
                "no keyword=value pairs in '{line}'"
            )));
        }
        Ok(Self { values })
    }

    pub fn value(&self, keyword: &str) -> ControlResult<&str> {
        self.values
            .get(keyword)
            .map(String::as_str)
            .ok_or_else(|| ControlError::LinkProtocol(format!("keyword {keyword} not in reply")))
    }

    pub fn value_i64(&self, keyword: &str) -> ControlResult<i64> {
        let raw = self.value(keyword)?;
        raw.parse()
            .map_err(|_| ControlError::LinkProtocol(format!("{keyword}={raw} is not an integer")))
    }

    pub fn value_f64(&self, keyword: &str) -> ControlResult<f64> {
        let raw = self.value(keyword)?;
        raw.parse()
            .map_err(|_| ControlError::LinkProtocol(format!("{keyword}={raw} is not a number")))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkReply {
    Standard(StandardReply),
    Config(ConfigDump),
}

impl LinkReply {
    pub fn parse(form: ReplyForm, line: &str) -> ControlResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match (line.find(':'), form) {
            (Some(colon), _) => StandardReply::parse(line, colon).map(Self::Standard),
            (None, ReplyForm::ConfigDump) => ConfigDump::parse(line).map(Self::Config),
            (None, ReplyForm::Standard) => Err(ControlError::LinkProtocol(format!(
                "no colon in reply '{line}'"
            ))),
        }
    }

    /// Error code of the reply; a configuration dump implies success.
    pub fn code(&self) -> i32 {
        match self {
            Self::Standard(reply) => reply.code,
            Self::Config(_) => 0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Standard(reply) => &reply.message,
            Self::Config(_) => "",
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 0
    }

    pub fn config(&self) -> ControlResult<&ConfigDump> {
        match self {
            Self::Config(dump) => Ok(dump),
            Self::Standard(reply) => Err(ControlError::LinkProtocol(format!(
                "expected configuration dump, got {}:{}",
                reply.code, reply.message
            ))),
        }
    }
}
