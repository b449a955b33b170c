use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use irctl_link::{ControllerSetup, DEFAULT_ORPHAN_GRACE};
use irctl_pipeline::CorrelatorSettings;
use irctl_protocol::{MuxType, SamplingMode};
use irctl_runtime::{RebootLevel, RebootPolicy, RuntimeConfig};
use irctl_safety::SafetySettings;
use tokio::time::Duration;

use crate::properties::Properties;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub address: String,
    /// A disabled peer answers every request with an immediate success.
    pub enabled: bool,
}

impl PeerEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            enabled: true,
        }
    }
}

/// Everything the kernel needs to wire an instrument together.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub listen: String,
    pub link_address: String,
    /// How long an abandoned controller command may still claim its reply.
    pub link_orphan_grace: Duration,
    pub telescope: PeerEndpoint,
    pub calibration: PeerEndpoint,
    pub reduction: PeerEndpoint,
    pub peer_connect_timeout: Duration,
    pub runtime: RuntimeConfig,
    pub correlator: CorrelatorSettings,
    pub safety: SafetySettings,
    /// Source for the default temperature sensor. Without one (and without a
    /// sensor handed to the builder) no safety monitor runs.
    pub temperature_file: Option<PathBuf>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8472".to_owned(),
            link_address: "127.0.0.1:5000".to_owned(),
            link_orphan_grace: DEFAULT_ORPHAN_GRACE,
            telescope: PeerEndpoint::new("127.0.0.1:7383"),
            calibration: PeerEndpoint::new("127.0.0.1:6683"),
            reduction: PeerEndpoint::new("127.0.0.1:6880"),
            peer_connect_timeout: Duration::from_secs(10),
            runtime: RuntimeConfig::default(),
            correlator: CorrelatorSettings::new("data", "frames"),
            safety: SafetySettings::default(),
            temperature_file: None,
        }
    }
}

impl InstrumentConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let properties = Properties::load(path).await?;
        Self::from_properties(&properties)
    }

    /// Missing keys keep their defaults, except `irctl.config.fs_mode`: when
    /// absent no sampling mode is configured and `config` commands fail.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();

        let listen = endpoint(props, "irctl.net.server", &defaults.listen)?;
        let link_address = endpoint(props, "irctl.link", &defaults.link_address)?;
        let link_orphan_grace =
            millis(props, "irctl.link.orphan_grace", defaults.link_orphan_grace)?;
        let telescope = PeerEndpoint::new(endpoint(
            props,
            "irctl.net.telescope",
            &defaults.telescope.address,
        )?);
        let calibration = PeerEndpoint {
            address: endpoint(props, "irctl.net.calibration", &defaults.calibration.address)?,
            enabled: props.get_bool_or("irctl.net.calibration.use", true)?,
        };
        let reduction = PeerEndpoint::new(endpoint(
            props,
            "irctl.net.reduction",
            &defaults.reduction.address,
        )?);
        let peer_connect_timeout = millis(
            props,
            "irctl.net.connect_timeout",
            defaults.peer_connect_timeout,
        )?;

        Ok(Self {
            listen,
            link_address,
            link_orphan_grace,
            telescope,
            calibration,
            reduction,
            peer_connect_timeout,
            runtime: runtime_config(props, defaults.runtime)?,
            correlator: correlator_settings(props, defaults.correlator)?,
            safety: safety_settings(props, defaults.safety)?,
            temperature_file: props
                .contains("irctl.safety.temperature_file")
                .then(|| props.get_str_or("irctl.safety.temperature_file", "").into()),
        })
    }
}

fn runtime_config(props: &Properties, mut config: RuntimeConfig) -> Result<RuntimeConfig> {
    config.instrument = props
        .get_char_or("irctl.file.fits.instrument_code", 'i')?
        .to_string();

    config.acks.default_ms = as_u64(
        props,
        "irctl.server_connection.default_acknowledge_time",
        config.acks.default_ms,
    )?;
    config.acks.min_ms = as_u64(
        props,
        "irctl.server_connection.min_acknowledge_time",
        config.acks.min_ms,
    )?;
    config.acks.config_ms = as_u64(props, "irctl.config.acknowledge_time", config.acks.config_ms)?;

    config.configured_sampling = match props.get_str_or("irctl.config.fs_mode", "") {
        "" => None,
        mode if mode.eq_ignore_ascii_case("UP_THE_RAMP") => Some(SamplingMode::UpTheRamp),
        mode if mode.eq_ignore_ascii_case("FOWLER") => Some(SamplingMode::Fowler),
        other => bail!("property irctl.config.fs_mode: unknown sampling mode {other:?}"),
    };

    let fowler = &mut config.fowler;
    fowler.n_reset = as_u32(props, "irctl.config.FOWLER.nreset", fowler.n_reset)?;
    fowler.n_read = as_u32(props, "irctl.config.FOWLER.nread", fowler.n_read)?;
    fowler.reset_execution_ms = as_u64(
        props,
        "irctl.config.FOWLER.reset_execution_time",
        fowler.reset_execution_ms,
    )?;
    fowler.read_execution_ms = as_u64(
        props,
        "irctl.config.FOWLER.read_execution_time",
        fowler.read_execution_ms,
    )?;

    let ramp = &mut config.ramp;
    ramp.n_reset = as_u32(props, "irctl.config.UP_THE_RAMP.nreset", ramp.n_reset)?;
    ramp.n_read = as_u32(props, "irctl.config.UP_THE_RAMP.nread", ramp.n_read)?;
    ramp.n_drop = as_u32(props, "irctl.config.UP_THE_RAMP.ndrop", ramp.n_drop)?;
    ramp.reset_execution_ms = as_u64(
        props,
        "irctl.config.UP_THE_RAMP.reset_execution_time",
        ramp.reset_execution_ms,
    )?;
    ramp.group_execution_ms = as_u64(
        props,
        "irctl.config.UP_THE_RAMP.group_execution_time",
        ramp.group_execution_ms,
    )?;

    config.rename_frames = props.get_bool_or("irctl.file.fits.rename", config.rename_frames)?;
    config.focus_offset_mm = props.get_f64_or("irctl.focus.offset", config.focus_offset_mm)?;
    if props.contains("irctl.mirror_fold_position") {
        config.fold_position = Some(props.get_str("irctl.mirror_fold_position")?.to_owned());
    }
    config.drain_poll = millis(props, "irctl.pipeline.drain_poll", config.drain_poll)?;

    if props.get_bool_or("irctl.multrun.offset.enable", false)? {
        let count = as_u32(props, "irctl.multrun.offset.count", 0)?;
        config.multrun_offsets = (0..count)
            .map(|n| {
                Ok((
                    props.get_f64(&format!("irctl.multrun.offset.{n}.ra"))?,
                    props.get_f64(&format!("irctl.multrun.offset.{n}.dec"))?,
                ))
            })
            .collect::<Result<_>>()?;
    }

    config.controller = controller_setup(props, config.controller)?;
    for level in RebootLevel::ALL {
        let name = level.name().to_ascii_uppercase();
        let defaults = RebootPolicy::default();
        let policy = RebootPolicy {
            enabled: props.get_bool_or(&format!("irctl.reboot.enable.{name}"), defaults.enabled)?,
            acknowledge_ms: as_u64(
                props,
                &format!("irctl.reboot.acknowledge_time.{name}"),
                defaults.acknowledge_ms,
            )?,
        };
        config.reboot = config.reboot.set(level, policy);
    }
    Ok(config)
}

fn controller_setup(props: &Properties, mut setup: ControllerSetup) -> Result<ControllerSetup> {
    setup.enabled = props.get_bool_or("irctl.controller.startup.enable", setup.enabled)?;
    setup.initialize_level = as_u8(props, "irctl.controller.initialize.level", setup.initialize_level)?;
    if props.contains("irctl.controller.mux_type") {
        setup.mux = MuxType::parse(props.get_str("irctl.controller.mux_type")?)
            .context("property irctl.controller.mux_type")?;
    }
    setup.n_outputs = as_u32(props, "irctl.controller.num_outputs", setup.n_outputs)?;
    setup.gain = as_u8(props, "irctl.controller.gain", setup.gain)?;
    Ok(setup)
}

fn correlator_settings(
    props: &Properties,
    defaults: CorrelatorSettings,
) -> Result<CorrelatorSettings> {
    let mut settings = if props.contains("irctl.data.directory.root") {
        CorrelatorSettings::new(
            props.get_str("irctl.data.directory.root")?,
            defaults.output_directory,
        )
    } else {
        defaults
    };
    if props.contains("irctl.data.directory.up_the_ramp") {
        settings.up_the_ramp_root = props.get_str("irctl.data.directory.up_the_ramp")?.into();
    }
    if props.contains("irctl.data.directory.fowler") {
        settings.fowler_root = props.get_str("irctl.data.directory.fowler")?.into();
    }
    if props.contains("irctl.file.fits.directory") {
        settings.output_directory = props.get_str("irctl.file.fits.directory")?.into();
    }
    settings.extension = props
        .get_str_or("irctl.file.fits.extension", &settings.extension)
        .to_owned();
    settings.annotate = props.get_bool_or("irctl.file.fits.annotate", settings.annotate)?;
    settings.flip_x = props.get_bool_or("irctl.file.fits.flip.x", settings.flip_x)?;
    settings.flip_y = props.get_bool_or("irctl.file.fits.flip.y", settings.flip_y)?;
    settings.read_up_ramp_as_cds = props.get_bool_or(
        "irctl.file.fits.rename.read_up_ramp_as_cds",
        settings.read_up_ramp_as_cds,
    )?;
    Ok(settings)
}

fn safety_settings(props: &Properties, mut settings: SafetySettings) -> Result<SafetySettings> {
    settings.enabled = props.get_bool_or("irctl.safety.enable", settings.enabled)?;
    settings.temperature_control_enabled = props.get_bool_or(
        "irctl.safety.temperature_control.enable",
        settings.temperature_control_enabled,
    )?;
    settings.interval = millis(props, "irctl.safety.interval", settings.interval)?;
    settings.fail_temperature =
        props.get_f64_or("irctl.safety.fail_temperature", settings.fail_temperature)?;
    settings.fail_on_comms_fault = props.get_bool_or(
        "irctl.safety.fail_on_comms_fault",
        settings.fail_on_comms_fault,
    )?;
    Ok(settings)
}

/// `<prefix>.address` and `<prefix>.port_number`, each falling back to the
/// matching half of `default`.
fn endpoint(props: &Properties, prefix: &str, default: &str) -> Result<String> {
    let (default_host, default_port) = default.rsplit_once(':').unwrap_or((default, "0"));
    let host = props.get_str_or(&format!("{prefix}.address"), default_host);
    let port_key = format!("{prefix}.port_number");
    let port = if props.contains(&port_key) {
        u16::try_from(props.get_i64(&port_key)?)
            .with_context(|| format!("property {port_key}: not a port number"))?
    } else {
        default_port
            .parse()
            .with_context(|| format!("default endpoint {default} has no port"))?
    };
    Ok(format!("{host}:{port}"))
}

fn as_u64(props: &Properties, key: &str, default: u64) -> Result<u64> {
    if !props.contains(key) {
        return Ok(default);
    }
    u64::try_from(props.get_i64(key)?).with_context(|| format!("property {key}: must not be negative"))
}

fn as_u32(props: &Properties, key: &str, default: u32) -> Result<u32> {
    if !props.contains(key) {
        return Ok(default);
    }
    u32::try_from(props.get_i64(key)?).with_context(|| format!("property {key}: out of range"))
}

fn as_u8(props: &Properties, key: &str, default: u8) -> Result<u8> {
    if !props.contains(key) {
        return Ok(default);
    }
    u8::try_from(props.get_i64(key)?).with_context(|| format!("property {key}: out of range"))
}

fn millis(props: &Properties, key: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    as_u64(props, key, default_ms).map(Duration::from_millis)
}
