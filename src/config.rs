use serde::Deserialize;
use std::{
    fmt, fs,
    path::Path,
    str::FromStr,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Fixed polling period of the update cycle. Energy integration assumes
/// exactly this much time passes between cycles.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configured role `{0}` is not in the allowed list (grid, pvinverter)")]
    Role(String),
    #[error("access type `{0}` is not supported")]
    AccessType(String),
    #[error("line `{0}` is not one of L1, L2, L3")]
    Line(String),
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
    #[error("sign_of_life_minutes `{0}` is too large")]
    SignOfLife(u64),
}

/// Device class the virtual meter registers as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Grid,
    PvInverter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Grid => "grid",
            Role::PvInverter => "pvinverter",
        }
    }

    pub fn product_id(&self) -> u32 {
        match self {
            Role::PvInverter => 0xA144,
            Role::Grid => 45069,
        }
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grid" => Ok(Role::Grid),
            "pvinverter" => Ok(Role::PvInverter),
            other => Err(ConfigError::Role(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name under which the meter is announced, derived from role and instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub role: Role,
    pub device_instance: u32,
    pub service_name: String,
    pub product_id: u32,
}

impl ServiceIdentity {
    pub fn new(role: Role, device_instance: u32) -> Self {
        Self {
            role,
            device_instance,
            service_name: format!("com.victronenergy.{}.http_{:02}", role, device_instance),
            product_id: role.product_id(),
        }
    }
}

/// Which phase of the installation the meter channel is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    L1,
    L2,
    L3,
}

impl Line {
    pub fn as_str(&self) -> &'static str {
        match self {
            Line::L1 => "L1",
            Line::L2 => "L2",
            Line::L3 => "L3",
        }
    }
}

impl FromStr for Line {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1" => Ok(Line::L1),
            "L2" => Ok(Line::L2),
            "L3" => Ok(Line::L3),
            other => Err(ConfigError::Line(other.to_string())),
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    device: RawDevice,
    meter: RawMeter,
    #[serde(default)]
    auxiliary: RawAuxiliary,
    #[serde(default)]
    publish: PublishConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDevice {
    role: String,
    device_instance: u32,
    custom_name: String,
    #[serde(default)]
    position: u32,
    #[serde(default)]
    sign_of_life_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMeter {
    access_type: String,
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    emeter: usize,
    #[serde(default = "default_line")]
    line: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAuxiliary {
    #[serde(default)]
    bus_url: String,
    #[serde(default)]
    consider_inverter: bool,
    #[serde(default = "default_ev_charger_service")]
    ev_charger_service: String,
    ev_charger_path: Option<String>,
    #[serde(default = "default_inverter_service")]
    inverter_service: String,
    #[serde(default = "default_inverter_path")]
    inverter_path: String,
}

impl Default for RawAuxiliary {
    fn default() -> Self {
        Self {
            bus_url: String::new(),
            consider_inverter: false,
            ev_charger_service: default_ev_charger_service(),
            ev_charger_path: None,
            inverter_service: default_inverter_service(),
            inverter_path: default_inverter_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_line() -> String {
    "L1".into()
}
fn default_ev_charger_service() -> String {
    "com.victronenergy.evcharger.http_43".into()
}
fn default_inverter_service() -> String {
    "com.victronenergy.vebus.ttyUSB0".into()
}
fn default_inverter_path() -> String {
    "/Ac/ActiveIn/P".into()
}

/// Validated configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub device: DeviceConfig,
    pub meter: MeterConfig,
    pub auxiliary: AuxiliaryConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub role: Role,
    pub device_instance: u32,
    pub custom_name: String,
    pub position: u32,
    /// Period of the liveness report. `sign_of_life_minutes = 0` disables it.
    pub sign_of_life: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MeterConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub emeter: usize,
    pub line: Line,
}

impl MeterConfig {
    /// Status endpoint without credentials, those travel as basic auth.
    pub fn status_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/status")
        } else {
            format!("http://{host}/status")
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuxiliaryConfig {
    pub bus_url: String,
    pub consider_inverter: bool,
    pub ev_charger: BusSource,
    pub inverter: BusSource,
}

/// One value published by another device on the property bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSource {
    pub service: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishConfig {
    /// Modbus TCP listen address, e.g. `0.0.0.0:5502`. No server when unset.
    pub listen: Option<String>,
}

/// The timer is armed at `now + period`, so the period has to fit an `Instant`.
fn sign_of_life_period(minutes: u64) -> Result<Option<Duration>, ConfigError> {
    if minutes == 0 {
        return Ok(None);
    }
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .filter(|period| Instant::now().checked_add(*period).is_some())
        .map(Some)
        .ok_or(ConfigError::SignOfLife(minutes))
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(s)?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let role: Role = raw.device.role.parse()?;
        if raw.meter.access_type != "OnPremise" {
            return Err(ConfigError::AccessType(raw.meter.access_type));
        }
        if raw.meter.host.trim().is_empty() {
            return Err(ConfigError::Empty("meter.host"));
        }
        let line: Line = raw.meter.line.parse()?;

        let sign_of_life = sign_of_life_period(raw.device.sign_of_life_minutes)?;
        let ev_charger_path = raw
            .auxiliary
            .ev_charger_path
            .unwrap_or_else(|| format!("/Ac/{line}/Power"));

        Ok(Self {
            log_level: raw.log_level,
            device: DeviceConfig {
                role,
                device_instance: raw.device.device_instance,
                custom_name: raw.device.custom_name,
                position: raw.device.position,
                sign_of_life,
            },
            meter: MeterConfig {
                host: raw.meter.host,
                username: raw.meter.username,
                password: raw.meter.password,
                emeter: raw.meter.emeter,
                line,
            },
            auxiliary: AuxiliaryConfig {
                bus_url: raw.auxiliary.bus_url,
                consider_inverter: raw.auxiliary.consider_inverter,
                ev_charger: BusSource {
                    service: raw.auxiliary.ev_charger_service,
                    path: ev_charger_path,
                },
                inverter: BusSource {
                    service: raw.auxiliary.inverter_service,
                    path: raw.auxiliary.inverter_path,
                },
            },
            publish: raw.publish,
        })
    }

    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.device.role, self.device.device_instance)
    }

    /// Filter directive for the configured level. Accepts the Python style
    /// names (`WARNING`, `CRITICAL`) older config files use.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        }
    }
}
