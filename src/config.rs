use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::frame::MAX_FRAME_LEN;
use crate::lindy::OUTLETS;
use crate::schema::{DecodeError, PayloadSchema};

/// Default TCP port when an `ether` DUT's address has none.
pub const DEFAULT_TCP_PORT: u16 = 2154;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Format(#[from] DecodeError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    pub power_switch: SwitchConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub frame_formats: BTreeMap<u8, String>,
    #[serde(default)]
    pub duts: Vec<DutEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchKind {
    #[default]
    Lindy,
    DryRun,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchConfig {
    pub kind: SwitchKind,
    pub username: String,
    pub password: String,
    pub request_timeout_ms: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            kind: SwitchKind::Lindy,
            username: "snmp".into(),
            password: "1234".into(),
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    pub baudrate: u32,
    pub inactivity_timeout_s: f64,
    pub max_consecutive_crc_errors: u32,
    pub reboot_interval_s: f64,
    pub settle_window_s: f64,
    pub max_recovery_attempts: Option<u32>,
    pub max_buffer: usize,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            inactivity_timeout_s: 20.0,
            max_consecutive_crc_errors: 10,
            reboot_interval_s: 10.0,
            settle_window_s: 30.0,
            max_recovery_attempts: None,
            max_buffer: crate::reassembler::DEFAULT_MAX_BUFFER,
            poll_interval_ms: 10,
            read_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Serial tty, usually a USB-UART adapter.
    Usb,
    /// TCP socket.
    Ether,
}

/// One `duts:` entry as written in the file. Unset options fall back to `defaults:`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DutEntry {
    pub name: String,
    pub connection: ConnectionKind,
    pub tty: Option<String>,
    pub ip: Option<String>,
    pub baudrate: Option<u32>,
    pub power_switch_port: u8,
    #[serde(alias = "power_port_IP")]
    pub power_port_ip: String,
    pub inactivity_timeout_s: Option<f64>,
    pub max_consecutive_crc_errors: Option<u32>,
    pub reboot_interval_s: Option<f64>,
    pub settle_window_s: Option<f64>,
    pub max_recovery_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddr {
    Serial { path: String, baudrate: u32 },
    Tcp { addr: String },
}

impl std::fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddr::Serial { path, baudrate } => write!(f, "{}@{}", path, baudrate),
            TransportAddr::Tcp { addr } => write!(f, "tcp://{}", addr),
        }
    }
}

/// Fully resolved description of one DUT link, handed to its monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct DutConnection {
    pub name: String,
    pub transport: TransportAddr,
    pub power_switch_port: u8,
    pub power_switch_ip: String,
    pub inactivity_timeout: Duration,
    pub max_consecutive_crc_errors: u32,
    pub reboot_interval: Duration,
    pub settle_window: Duration,
    pub max_recovery_attempts: Option<u32>,
    pub max_buffer: usize,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let cfg: FleetConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let d = &self.defaults;
        if d.max_buffer < MAX_FRAME_LEN {
            return invalid(format!(
                "defaults.max_buffer must be at least {} bytes",
                MAX_FRAME_LEN
            ));
        }
        if d.poll_interval_ms == 0 || d.read_timeout_ms == 0 {
            return invalid("poll and read intervals must be non-zero".into());
        }

        let mut seen = HashSet::new();
        for dut in &self.duts {
            if dut.name.trim().is_empty() {
                return invalid("DUT with empty name".into());
            }
            if !seen.insert(dut.name.as_str()) {
                return invalid(format!("duplicate DUT name '{}'", dut.name));
            }
            if dut.power_switch_port == 0 || dut.power_switch_port > OUTLETS {
                return invalid(format!(
                    "{}: power_switch_port {} outside 1..={}",
                    dut.name, dut.power_switch_port, OUTLETS
                ));
            }
            match dut.connection {
                ConnectionKind::Usb if dut.tty.is_none() => {
                    return invalid(format!("{}: usb connection needs 'tty'", dut.name));
                }
                ConnectionKind::Ether if dut.ip.is_none() => {
                    return invalid(format!("{}: ether connection needs 'ip'", dut.name));
                }
                _ => {}
            }
            let inactivity = dut.inactivity_timeout_s.unwrap_or(d.inactivity_timeout_s);
            let threshold = dut
                .max_consecutive_crc_errors
                .unwrap_or(d.max_consecutive_crc_errors);
            if !(inactivity.is_finite() && inactivity > 0.0) || threshold == 0 {
                return invalid(format!(
                    "{}: inactivity timeout and crc threshold must be positive",
                    dut.name
                ));
            }
            for secs in [
                dut.reboot_interval_s.unwrap_or(d.reboot_interval_s),
                dut.settle_window_s.unwrap_or(d.settle_window_s),
            ] {
                if !secs.is_finite() || secs < 0.0 {
                    return invalid(format!("{}: negative or non-finite interval", dut.name));
                }
            }
        }
        self.schema()?;
        Ok(())
    }

    pub fn schema(&self) -> Result<PayloadSchema, ConfigError> {
        Ok(PayloadSchema::from_strings(
            self.frame_formats
                .iter()
                .map(|(id, fmt)| (*id, fmt.as_str())),
        )?)
    }

    pub fn dut_connections(&self) -> Vec<DutConnection> {
        self.duts.iter().map(|d| self.resolve(d)).collect()
    }

    pub fn find(&self, name: &str) -> Option<DutConnection> {
        self.duts
            .iter()
            .find(|d| d.name == name)
            .map(|d| self.resolve(d))
    }

    fn resolve(&self, dut: &DutEntry) -> DutConnection {
        let d = &self.defaults;
        let transport = match dut.connection {
            ConnectionKind::Usb => TransportAddr::Serial {
                path: dut.tty.clone().unwrap_or_default(),
                baudrate: dut.baudrate.unwrap_or(d.baudrate),
            },
            ConnectionKind::Ether => {
                let ip = dut.ip.clone().unwrap_or_default();
                let addr = if ip.contains(':') {
                    ip
                } else {
                    format!("{}:{}", ip, DEFAULT_TCP_PORT)
                };
                TransportAddr::Tcp { addr }
            }
        };
        DutConnection {
            name: dut.name.clone(),
            transport,
            power_switch_port: dut.power_switch_port,
            power_switch_ip: dut.power_port_ip.clone(),
            inactivity_timeout: secs(dut.inactivity_timeout_s.unwrap_or(d.inactivity_timeout_s)),
            max_consecutive_crc_errors: dut
                .max_consecutive_crc_errors
                .unwrap_or(d.max_consecutive_crc_errors),
            reboot_interval: secs(dut.reboot_interval_s.unwrap_or(d.reboot_interval_s)),
            settle_window: secs(dut.settle_window_s.unwrap_or(d.settle_window_s)),
            max_recovery_attempts: dut.max_recovery_attempts.or(d.max_recovery_attempts),
            max_buffer: d.max_buffer,
            poll_interval: Duration::from_millis(d.poll_interval_ms),
            read_timeout: Duration::from_millis(d.read_timeout_ms),
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)
}
