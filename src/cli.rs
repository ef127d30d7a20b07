use anyhow::{Context, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogFormat;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "radmon",
    about = "Monitor DUT serial links under irradiation and power cycle them when they stop responding"
)]
pub struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Supervise every DUT in the config until Ctrl-C
    Run(RunOpts),
    /// Print the configured DUTs and their power switch outlets
    List(ConfigOpts),
    /// Power cycle one configured DUT and wait for it to finish
    Cycle(CycleOpts),
    /// Decode and log frames from a single link, without power control
    Watch(WatchOpts),
    /// Transmit synthetic frames for bench testing
    Emit(EmitOpts),
}

#[derive(Args, Debug, Clone)]
pub struct ConfigOpts {
    /// Fleet configuration (YAML)
    #[arg(short, long, default_value = "radmon.yaml")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RunOpts {
    #[command(flatten)]
    pub cfg: ConfigOpts,
    /// Log power actions instead of sending them to the switch
    #[arg(long, default_value_t = false)]
    pub no_power_cycle: bool,
    /// Supervisor ticks between status summaries (0 disables)
    #[arg(long, default_value_t = 30)]
    pub status_every: u64,
    /// Liveness poll period in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,
    /// Append every decoded frame and fault to this file
    #[arg(long)]
    pub data_log: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CycleOpts {
    #[command(flatten)]
    pub cfg: ConfigOpts,
    /// DUT name as given in the config
    pub name: String,
    /// Log power actions instead of sending them to the switch
    #[arg(long, default_value_t = false)]
    pub no_power_cycle: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WatchOpts {
    /// Take the link and frame formats from this config ...
    #[arg(long, requires = "dut")]
    pub config: Option<PathBuf>,
    /// ... for this DUT
    #[arg(long, requires = "config")]
    pub dut: Option<String>,
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Read from host:port instead of a serial device
    #[arg(long, conflicts_with = "config")]
    pub tcp: Option<String>,
    /// Frame format as ID=FORMAT, e.g. 1=15I (repeatable)
    #[arg(long = "format", value_parser = parse_format_arg)]
    pub formats: Vec<(u8, String)>,
    /// Stats print interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

#[derive(Args, Debug, Clone)]
pub struct EmitOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Frame id to send
    #[arg(long, default_value_t = 1)]
    pub frame_id: u8,
    /// Payload size in bytes
    #[arg(long, default_value_t = 60)]
    pub len: usize,
    /// "max" or milliseconds gap (e.g. 0, 5, 10) or "auto"
    #[arg(long, default_value = "10")]
    pub gap: String,
    /// Bits per byte for pacing math
    #[arg(long, default_value_t = 10)]
    pub bpb: u32,
    /// Utilization (0.0..1.0) when gap="auto" (1.0 = line-rate)
    #[arg(long, default_value_t = 1.0)]
    pub util: f64,
    /// Flip a CRC bit on every N-th frame
    #[arg(long)]
    pub corrupt_every: Option<u64>,
    /// Stop after this many frames
    #[arg(long)]
    pub count: Option<u64>,
}

pub fn parse_format_arg(s: &str) -> anyhow::Result<(u8, String)> {
    let (id, fmt) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected ID=FORMAT, got '{}'", s))?;
    let id: u8 = id
        .trim()
        .parse()
        .with_context(|| format!("bad frame id '{}'", id))?;
    Ok((id, fmt.trim().to_string()))
}

/// Typed pacing model to replace ad-hoc gap handling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
    Auto { util: f64 },
}

impl Pacing {
    pub fn from_cli(gap: &str, util: f64) -> anyhow::Result<Self> {
        if gap.eq_ignore_ascii_case("max") {
            Ok(Pacing::Max)
        } else if gap.eq_ignore_ascii_case("auto") {
            Ok(Pacing::Auto { util })
        } else {
            let ms: u64 = gap
                .parse()
                .map_err(|_| anyhow!("gap must be integer ms, 'auto', or 'max'"))?;
            Ok(Pacing::Fixed(Duration::from_millis(ms)))
        }
    }

    /// Sleep needed after writing `bytes` to hold the requested pace.
    pub fn sleep_for(self, bytes: usize, bpb: u32, baud: u32) -> Option<Duration> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(d) => Some(d),
            Pacing::Auto { util } => {
                let util = util.max(1e-3);
                let bit_time_s = (bytes as f64) * (bpb as f64) / (baud as f64);
                Some(Duration::from_secs_f64(bit_time_s / util))
            }
        }
    }
}
