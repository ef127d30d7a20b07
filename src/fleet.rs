use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::{ConfigOpts, CycleOpts, RunOpts};
use crate::config::{FleetConfig, SwitchConfig, SwitchKind};
use crate::datalog;
use crate::lindy::{DryRunSwitch, LindySwitch};
use crate::port::SystemConnector;
use crate::power::{PowerSwitch, PowerSwitchController};
use crate::supervisor::{DutStatus, FleetSupervisor};

pub fn build_switch(cfg: &SwitchConfig, dry_run: bool) -> Result<Arc<dyn PowerSwitch>> {
    if dry_run || cfg.kind == SwitchKind::DryRun {
        warn!("power switching disabled, power actions are only logged");
        return Ok(Arc::new(DryRunSwitch));
    }
    let switch = LindySwitch::new(
        &cfg.username,
        &cfg.password,
        Duration::from_millis(cfg.request_timeout_ms),
    )?;
    Ok(Arc::new(switch))
}

fn load(path: &Path) -> Result<FleetConfig> {
    FleetConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

pub fn run(opts: RunOpts) -> Result<()> {
    let path = opts.cfg.config.clone();
    let cfg = load(&path)?;
    let switch = build_switch(&cfg.power_switch, opts.no_power_cycle)?;
    let controller = PowerSwitchController::spawn(switch).context("starting power switch worker")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Release))
            .context("installing Ctrl-C handler")?;
    }

    let mut supervisor = FleetSupervisor::new(cfg.schema()?, Arc::new(SystemConnector), controller.handle())
        .with_tick(Duration::from_millis(opts.tick_ms.max(1)));
    let data_log = match &opts.data_log {
        Some(log_path) => {
            let (tx, rx) = crossbeam_channel::unbounded();
            supervisor = supervisor.with_events(tx);
            Some(datalog::spawn(log_path, rx)?)
        }
        None => None,
    };
    info!(config = %path.display(), duts = cfg.duts.len(), "starting fleet");
    supervisor.apply_config(cfg.dut_connections());
    info!(duts = supervisor.len(), "fleet running");

    let mut watcher = ConfigWatcher::new(path);
    let mut formats = cfg.frame_formats.clone();
    let mut ticks: u64 = 0;
    supervisor.run(&stop, |sup| {
        ticks += 1;
        if let Some(next) = watcher.poll() {
            reconcile(sup, &mut formats, next);
        }
        if opts.status_every > 0 && ticks % opts.status_every == 0 {
            log_status(&sup.list_active());
        }
    });

    log_status(&supervisor.list_active());
    supervisor.shutdown();
    // the last event sender goes away with the supervisor
    drop(supervisor);
    if let Some(writer) = data_log {
        match writer.join() {
            Ok(Ok(lines)) => info!(lines, "data log closed"),
            Ok(Err(e)) => warn!(error = %e, "data log write failed"),
            Err(_) => warn!("data log writer panicked"),
        }
    }
    controller.shutdown();
    info!("fleet stopped");
    Ok(())
}

fn reconcile(sup: &mut FleetSupervisor, formats: &mut BTreeMap<u8, String>, cfg: FleetConfig) {
    info!(duts = cfg.duts.len(), "configuration changed, reconciling");
    if cfg.frame_formats != *formats {
        match cfg.schema() {
            Ok(schema) => {
                sup.set_schema(schema);
                *formats = cfg.frame_formats.clone();
                info!("frame formats updated for monitors started from now on");
            }
            Err(e) => warn!(error = %e, "keeping previous frame formats"),
        }
    }
    sup.apply_config(cfg.dut_connections());
}

fn log_status(statuses: &[DutStatus]) {
    for s in statuses {
        info!(
            dut = %s.name,
            link = %s.transport,
            state = %s.state,
            running = s.running,
            restarts = s.restarts,
            frames_ok = s.stats.frames_ok,
            crc_errors = s.stats.crc_errors,
            sync_drops = s.stats.sync_drops,
            recoveries = s.stats.recoveries,
            "status"
        );
    }
}

/// Re-reads the config file whenever its modification time changes.
struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    fn new(path: PathBuf) -> Self {
        let modified = mtime(&path);
        Self { path, modified }
    }

    /// A freshly loaded config if the file changed and still validates.
    fn poll(&mut self) -> Option<FleetConfig> {
        let now = mtime(&self.path);
        if now == self.modified {
            return None;
        }
        self.modified = now;
        match FleetConfig::load(&self.path) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(config = %self.path.display(), error = %e, "ignoring invalid config change");
                None
            }
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub fn list(opts: ConfigOpts) -> Result<()> {
    let cfg = load(&opts.config)?;
    print!("{}", render_table(&cfg));
    Ok(())
}

fn render_table(cfg: &FleetConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<28} {:<16} {:>4}", "NAME", "LINK", "SWITCH", "PORT");
    for dut in cfg.dut_connections() {
        let _ = writeln!(
            out,
            "{:<12} {:<28} {:<16} {:>4}",
            dut.name,
            dut.transport.to_string(),
            dut.power_switch_ip,
            dut.power_switch_port
        );
    }
    out
}

pub fn cycle(opts: CycleOpts) -> Result<()> {
    let cfg = load(&opts.cfg.config)?;
    let Some(dut) = cfg.find(&opts.name) else {
        bail!("no DUT named '{}' in {}", opts.name, opts.cfg.config.display());
    };
    let switch = build_switch(&cfg.power_switch, opts.no_power_cycle)?;
    let controller = PowerSwitchController::spawn(switch).context("starting power switch worker")?;
    info!(dut = %dut.name, port = dut.power_switch_port, ip = %dut.power_switch_ip, "power cycling");
    let result = controller.handle().power_cycle_blocking(
        dut.power_switch_port,
        &dut.power_switch_ip,
        dut.reboot_interval,
    );
    controller.shutdown();
    result.with_context(|| format!("power cycling {}", dut.name))?;
    info!(dut = %dut.name, "power cycle done");
    Ok(())
}
