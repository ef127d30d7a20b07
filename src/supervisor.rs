use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::config::DutConnection;
use crate::monitor::{DutEvent, DutMonitor, MonitorHandle, MonitorState};
use crate::port::Connector;
use crate::power::{PowerCycleTicket, PowerSwitchHandle};
use crate::schema::PayloadSchema;
use crate::stats::StatsSnapshot;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// One row of the operator listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DutStatus {
    pub name: String,
    pub transport: String,
    pub state: MonitorState,
    pub running: bool,
    pub restarts: u32,
    pub stats: StatsSnapshot,
}

struct FleetEntry {
    dut: DutConnection,
    handle: Option<MonitorHandle>,
    restarts: u32,
}

/// Keeps one monitor thread alive per configured DUT. The registry is only
/// ever touched from the thread that owns the supervisor.
pub struct FleetSupervisor {
    entries: BTreeMap<String, FleetEntry>,
    schema: Arc<PayloadSchema>,
    connector: Arc<dyn Connector>,
    power: PowerSwitchHandle,
    events: Option<Sender<DutEvent>>,
    tick: Duration,
}

impl FleetSupervisor {
    pub fn new(schema: PayloadSchema, connector: Arc<dyn Connector>, power: PowerSwitchHandle) -> Self {
        Self {
            entries: BTreeMap::new(),
            schema: Arc::new(schema),
            connector,
            power,
            events: None,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_events(mut self, events: Sender<DutEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes effect for monitors started after the call.
    pub fn set_schema(&mut self, schema: PayloadSchema) {
        self.schema = Arc::new(schema);
    }

    /// Bring the registry in line with `desired`. DUTs that disappeared or
    /// whose settings changed are stopped; new ones are power cycled and started.
    pub fn apply_config(&mut self, desired: Vec<DutConnection>) {
        let desired: BTreeMap<String, DutConnection> =
            desired.into_iter().map(|d| (d.name.clone(), d)).collect();

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(name, entry)| desired.get(*name) != Some(&entry.dut))
            .map(|(name, _)| name.clone())
            .collect();
        let mut stopping = Vec::new();
        for name in stale {
            if let Some(entry) = self.entries.remove(&name) {
                if desired.contains_key(&name) {
                    info!(dut = %name, "DUT settings changed, replacing monitor");
                } else {
                    info!(dut = %name, "DUT removed from configuration");
                }
                if let Some(handle) = entry.handle {
                    handle.stop();
                    stopping.push(handle);
                }
            }
        }
        for handle in stopping {
            handle.join();
        }

        for (name, dut) in desired {
            if self.entries.contains_key(&name) {
                continue;
            }
            info!(dut = %name, transport = %dut.transport, "starting DUT");
            let handle = self.start_monitor(&dut);
            self.entries.insert(
                name,
                FleetEntry {
                    dut,
                    handle,
                    restarts: 0,
                },
            );
        }
    }

    /// Power cycle synchronously, then spawn a fresh monitor.
    fn start_monitor(&self, dut: &DutConnection) -> Option<MonitorHandle> {
        if let Err(e) = self.power.power_cycle_blocking(
            dut.power_switch_port,
            &dut.power_switch_ip,
            dut.reboot_interval,
        ) {
            warn!(dut = %dut.name, error = %e, "power cycle before start failed, starting anyway");
        }

        let mut monitor = DutMonitor::new(
            dut.clone(),
            self.schema.clone(),
            self.connector.clone(),
            self.power.clone(),
        );
        if let Some(tx) = &self.events {
            monitor = monitor.with_events(tx.clone());
        }
        match monitor.spawn() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(dut = %dut.name, error = %e, "could not spawn monitor thread");
                None
            }
        }
    }

    /// Restart every monitor whose thread has exited. Returns how many were restarted.
    pub fn poll_liveness(&mut self) -> usize {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.handle.as_ref().is_none_or(|h| !h.is_running()))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &dead {
            let Some(entry) = self.entries.get_mut(name) else {
                continue;
            };
            match entry.handle.take() {
                Some(handle) => {
                    let state = handle.state();
                    let stats = handle.stats().snapshot();
                    handle.join();
                    warn!(dut = %name, %state, %stats, "monitor is no longer running, restarting");
                }
                None => warn!(dut = %name, "no monitor thread, restarting"),
            }
            let dut = entry.dut.clone();

            let handle = self.start_monitor(&dut);
            if let Some(entry) = self.entries.get_mut(name) {
                entry.handle = handle;
                entry.restarts += 1;
            }
        }
        dead.len()
    }

    /// Liveness loop. `on_tick` runs after every poll, e.g. for config reloads
    /// or status output.
    pub fn run<F>(&mut self, stop: &AtomicBool, mut on_tick: F)
    where
        F: FnMut(&mut Self),
    {
        info!(duts = self.entries.len(), "supervisor running");
        while !stop.load(Ordering::Acquire) {
            self.poll_liveness();
            on_tick(self);
            thread::sleep(self.tick);
        }
        info!("supervisor stopping");
    }

    pub fn list_active(&self) -> Vec<DutStatus> {
        self.entries
            .iter()
            .map(|(name, entry)| {
                let (state, running, stats) = match &entry.handle {
                    Some(h) => (h.state(), h.is_running(), h.stats().snapshot()),
                    None => (MonitorState::Stopped, false, StatsSnapshot::default()),
                };
                DutStatus {
                    name: name.clone(),
                    transport: entry.dut.transport.to_string(),
                    state,
                    running,
                    restarts: entry.restarts,
                    stats,
                }
            })
            .collect()
    }

    /// Queue an out-of-band power cycle for a registered DUT.
    pub fn force_power_cycle(&self, name: &str) -> Option<PowerCycleTicket> {
        let entry = self.entries.get(name)?;
        warn!(dut = %name, "forced power cycle");
        Some(self.power.queue_power_cycle(
            entry.dut.power_switch_port,
            &entry.dut.power_switch_ip,
            entry.dut.reboot_interval,
        ))
    }

    /// Stop every monitor and wait for all of them.
    pub fn shutdown(&mut self) {
        let handles: Vec<MonitorHandle> = std::mem::take(&mut self.entries)
            .into_values()
            .filter_map(|e| e.handle)
            .collect();
        for h in &handles {
            debug!(dut = %h.name(), "stopping monitor");
            h.stop();
        }
        for h in handles {
            h.join();
        }
    }
}

impl Drop for FleetSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
