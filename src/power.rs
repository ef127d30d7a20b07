use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Extra wait after power-on so the DUT's serial adapter can enumerate.
pub const DEFAULT_SETTLE_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    On,
    Off,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortState::On => "on",
            PortState::Off => "off",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PowerSwitchError {
    #[error("power switch http error: {0}")]
    Http(String),
    #[error("power switch connection error: {0}")]
    Connection(String),
    #[error("power switch timeout: {0}")]
    Timeout(String),
    #[error("power switch error: {0}")]
    General(String),
    #[error("power switch controller is shut down")]
    ShutDown,
}

pub type PowerResult = Result<(), PowerSwitchError>;

/// The one operation the core needs from a remote switch.
pub trait PowerSwitch: Send + Sync {
    fn set_port_state(&self, switch_ip: &str, switch_port: u8, state: PortState) -> PowerResult;
}

struct PowerCommand {
    switch_port: u8,
    switch_ip: String,
    interval: Duration,
    result: Sender<PowerResult>,
}

enum Job {
    Cycle(PowerCommand),
    Shutdown,
}

/// Completion side of a queued power cycle. The worker sends exactly one
/// result, so whatever `wait` returns is final.
#[derive(Debug)]
pub struct PowerCycleTicket {
    switch_port: u8,
    switch_ip: String,
    rx: Receiver<PowerResult>,
}

impl PowerCycleTicket {
    pub fn wait(self) -> PowerResult {
        self.rx.recv().unwrap_or(Err(PowerSwitchError::ShutDown))
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<PowerResult> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PowerSwitchError::ShutDown)),
        }
    }

    pub fn switch_port(&self) -> u8 {
        self.switch_port
    }

    pub fn switch_ip(&self) -> &str {
        &self.switch_ip
    }
}

/// Cloneable submitter for the controller's queue.
#[derive(Clone)]
pub struct PowerSwitchHandle {
    tx: Sender<Job>,
    closed: Arc<AtomicBool>,
}

impl PowerSwitchHandle {
    /// Enqueue off -> wait -> on -> wait and return immediately.
    pub fn queue_power_cycle(
        &self,
        switch_port: u8,
        switch_ip: &str,
        interval: Duration,
    ) -> PowerCycleTicket {
        let (result_tx, result_rx) = bounded(1);
        let ticket = PowerCycleTicket {
            switch_port,
            switch_ip: switch_ip.to_string(),
            rx: result_rx,
        };
        if self.closed.load(Ordering::Acquire) {
            let _ = result_tx.send(Err(PowerSwitchError::ShutDown));
            return ticket;
        }
        let cmd = PowerCommand {
            switch_port,
            switch_ip: switch_ip.to_string(),
            interval,
            result: result_tx,
        };
        if let Err(e) = self.tx.send(Job::Cycle(cmd))
            && let Job::Cycle(cmd) = e.into_inner()
        {
            let _ = cmd.result.send(Err(PowerSwitchError::ShutDown));
        }
        debug!(port = switch_port, ip = switch_ip, "power cycle queued");
        ticket
    }

    /// Queue a cycle and block until it has finished.
    pub fn power_cycle_blocking(
        &self,
        switch_port: u8,
        switch_ip: &str,
        interval: Duration,
    ) -> PowerResult {
        self.queue_power_cycle(switch_port, switch_ip, interval)
            .wait()
    }
}

/// Serialises every power operation through one FIFO and one worker thread,
/// so no two commands ever touch a switch at the same time.
pub struct PowerSwitchController {
    handle: PowerSwitchHandle,
    worker: Option<JoinHandle<()>>,
}

impl PowerSwitchController {
    pub fn spawn(switch: Arc<dyn PowerSwitch>) -> std::io::Result<Self> {
        Self::with_margin(switch, DEFAULT_SETTLE_MARGIN)
    }

    pub fn with_margin(switch: Arc<dyn PowerSwitch>, settle_margin: Duration) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("power-switch".into())
            .spawn(move || process_commands(switch, rx, settle_margin))?;
        Ok(Self {
            handle: PowerSwitchHandle {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> PowerSwitchHandle {
        self.handle.clone()
    }

    pub fn queue_power_cycle(
        &self,
        switch_port: u8,
        switch_ip: &str,
        interval: Duration,
    ) -> PowerCycleTicket {
        self.handle
            .queue_power_cycle(switch_port, switch_ip, interval)
    }

    /// Stop accepting commands, let already-queued ones finish, join the worker.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if self.handle.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.handle.tx.send(Job::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("power switch worker panicked");
        }
    }
}

impl Drop for PowerSwitchController {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn process_commands(switch: Arc<dyn PowerSwitch>, rx: Receiver<Job>, settle_margin: Duration) {
    info!("power switch worker started");
    while let Ok(job) = rx.recv() {
        let cmd = match job {
            Job::Cycle(cmd) => cmd,
            Job::Shutdown => break,
        };
        let result = power_cycle(&*switch, &cmd, settle_margin);
        let _ = cmd.result.send(result);
    }
    // anything still queued behind the sentinel is refused, not executed
    for job in rx.try_iter() {
        if let Job::Cycle(cmd) = job {
            let _ = cmd.result.send(Err(PowerSwitchError::ShutDown));
        }
    }
    info!("power switch worker stopped");
}

fn power_cycle(switch: &dyn PowerSwitch, cmd: &PowerCommand, settle_margin: Duration) -> PowerResult {
    let (port, ip) = (cmd.switch_port, cmd.switch_ip.as_str());

    warn!(port, ip, "powering down");
    let off = switch.set_port_state(ip, port, PortState::Off);
    if let Err(e) = &off {
        error!(port, ip, error = %e, "could not power down");
    }
    thread::sleep(cmd.interval);

    // power back up even if the off request failed, so the DUT is not left dark
    warn!(port, ip, "powering up");
    let on = switch.set_port_state(ip, port, PortState::On);
    if let Err(e) = &on {
        error!(port, ip, error = %e, "could not power up");
    }
    thread::sleep(cmd.interval + settle_margin);

    off.and(on)
}
