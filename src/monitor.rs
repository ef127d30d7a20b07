use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::config::DutConnection;
use crate::frame::{Frame, MAX_FRAME_LEN, crc16};
use crate::port::{Connector, Transport};
use crate::power::{PowerCycleTicket, PowerSwitchHandle};
use crate::reassembler::{Extracted, FrameReassembler};
use crate::schema::{DecodeError, FieldValue, PayloadSchema, decode_payload};
use crate::stats::MonitorStats;

/// Log target for the per-frame stream, so it can be filtered on its own.
pub const FRAME_LOG: &str = "radmon::frames";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Starting = 0,
    Running = 1,
    Recovering = 2,
    Stopped = 3,
}

impl MonitorState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => MonitorState::Running,
            2 => MonitorState::Recovering,
            3 => MonitorState::Stopped,
            _ => MonitorState::Starting,
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Recovering => "recovering",
            MonitorState::Stopped => "stopped",
        })
    }
}

/// Per-frame and per-link failure classes. None of these is fatal on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("dropped {0} stray byte(s) while resynchronising")]
    FrameSyncDrop(u64),
    #[error("crc mismatch on frame {frame_id:#04x}: received {received:#06x}, computed {computed:#06x}")]
    CrcMismatch {
        frame_id: u8,
        received: u16,
        computed: u16,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("residual buffer overflow, {0} bytes discarded")]
    BufferOverflow(usize),
    #[error("no data for {0:?}")]
    SerialTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    Inactivity(Duration),
    CrcErrors(u32),
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryReason::Inactivity(d) => write!(f, "no data for {:.1}s", d.as_secs_f64()),
            RecoveryReason::CrcErrors(n) => write!(f, "{} consecutive crc errors", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    OpenFailed(String),
    TransportLost(String),
    RecoveryLimit(u32),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::OpenFailed(e) => write!(f, "transport open failed: {}", e),
            StopReason::TransportLost(e) => write!(f, "transport lost: {}", e),
            StopReason::RecoveryLimit(n) => write!(f, "gave up after {} recoveries without a valid frame", n),
        }
    }
}

/// What a monitor reports on its output channel.
#[derive(Debug, Clone)]
pub enum DutEvent {
    Frame {
        dut: String,
        frame: Frame,
        fields: Vec<FieldValue>,
    },
    Fault {
        dut: String,
        fault: Fault,
    },
    Recovery {
        dut: String,
        reason: RecoveryReason,
    },
    Stopped {
        dut: String,
        reason: StopReason,
    },
}

/// Watches one DUT link. Single-use: [`spawn`](Self::spawn) consumes it and a
/// restart always builds a fresh instance.
pub struct DutMonitor {
    dut: DutConnection,
    schema: Arc<PayloadSchema>,
    connector: Arc<dyn Connector>,
    power: PowerSwitchHandle,
    events: Option<Sender<DutEvent>>,
    stats: Arc<MonitorStats>,
    stop: Arc<AtomicBool>,

    state: MonitorState,
    transport: Option<Box<dyn Transport>>,
    reassembler: FrameReassembler,
    read_buf: Vec<u8>,
    consecutive_crc_errors: u32,
    /// Set the moment the crc threshold is reached, before later frames can reset the counter.
    crc_tripped: Option<u32>,
    consecutive_recoveries: u32,
    last_activity: Instant,
    device_powered_off: bool,
    reboot_started_at: Option<Instant>,
    pending_cycle: Option<PowerCycleTicket>,
}

impl DutMonitor {
    pub fn new(
        dut: DutConnection,
        schema: Arc<PayloadSchema>,
        connector: Arc<dyn Connector>,
        power: PowerSwitchHandle,
    ) -> Self {
        let reassembler = FrameReassembler::new(dut.max_buffer);
        Self {
            dut,
            schema,
            connector,
            power,
            events: None,
            stats: Arc::new(MonitorStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
            state: MonitorState::Starting,
            transport: None,
            reassembler,
            read_buf: vec![0u8; MAX_FRAME_LEN * 4],
            consecutive_crc_errors: 0,
            crc_tripped: None,
            consecutive_recoveries: 0,
            last_activity: Instant::now(),
            device_powered_off: false,
            reboot_started_at: None,
            pending_cycle: None,
        }
    }

    pub fn with_events(mut self, events: Sender<DutEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    pub fn spawn(self) -> io::Result<MonitorHandle> {
        let name = self.dut.name.clone();
        let stop = self.stop.clone();
        let stats = self.stats.clone();
        let thread = thread::Builder::new()
            .name(format!("dut-{}", name))
            .spawn(move || self.run())?;
        Ok(MonitorHandle {
            name,
            stop,
            stats,
            thread,
        })
    }

    fn run(mut self) {
        let span = info_span!("dut", name = %self.dut.name);
        let _guard = span.enter();
        let reason = self.run_loop();
        self.shutdown(reason);
    }

    fn run_loop(&mut self) -> StopReason {
        if let ControlFlow::Break(reason) = self.start(Instant::now()) {
            return reason;
        }
        loop {
            if self.stop.load(Ordering::Acquire) {
                return StopReason::Requested;
            }
            if let ControlFlow::Break(reason) = self.step(Instant::now()) {
                return reason;
            }
            thread::sleep(self.dut.poll_interval);
        }
    }

    fn set_state(&mut self, state: MonitorState) {
        self.state = state;
        self.stats.set_state(state);
    }

    fn emit(&self, event: DutEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_fault(&self, fault: Fault) {
        self.emit(DutEvent::Fault {
            dut: self.dut.name.clone(),
            fault,
        });
    }

    /// STARTING -> RUNNING: open and flush the transport.
    fn start(&mut self, now: Instant) -> ControlFlow<StopReason> {
        self.set_state(MonitorState::Starting);
        self.open_transport()?;
        self.last_activity = now;
        self.set_state(MonitorState::Running);
        info!(transport = %self.dut.transport, "monitor started");
        ControlFlow::Continue(())
    }

    fn open_transport(&mut self) -> ControlFlow<StopReason> {
        match self.connector.open(&self.dut) {
            Ok(mut t) => {
                if let Err(e) = t.flush_input() {
                    warn!(error = %e, "could not flush input");
                }
                self.transport = Some(t);
                ControlFlow::Continue(())
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                error!(error = %msg, "could not open transport");
                ControlFlow::Break(StopReason::OpenFailed(msg))
            }
        }
    }

    /// One polling tick.
    fn step(&mut self, now: Instant) -> ControlFlow<StopReason> {
        match self.state {
            MonitorState::Running => self.step_running(now),
            MonitorState::Recovering => self.step_recovering(now),
            MonitorState::Starting | MonitorState::Stopped => ControlFlow::Continue(()),
        }
    }

    fn step_running(&mut self, now: Instant) -> ControlFlow<StopReason> {
        let Some(transport) = self.transport.as_mut() else {
            return ControlFlow::Break(StopReason::TransportLost("no open transport".into()));
        };
        let mut buf = std::mem::take(&mut self.read_buf);
        let read = transport.read_available(&mut buf);
        match read {
            Ok(0) => {}
            Ok(n) => {
                self.last_activity = now;
                self.stats.add_bytes(n);
                self.ingest(&buf[..n]);
            }
            Err(e) => {
                self.read_buf = buf;
                return ControlFlow::Break(StopReason::TransportLost(e.to_string()));
            }
        }
        self.read_buf = buf;

        if let Some(n) = self.crc_tripped.take() {
            return self.begin_recovery(now, RecoveryReason::CrcErrors(n));
        }
        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= self.dut.inactivity_timeout {
            warn!(idle_s = idle.as_secs_f64(), "serial timeout");
            self.emit_fault(Fault::SerialTimeout(idle));
            return self.begin_recovery(now, RecoveryReason::Inactivity(idle));
        }
        ControlFlow::Continue(())
    }

    fn ingest(&mut self, chunk: &[u8]) {
        let drops_before = self.reassembler.sync_drops();
        self.reassembler.push(chunk);
        // frames behind a crc trip are discarded with the buffer, as if read after it
        while self.crc_tripped.is_none()
            && let Some(item) = self.reassembler.next_frame()
        {
            match item {
                Extracted::Frame { frame, .. } => self.on_frame(frame),
                Extracted::Overflow { discarded } => {
                    self.stats.inc_overflow();
                    error!(discarded, "residual buffer overflow, buffer cleared");
                    self.emit_fault(Fault::BufferOverflow(discarded));
                }
            }
        }
        let dropped = self.reassembler.sync_drops() - drops_before;
        if dropped > 0 {
            self.stats.add_sync_drops(dropped);
            debug!(target: FRAME_LOG, dropped, "resync");
            self.emit_fault(Fault::FrameSyncDrop(dropped));
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if !frame.crc_ok() {
            self.consecutive_crc_errors += 1;
            self.stats.inc_crc_error();
            warn!(
                target: FRAME_LOG,
                frame_id = frame.frame_id,
                consecutive = self.consecutive_crc_errors,
                hex = %frame.to_hex(),
                "crc mismatch"
            );
            self.emit_fault(Fault::CrcMismatch {
                frame_id: frame.frame_id,
                received: frame.crc,
                computed: crc16(&frame.payload),
            });
            if self.consecutive_crc_errors >= self.dut.max_consecutive_crc_errors {
                self.crc_tripped = Some(self.consecutive_crc_errors);
            }
            return;
        }

        self.consecutive_crc_errors = 0;
        self.consecutive_recoveries = 0;
        self.stats.inc_ok();
        match decode_payload(frame.frame_id, &frame.payload, &self.schema) {
            Ok(fields) => {
                debug!(
                    target: FRAME_LOG,
                    frame_id = frame.frame_id,
                    hex = %frame.to_hex(),
                    fields = ?fields,
                    "frame"
                );
                self.emit(DutEvent::Frame {
                    dut: self.dut.name.clone(),
                    frame,
                    fields,
                });
            }
            Err(e) => {
                self.stats.inc_decode_error();
                warn!(target: FRAME_LOG, error = %e, hex = %frame.to_hex(), "frame dropped");
                self.emit_fault(Fault::Decode(e));
            }
        }
    }

    /// RUNNING -> RECOVERING: queue a power cycle and stop reading until it settles.
    fn begin_recovery(&mut self, now: Instant, reason: RecoveryReason) -> ControlFlow<StopReason> {
        self.consecutive_recoveries += 1;
        if let Some(max) = self.dut.max_recovery_attempts
            && self.consecutive_recoveries > max
        {
            error!(%reason, max, "recovery limit reached");
            return ControlFlow::Break(StopReason::RecoveryLimit(max));
        }

        warn!(
            %reason,
            attempt = self.consecutive_recoveries,
            port = self.dut.power_switch_port,
            ip = %self.dut.power_switch_ip,
            "power cycling DUT"
        );
        self.stats.inc_recovery();
        self.emit(DutEvent::Recovery {
            dut: self.dut.name.clone(),
            reason,
        });
        self.pending_cycle = Some(self.power.queue_power_cycle(
            self.dut.power_switch_port,
            &self.dut.power_switch_ip,
            self.dut.reboot_interval,
        ));
        self.reboot_started_at = Some(now);
        self.device_powered_off = true;
        self.consecutive_crc_errors = 0;
        self.crc_tripped = None;
        let partial = self.reassembler.buffered();
        if partial > 0 {
            debug!(partial, "discarding partial frame");
        }
        self.reassembler.clear();
        self.set_state(MonitorState::Recovering);
        ControlFlow::Continue(())
    }

    /// Timeout triggers are ignored here until the cycle has completed and
    /// the settle window since power-down has passed.
    fn step_recovering(&mut self, now: Instant) -> ControlFlow<StopReason> {
        if let Some(ticket) = &self.pending_cycle
            && let Some(result) = ticket.try_result()
        {
            let (port, ip) = (ticket.switch_port(), ticket.switch_ip());
            match result {
                Ok(()) => info!(port, ip, "power cycle complete"),
                Err(e) => warn!(port, ip, error = %e, "power cycle failed, DUT power state unknown"),
            }
            self.pending_cycle = None;
            self.device_powered_off = false;
        }

        let settled = self
            .reboot_started_at
            .is_none_or(|t| now.saturating_duration_since(t) >= self.dut.settle_window);
        if self.pending_cycle.is_none() && settled {
            return self.finish_recovery(now);
        }
        ControlFlow::Continue(())
    }

    /// RECOVERING -> RUNNING. The link is reopened because USB serial
    /// adapters re-enumerate when the DUT loses power.
    fn finish_recovery(&mut self, now: Instant) -> ControlFlow<StopReason> {
        if let Some(old) = self.transport.take()
            && let Err(e) = old.close()
        {
            debug!(error = %e, "closing stale transport");
        }
        self.open_transport()?;
        self.reassembler.clear();
        self.last_activity = now;
        self.reboot_started_at = None;
        self.set_state(MonitorState::Running);
        info!("recovery finished, resuming reads");
        ControlFlow::Continue(())
    }

    fn shutdown(mut self, reason: StopReason) {
        match &reason {
            StopReason::Requested => info!("monitor stopped"),
            other => error!(reason = %other, "monitor stopped"),
        }
        if let Some(t) = self.transport.take()
            && let Err(e) = t.close()
        {
            warn!(error = %e, "closing transport");
        }
        if self.device_powered_off {
            warn!("stopping while a power cycle is still in flight");
        }
        self.set_state(MonitorState::Stopped);
        self.emit(DutEvent::Stopped {
            dut: self.dut.name.clone(),
            reason,
        });
    }
}

/// Owner-side view of a running monitor thread.
pub struct MonitorHandle {
    name: String,
    stop: Arc<AtomicBool>,
    stats: Arc<MonitorStats>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Safe from any thread; the loop notices within one polling tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> &Arc<MonitorStats> {
        &self.stats
    }

    pub fn state(&self) -> MonitorState {
        self.stats.state()
    }

    pub fn join(self) {
        let MonitorHandle { name, thread, .. } = self;
        if thread.join().is_err() {
            error!(dut = %name, "monitor thread panicked");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;
    use crate::config::TransportAddr;
    use crate::frame::encode;
    use crate::port::mock::{AfterScript, ScriptedConnector, ScriptedTransport};
    use crate::power::testing::RecordingSwitch;
    use crate::power::{PortState, PowerSwitchController};

    pub(crate) fn test_dut(name: &str) -> DutConnection {
        DutConnection {
            name: name.to_string(),
            transport: TransportAddr::Serial {
                path: format!("/dev/null/{}", name),
                baudrate: 115_200,
            },
            power_switch_port: 1,
            power_switch_ip: "10.0.0.1".into(),
            inactivity_timeout: Duration::from_secs(3600),
            max_consecutive_crc_errors: 3,
            reboot_interval: Duration::ZERO,
            settle_window: Duration::ZERO,
            max_recovery_attempts: None,
            max_buffer: crate::reassembler::DEFAULT_MAX_BUFFER,
            poll_interval: Duration::from_millis(2),
            read_timeout: Duration::from_millis(2),
        }
    }

    fn bad_frame(id: u8) -> Vec<u8> {
        let mut f = encode(id, &[1, 2, 3]).unwrap();
        f[3] ^= 0xFF;
        f
    }

    struct Rig {
        switch: Arc<RecordingSwitch>,
        ctl: PowerSwitchController,
    }

    fn rig() -> Rig {
        let switch = Arc::new(RecordingSwitch::default());
        let ctl = PowerSwitchController::with_margin(switch.clone(), Duration::ZERO).unwrap();
        Rig { switch, ctl }
    }

    fn monitor(dut: DutConnection, connector: ScriptedConnector, rig: &Rig) -> DutMonitor {
        DutMonitor::new(
            dut,
            Arc::new(PayloadSchema::from_strings([(1, "3B")]).unwrap()),
            Arc::new(connector),
            rig.ctl.handle(),
        )
    }

    fn step_until_running(m: &mut DutMonitor, now: Instant) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while m.state != MonitorState::Running {
            assert!(Instant::now() < deadline, "monitor never left recovery");
            assert_eq!(m.step(now), ControlFlow::Continue(()));
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn crc_threshold_queues_exactly_one_power_cycle() {
        let rig = rig();
        let mut stream = Vec::new();
        for id in 0..3 {
            stream.extend(bad_frame(id));
        }
        let connector = ScriptedConnector::new(vec![
            ScriptedTransport::new(vec![stream], AfterScript::Idle),
            ScriptedTransport::new(vec![], AfterScript::Idle),
        ]);
        let mut m = monitor(test_dut("a"), connector, &rig);
        let t0 = Instant::now();

        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert_eq!(m.step(t0), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Recovering);
        assert_eq!(m.consecutive_crc_errors, 0);

        step_until_running(&mut m, t0);
        for _ in 0..5 {
            assert_eq!(m.step(t0), ControlFlow::Continue(()));
        }
        assert_eq!(m.state, MonitorState::Running);
        assert_eq!(
            rig.switch.calls(),
            vec![
                ("10.0.0.1".to_string(), 1, PortState::Off),
                ("10.0.0.1".to_string(), 1, PortState::On)
            ]
        );
        let snap = m.stats().snapshot();
        assert_eq!(snap.crc_errors, 3);
        assert_eq!(snap.recoveries, 1);
    }

    #[test]
    fn crc_threshold_holds_across_read_boundaries() {
        let mut stream = Vec::new();
        for id in 0..3 {
            stream.extend(bad_frame(id));
        }
        let split = stream.len();
        stream.extend(encode(1, &[4, 5, 6]).unwrap());

        let outcome = |chunks: Vec<Vec<u8>>| {
            let rig = rig();
            let connector = ScriptedConnector::new(vec![ScriptedTransport::new(chunks, AfterScript::Idle)]);
            let mut m = monitor(test_dut("s"), connector, &rig);
            let t0 = Instant::now();
            assert_eq!(m.start(t0), ControlFlow::Continue(()));
            assert_eq!(m.step(t0), ControlFlow::Continue(()));
            let snap = m.stats().snapshot();
            (m.state, snap.recoveries, snap.frames_ok)
        };

        let whole = outcome(vec![stream.clone()]);
        let split_reads = outcome(vec![stream[..split].to_vec(), stream[split..].to_vec()]);
        assert_eq!(whole, (MonitorState::Recovering, 1, 0));
        assert_eq!(split_reads, whole);
    }

    #[test]
    fn valid_frame_resets_crc_counter() {
        let rig = rig();
        let mut stream = bad_frame(1);
        stream.extend(bad_frame(1));
        stream.extend(encode(1, &[4, 5, 6]).unwrap());
        stream.extend(bad_frame(1));
        stream.extend(bad_frame(1));
        let connector = ScriptedConnector::new(vec![ScriptedTransport::new(vec![stream], AfterScript::Idle)]);
        let mut m = monitor(test_dut("b"), connector, &rig);
        let t0 = Instant::now();
        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert_eq!(m.step(t0), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Running);
        assert_eq!(m.consecutive_crc_errors, 2);
        assert!(rig.switch.calls().is_empty());
    }

    #[test]
    fn inactivity_recovery_is_debounced_by_settle_window() {
        let rig = rig();
        let connector = ScriptedConnector::new(vec![
            ScriptedTransport::new(vec![], AfterScript::Idle),
            ScriptedTransport::new(vec![], AfterScript::Idle),
            ScriptedTransport::new(vec![], AfterScript::Idle),
        ]);
        let mut dut = test_dut("c");
        dut.inactivity_timeout = Duration::from_secs(10);
        dut.settle_window = Duration::from_secs(30);
        let mut m = monitor(dut, connector, &rig);
        let t0 = Instant::now();
        let at = |s: u64| t0 + Duration::from_secs(s);

        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert_eq!(m.step(at(5)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Running);
        assert_eq!(m.step(at(10)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Recovering);

        // the cycle completes but the settle window has not passed
        let deadline = Instant::now() + Duration::from_secs(5);
        while m.pending_cycle.is_some() {
            assert!(Instant::now() < deadline);
            assert_eq!(m.step(at(11)), ControlFlow::Continue(()));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(m.step(at(39)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Recovering);
        assert_eq!(rig.switch.calls().len(), 2);

        assert_eq!(m.step(at(40)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Running);
        assert_eq!(m.step(at(45)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Running);
        assert_eq!(m.step(at(50)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Recovering);
        assert_eq!(m.stats().snapshot().recoveries, 2);
    }

    #[test]
    fn recovery_limit_stops_monitor() {
        let rig = rig();
        let connector = ScriptedConnector::new(vec![
            ScriptedTransport::new(vec![], AfterScript::Idle),
            ScriptedTransport::new(vec![], AfterScript::Idle),
        ]);
        let mut dut = test_dut("d");
        dut.inactivity_timeout = Duration::from_secs(1);
        dut.max_recovery_attempts = Some(1);
        let mut m = monitor(dut, connector, &rig);
        let t0 = Instant::now();
        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert_eq!(m.step(t0 + Duration::from_secs(1)), ControlFlow::Continue(()));
        assert_eq!(m.state, MonitorState::Recovering);
        step_until_running(&mut m, t0 + Duration::from_secs(1));
        assert_eq!(
            m.step(t0 + Duration::from_secs(3)),
            ControlFlow::Break(StopReason::RecoveryLimit(1))
        );
    }

    #[test]
    fn open_failure_is_fatal() {
        let rig = rig();
        let mut m = monitor(test_dut("e"), ScriptedConnector::new(vec![]), &rig);
        assert!(matches!(
            m.start(Instant::now()),
            ControlFlow::Break(StopReason::OpenFailed(_))
        ));
    }

    #[test]
    fn read_error_is_fatal() {
        let rig = rig();
        let connector = ScriptedConnector::new(vec![ScriptedTransport::new(vec![], AfterScript::Fail)]);
        let mut m = monitor(test_dut("f"), connector, &rig);
        let t0 = Instant::now();
        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert!(matches!(
            m.step(t0),
            ControlFlow::Break(StopReason::TransportLost(_))
        ));
    }

    #[test]
    fn frames_and_faults_reach_the_output_channel() {
        let rig = rig();
        let mut stream = vec![0x00, 0x01];
        stream.extend(encode(1, &[7, 8, 9]).unwrap());
        stream.extend(encode(9, &[]).unwrap());
        stream.extend(encode(1, &[7, 8]).unwrap());
        let connector = ScriptedConnector::new(vec![ScriptedTransport::new(vec![stream], AfterScript::Idle)]);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut m = monitor(test_dut("g"), connector, &rig).with_events(tx);
        let t0 = Instant::now();
        assert_eq!(m.start(t0), ControlFlow::Continue(()));
        assert_eq!(m.step(t0), ControlFlow::Continue(()));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4, "{:?}", events);
        match &events[0] {
            DutEvent::Frame { dut, frame, fields } => {
                assert_eq!(dut, "g");
                assert_eq!(frame.frame_id, 1);
                assert_eq!(
                    fields,
                    &vec![
                        FieldValue::Unsigned(7),
                        FieldValue::Unsigned(8),
                        FieldValue::Unsigned(9)
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            &events[1],
            DutEvent::Fault { fault: Fault::Decode(DecodeError::UnknownFrameId(9)), .. }
        ));
        assert!(matches!(
            &events[2],
            DutEvent::Fault { fault: Fault::Decode(DecodeError::Unpack { .. }), .. }
        ));
        assert!(matches!(
            &events[3],
            DutEvent::Fault { fault: Fault::FrameSyncDrop(2), .. }
        ));
        let snap = m.stats().snapshot();
        assert_eq!(snap.frames_ok, 3);
        assert_eq!(snap.decode_errors, 2);
        assert_eq!(snap.sync_drops, 2);
    }

    #[test]
    fn stop_from_another_thread_closes_transport_once() {
        let rig = rig();
        let transport = ScriptedTransport::new(vec![], AfterScript::Idle);
        let closes = transport.close_counter();
        let connector = ScriptedConnector::new(vec![transport]);
        let handle = monitor(test_dut("h"), connector, &rig).spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != MonitorState::Running {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_running());
        let stats = handle.stats().clone();
        let stopper = {
            let stop = handle.stop.clone();
            thread::spawn(move || stop.store(true, AtomicOrdering::Release))
        };
        stopper.join().unwrap();
        handle.stop();
        handle.join();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(stats.state(), MonitorState::Stopped);
    }
}
