use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::WatchOpts;
use crate::config::FleetConfig;
use crate::frame::Frame;
use crate::monitor::FRAME_LOG;
use crate::port::{Connector, SerialTransport, SystemConnector, TcpTransport, Transport};
use crate::reassembler::{DEFAULT_MAX_BUFFER, Extracted, FrameReassembler};
use crate::schema::{FieldFormat, PayloadSchema, decode_payload};
use crate::stats::{MonitorStats, StatsReporter};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

struct Link {
    name: String,
    transport: Box<dyn Transport>,
    schema: PayloadSchema,
    max_buffer: usize,
}

fn open_link(opts: &WatchOpts) -> Result<Link> {
    let mut link = if let (Some(path), Some(name)) = (&opts.config, &opts.dut) {
        let cfg = FleetConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
        let dut = cfg
            .find(name)
            .with_context(|| format!("no DUT named '{}' in {}", name, path.display()))?;
        Link {
            name: dut.name.clone(),
            transport: SystemConnector.open(&dut)?,
            schema: cfg.schema()?,
            max_buffer: dut.max_buffer,
        }
    } else if let Some(addr) = &opts.tcp {
        Link {
            name: addr.clone(),
            transport: Box::new(TcpTransport::connect(addr, READ_TIMEOUT)?),
            schema: PayloadSchema::new(),
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    } else {
        let ser = &opts.ser;
        Link {
            name: ser.dev.clone(),
            transport: Box::new(SerialTransport::open(&ser.dev, ser.baud, ser.rtscts, READ_TIMEOUT)?),
            schema: PayloadSchema::new(),
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    };
    for (id, fmt) in &opts.formats {
        let parsed = fmt
            .parse::<FieldFormat>()
            .with_context(|| format!("frame format for id {}", id))?;
        link.schema.insert(*id, parsed);
    }
    Ok(link)
}

/// Decode frames from one link and log them until Ctrl-C. No power control.
pub fn run(opts: WatchOpts) -> Result<()> {
    let Link {
        name,
        mut transport,
        schema,
        max_buffer,
    } = open_link(&opts)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Release))
            .context("installing Ctrl-C handler")?;
    }

    transport.flush_input().context("flushing input")?;
    info!(link = %name, formats = schema.len(), "watching");

    let stats = MonitorStats::new();
    let mut reporter = StatsReporter::new(Duration::from_secs_f64(opts.stats.max(0.1)));
    let mut reassembler = FrameReassembler::new(max_buffer);
    let mut buf = vec![0u8; 4096];

    while !stop.load(Ordering::Acquire) {
        let n = transport.read_available(&mut buf).context("reading link")?;
        if n > 0 {
            stats.add_bytes(n);
            let drops_before = reassembler.sync_drops();
            for item in reassembler.feed(&buf[..n]) {
                match item {
                    Extracted::Frame { frame, .. } => report_frame(&frame, &schema, &stats),
                    Extracted::Overflow { discarded } => {
                        stats.inc_overflow();
                        warn!(discarded, "residual buffer overflow, buffer cleared");
                    }
                }
            }
            stats.add_sync_drops(reassembler.sync_drops() - drops_before);
        }

        if let Some((snap, rate)) = reporter.maybe_report(&stats) {
            info!(link = %name, bytes_per_s = rate.round(), "{}", snap);
        }
    }

    info!(link = %name, totals = %stats.snapshot(), "stopped");
    transport.close().context("closing link")?;
    Ok(())
}

fn report_frame(frame: &Frame, schema: &PayloadSchema, stats: &MonitorStats) {
    if !frame.crc_ok() {
        stats.inc_crc_error();
        warn!(target: FRAME_LOG, frame_id = frame.frame_id, hex = %frame.to_hex(), "crc mismatch");
        return;
    }
    stats.inc_ok();
    match decode_payload(frame.frame_id, &frame.payload, schema) {
        Ok(fields) => info!(target: FRAME_LOG, frame_id = frame.frame_id, fields = ?fields, "frame"),
        Err(e) => {
            stats.inc_decode_error();
            warn!(target: FRAME_LOG, error = %e, hex = %frame.to_hex(), "undecoded frame");
        }
    }
}
