use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::info;

use crate::monitor::DutEvent;

/// One tab-separated line per event: `unix_ms dut kind detail`.
/// Frames carry their id and the decoded fields joined by `;`.
pub fn format_event(ts_ms: u128, event: &DutEvent) -> String {
    match event {
        DutEvent::Frame { dut, frame, fields } => {
            let fields: Vec<String> = fields.iter().map(|v| v.to_string()).collect();
            format!("{}\t{}\tframe\t{}\t{}", ts_ms, dut, frame.frame_id, fields.join(";"))
        }
        DutEvent::Fault { dut, fault } => format!("{}\t{}\tfault\t{}", ts_ms, dut, fault),
        DutEvent::Recovery { dut, reason } => format!("{}\t{}\trecovery\t{}", ts_ms, dut, reason),
        DutEvent::Stopped { dut, reason } => format!("{}\t{}\tstopped\t{}", ts_ms, dut, reason),
    }
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Drains `events` into `out` until every sender is gone. Returns the line count.
pub fn write_events<W: Write>(out: W, events: Receiver<DutEvent>) -> io::Result<u64> {
    let mut out = BufWriter::new(out);
    let mut lines = 0u64;
    for event in events.iter() {
        writeln!(out, "{}", format_event(unix_ms(), &event))?;
        lines += 1;
        if events.is_empty() {
            out.flush()?;
        }
    }
    out.flush()?;
    Ok(lines)
}

/// Append events to `path` on a background thread.
pub fn spawn(path: &Path, events: Receiver<DutEvent>) -> Result<JoinHandle<io::Result<u64>>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening data log {}", path.display()))?;
    info!(path = %path.display(), "writing frame data log");
    thread::Builder::new()
        .name("data-log".into())
        .spawn(move || write_events(file, events))
        .context("spawning data log writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, encode};
    use crate::monitor::{Fault, RecoveryReason};
    use crate::schema::FieldValue;

    #[test]
    fn events_render_as_tab_separated_lines() {
        let frame = decode(&encode(16, &[1, 2]).unwrap()).unwrap();
        let line = format_event(
            42,
            &DutEvent::Frame {
                dut: "dut0".into(),
                frame,
                fields: vec![FieldValue::Unsigned(1), FieldValue::Signed(-2)],
            },
        );
        assert_eq!(line, "42\tdut0\tframe\t16\t1;-2");

        let line = format_event(
            7,
            &DutEvent::Recovery {
                dut: "dut1".into(),
                reason: RecoveryReason::CrcErrors(10),
            },
        );
        assert_eq!(line, "7\tdut1\trecovery\t10 consecutive crc errors");
    }

    #[test]
    fn writer_drains_until_senders_drop() {
        let (tx, rx) = crossbeam_channel::unbounded();
        for n in 0..3 {
            tx.send(DutEvent::Fault {
                dut: "d".into(),
                fault: Fault::FrameSyncDrop(n),
            })
            .unwrap();
        }
        drop(tx);
        let mut out = Vec::new();
        assert_eq!(write_events(&mut out, rx).unwrap(), 3);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|l| l.contains("\td\tfault\tdropped ")));
    }
}
