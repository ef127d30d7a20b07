use anyhow::{Context, Result, bail};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::{EmitOpts, Pacing};
use crate::frame::{FrameError, MAX_PAYLOAD, encode, hex};
use crate::port::open_port;

/// Sequence number (little endian) followed by a rolling byte pattern.
fn synth_payload(seq: u64, len: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = seq.to_le_bytes().into_iter().take(len).collect();
    payload.extend((payload.len()..len).map(|i| (i as u64).wrapping_add(seq) as u8));
    payload
}

/// Build frame `seq`, flipping one CRC bit on every `corrupt_every`-th frame.
pub fn synth_frame(
    frame_id: u8,
    seq: u64,
    len: usize,
    corrupt_every: Option<u64>,
) -> Result<Vec<u8>, FrameError> {
    let mut bytes = encode(frame_id, &synth_payload(seq, len))?;
    if let Some(n) = corrupt_every
        && n > 0
        && (seq + 1) % n == 0
    {
        let crc_lo = bytes.len() - 2;
        bytes[crc_lo] ^= 0x01;
    }
    Ok(bytes)
}

pub fn run(opts: EmitOpts) -> Result<()> {
    if opts.len > MAX_PAYLOAD {
        bail!("payload length {} exceeds {}", opts.len, MAX_PAYLOAD);
    }
    let mut port = open_port(
        &opts.ser.dev,
        opts.ser.baud,
        opts.ser.rtscts,
        Duration::from_millis(100),
    )?;
    let pacing = Pacing::from_cli(&opts.gap, opts.util)?;

    info!(
        dev = %opts.ser.dev,
        baud = opts.ser.baud,
        frame_id = opts.frame_id,
        len = opts.len,
        gap = %opts.gap,
        corrupt_every = ?opts.corrupt_every,
        "emitting frames"
    );

    let mut seq: u64 = 0;
    while opts.count.is_none_or(|count| seq < count) {
        let frame = synth_frame(opts.frame_id, seq, opts.len, opts.corrupt_every)?;
        port.write_all(&frame).context("serial write")?;
        debug!(seq, frame = %hex(&frame), "sent");

        if let Some(sleep) = pacing.sleep_for(frame.len(), opts.bpb, opts.ser.baud) {
            std::thread::sleep(sleep);
        }
        seq = seq.wrapping_add(1);
    }
    port.flush().context("serial flush")?;
    info!(frames = seq, "done");
    Ok(())
}
