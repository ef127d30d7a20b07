use crate::frame::{Frame, HEADER, MAX_FRAME_LEN, OVERHEAD, decode};

pub const DEFAULT_MAX_BUFFER: usize = 4096;

/// Longest residue the buffer can hold while waiting: a header whose length
/// byte claims 255, one byte short of complete. Any cap at or above this
/// never overflows.
pub const MAX_WAITING: usize = u8::MAX as usize + OVERHEAD - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// A structurally complete frame; `frame.crc_ok()` tells whether it is valid.
    Frame { frame: Frame, consumed: usize },
    /// The residual buffer grew past its cap and was cleared.
    Overflow { discarded: usize },
}

/// Turns an append-only byte stream into frames. The output depends only on
/// the bytes appended, never on how they were split into chunks.
#[derive(Debug)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    max_buffer: usize,
    sync_drops: u64,
}

impl FrameReassembler {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_buffer.min(MAX_FRAME_LEN * 2)),
            max_buffer,
            sync_drops: 0,
        }
    }

    /// Append `chunk` and return a lazy iterator over whatever can now be extracted.
    pub fn feed<'a>(&'a mut self, chunk: &[u8]) -> Frames<'a> {
        self.push(chunk);
        Frames { inner: self }
    }

    /// Append without extracting; pair with [`next_frame`](Self::next_frame).
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes discarded while hunting for a header, over the lifetime of this instance.
    pub fn sync_drops(&self) -> u64 {
        self.sync_drops
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn next_frame(&mut self) -> Option<Extracted> {
        loop {
            match self.buf.iter().position(|&b| b == HEADER) {
                Some(0) => {}
                Some(n) => self.drop_front(n),
                None => {
                    let n = self.buf.len();
                    self.drop_front(n);
                    return None;
                }
            }

            if self.buf.len() < 3 {
                return self.wait_for_more();
            }
            let total = self.buf[2] as usize + OVERHEAD;
            if self.buf.len() < total {
                return self.wait_for_more();
            }
            let Ok(frame) = decode(&self.buf[..total]) else {
                // false header, skip it and rescan
                self.drop_front(1);
                continue;
            };
            self.buf.drain(..total);
            return Some(Extracted::Frame {
                frame,
                consumed: total,
            });
        }
    }

    /// Called only while the buffer holds less than one claimed frame, so
    /// the overflow branch needs `max_buffer < MAX_WAITING`.
    fn wait_for_more(&mut self) -> Option<Extracted> {
        if self.buf.len() > self.max_buffer {
            let discarded = self.buf.len();
            self.buf.clear();
            return Some(Extracted::Overflow { discarded });
        }
        None
    }

    fn drop_front(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.buf.drain(..n);
        self.sync_drops += n as u64;
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

pub struct Frames<'a> {
    inner: &'a mut FrameReassembler,
}

impl Iterator for Frames<'_> {
    type Item = Extracted;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode;
    use rand::Rng;

    fn frames_of(out: Vec<Extracted>) -> Vec<Frame> {
        out.into_iter()
            .filter_map(|e| match e {
                Extracted::Frame { frame, .. } => Some(frame),
                Extracted::Overflow { .. } => None,
            })
            .collect()
    }

    fn feed_in_chunks(stream: &[u8], sizes: &[usize]) -> (Vec<Frame>, u64) {
        let mut r = FrameReassembler::default();
        let mut out = Vec::new();
        let mut at = 0;
        let mut i = 0;
        while at < stream.len() {
            let n = sizes[i % sizes.len()].max(1).min(stream.len() - at);
            out.extend(r.feed(&stream[at..at + n]));
            at += n;
            i += 1;
        }
        (frames_of(out), r.sync_drops())
    }

    #[test]
    fn single_chunk_frame() {
        let bytes = encode(4, b"hello").unwrap();
        let mut r = FrameReassembler::default();
        let out: Vec<_> = r.feed(&bytes).collect();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Extracted::Frame { frame, consumed } => {
                assert_eq!(frame.frame_id, 4);
                assert_eq!(frame.payload, b"hello");
                assert!(frame.crc_ok());
                assert_eq!(*consumed, bytes.len());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.sync_drops(), 0);
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let mut rng = rand::thread_rng();
        let mut stream = vec![0x13, 0x37, 0xAA, 0x00, 0x00, 0x01];
        for id in 0..20u8 {
            let len = rng.gen_range(0..=64);
            let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            stream.extend(encode(id, &payload).unwrap());
            if id % 3 == 0 {
                stream.extend([0x01, 0x02]);
            }
        }

        let (whole, whole_drops) = feed_in_chunks(&stream, &[stream.len()]);
        assert_eq!(whole.len(), 20);
        let (bytewise, bytewise_drops) = feed_in_chunks(&stream, &[1]);
        assert_eq!(bytewise, whole);
        assert_eq!(bytewise_drops, whole_drops);

        for _ in 0..50 {
            let sizes: Vec<usize> = (0..7).map(|_| rng.gen_range(1..40)).collect();
            let (frames, drops) = feed_in_chunks(&stream, &sizes);
            assert_eq!(frames, whole);
            assert_eq!(drops, whole_drops);
        }
    }

    #[test]
    fn garbage_before_frame_counts_sync_drops() {
        let garbage = [0x00, 0x12, 0x55, 0xFE, 0x55, 0x01];
        let mut stream = garbage.to_vec();
        stream.extend(encode(2, &[9, 9]).unwrap());
        let (frames, drops) = feed_in_chunks(&stream, &[3]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![9, 9]);
        assert_eq!(drops, garbage.len() as u64);
    }

    #[test]
    fn false_header_in_garbage_is_skipped() {
        // 0xAA with length 0 claims a 6-byte frame whose sixth byte is not a tail
        let garbage = [0x01, 0xAA, 0x02, 0x00, 0x13];
        let mut stream = garbage.to_vec();
        stream.extend([0xAA, 0x01, 0x00, 0xFF, 0xFF, 0x55]);
        let chunkings: [&[usize]; 3] = [&[stream.len()], &[1], &[2, 5]];
        for sizes in chunkings {
            let (frames, drops) = feed_in_chunks(&stream, sizes);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].frame_id, 1);
            assert!(frames[0].crc_ok());
            assert_eq!(drops, garbage.len() as u64);
        }
    }

    #[test]
    fn crc_invalid_frame_is_consumed() {
        let mut bad = encode(5, &[1, 2, 3, 4]).unwrap();
        bad[3] ^= 0x80;
        let good = encode(6, &[]).unwrap();
        let mut stream = bad.clone();
        stream.extend(&good);
        let (frames, drops) = feed_in_chunks(&stream, &[4]);
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].crc_ok());
        assert!(frames[1].crc_ok());
        assert_eq!(drops, 0);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let bytes = encode(1, &[0u8; 10]).unwrap();
        let mut r = FrameReassembler::default();
        assert_eq!(r.feed(&bytes[..2]).count(), 0);
        assert_eq!(r.feed(&bytes[2..12]).count(), 0);
        assert_eq!(r.buffered(), 12);
        assert_eq!(r.feed(&bytes[12..]).count(), 1);
    }

    #[test]
    fn overflow_clears_buffer() {
        let mut r = FrameReassembler::new(8);
        // claims a 38-byte frame that never completes within the cap
        let out: Vec<_> = r.feed(&[0xAA, 0x01, 0x20, 0, 0, 0, 0, 0, 0, 0]).collect();
        assert_eq!(out, vec![Extracted::Overflow { discarded: 10 }]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn waiting_residue_is_bounded_by_one_claimed_frame() {
        let mut stalled = vec![0xAA, 0x01, 0xFF];
        stalled.resize(MAX_WAITING, 0x00);

        let mut roomy = FrameReassembler::new(MAX_WAITING);
        assert_eq!(roomy.feed(&stalled).count(), 0);
        assert_eq!(roomy.buffered(), MAX_WAITING);

        let mut tight = FrameReassembler::new(MAX_FRAME_LEN);
        let out: Vec<_> = tight.feed(&stalled).collect();
        assert_eq!(out, vec![Extracted::Overflow { discarded: MAX_WAITING }]);
    }

    #[test]
    fn stream_without_header_never_accumulates() {
        let mut r = FrameReassembler::new(16);
        for _ in 0..10 {
            assert_eq!(r.feed(&[0x00; 32]).count(), 0);
        }
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.sync_drops(), 320);
    }
}
