use thiserror::Error;

pub const HEADER: u8 = 0xAA;
pub const TAIL: u8 = 0x55;
/// Header, id, length, two CRC bytes and tail.
pub const OVERHEAD: usize = 6;
pub const MAX_PAYLOAD: usize = 250;
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD + OVERHEAD;

const CRC_POLY: u16 = 0x1021;
const CRC_INITIAL_REMAINDER: u16 = 0xFFFF;
const CRC_FINAL_XOR: u16 = 0x0000;

static CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut rem = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            rem = if rem & 0x8000 != 0 {
                (rem << 1) ^ CRC_POLY
            } else {
                rem << 1
            };
            bit += 1;
        }
        table[i] = rem;
        i += 1;
    }
    table
}

/// CRC-16 over `payload`: CCITT table, 0xFFFF initial remainder, no final XOR.
pub fn crc16(payload: &[u8]) -> u16 {
    let mut rem = CRC_INITIAL_REMAINDER;
    for &b in payload {
        let idx = (b ^ (rem >> 8) as u8) as usize;
        rem = CRC_TABLE[idx] ^ (rem << 8);
    }
    rem ^ CRC_FINAL_XOR
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    PayloadTooLong(usize),
    #[error("expected header 0xaa, found {0:#04x}")]
    BadHeader(u8),
    #[error("expected tail 0x55, found {0:#04x}")]
    BadTail(u8),
    #[error("frame needs {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("frame is {have} bytes but its length field implies {need}")]
    TrailingBytes { need: usize, have: usize },
}

/// One structurally complete frame. The CRC is kept as received, so a frame
/// with a bad checksum is still representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_id: u8,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl Frame {
    pub fn crc_ok(&self) -> bool {
        crc16(&self.payload) == self.crc
    }

    /// `aa,<id>,0x<len>,<payload>,<crc>,55`
    pub fn to_hex(&self) -> String {
        format!(
            "{:02x},{:02x},0x{:02x},{},{:04x},{:02x}",
            HEADER,
            self.frame_id,
            self.payload.len(),
            hex(&self.payload),
            self.crc,
            TAIL
        )
    }
}

pub fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub fn encode(frame_id: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len() + OVERHEAD);
    out.push(HEADER);
    out.push(frame_id);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc16(payload).to_be_bytes());
    out.push(TAIL);
    Ok(out)
}

/// Decode exactly one frame occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < OVERHEAD {
        return Err(FrameError::Truncated {
            need: OVERHEAD,
            have: bytes.len(),
        });
    }
    if bytes[0] != HEADER {
        return Err(FrameError::BadHeader(bytes[0]));
    }
    let need = bytes[2] as usize + OVERHEAD;
    if bytes.len() < need {
        return Err(FrameError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    if bytes.len() > need {
        return Err(FrameError::TrailingBytes {
            need,
            have: bytes.len(),
        });
    }
    let tail = bytes[need - 1];
    if tail != TAIL {
        return Err(FrameError::BadTail(tail));
    }
    Ok(split_frame(bytes))
}

/// Caller guarantees `bytes` is exactly `len + 6` long with header and tail in place.
fn split_frame(bytes: &[u8]) -> Frame {
    let len = bytes[2] as usize;
    let crc_at = 3 + len;
    Frame {
        frame_id: bytes[1],
        payload: bytes[3..crc_at].to_vec(),
        crc: u16::from_be_bytes([bytes[crc_at], bytes[crc_at + 1]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn crc_of_empty_payload_is_initial_remainder() {
        assert_eq!(crc16(b""), 0xFFFF);
        let f = decode(&[0xAA, 0x01, 0x00, 0xFF, 0xFF, 0x55]).unwrap();
        assert_eq!(f.frame_id, 1);
        assert!(f.payload.is_empty());
        assert!(f.crc_ok());
    }

    #[test]
    fn crc_matches_ccitt_false_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(CRC_TABLE[1], 0x1021);
        assert_eq!(CRC_TABLE[255], 0x1EF0);
    }

    #[test]
    fn single_bit_flips_change_crc() {
        let payload: Vec<u8> = (0u8..40).map(|i| i.wrapping_mul(37)).collect();
        let base = crc16(&payload);
        for byte in 0..payload.len() {
            for bit in 0..8 {
                let mut p = payload.clone();
                p[byte] ^= 1 << bit;
                assert_ne!(crc16(&p), base, "flip byte {} bit {}", byte, bit);
            }
        }
    }

    #[test]
    fn encode_layout() {
        let bytes = encode(0x10, &[1, 2, 3]).unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[..6], &[0xAA, 0x10, 3, 1, 2, 3]);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), crc16(&[1, 2, 3]));
        assert_eq!(bytes[8], 0x55);
    }

    #[test]
    fn roundtrip_all_lengths() {
        let mut rng = rand::thread_rng();
        for len in 0..=MAX_PAYLOAD {
            let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let id: u8 = rng.r#gen();
            let f = decode(&encode(id, &payload).unwrap()).unwrap();
            assert_eq!(f.frame_id, id);
            assert_eq!(f.payload, payload);
            assert!(f.crc_ok());
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        assert_eq!(
            encode(0, &[0u8; 251]),
            Err(FrameError::PayloadTooLong(251))
        );
    }

    #[test]
    fn decode_reports_structural_errors() {
        assert!(matches!(
            decode(&[0xAB, 0, 0, 0, 0, 0x55]),
            Err(FrameError::BadHeader(0xAB))
        ));
        assert!(matches!(
            decode(&[0xAA, 0, 0, 0xFF, 0xFF, 0x54]),
            Err(FrameError::BadTail(0x54))
        ));
        assert!(matches!(
            decode(&[0xAA, 0, 2, 0, 0, 0x55]),
            Err(FrameError::Truncated { need: 8, have: 6 })
        ));
    }

    #[test]
    fn corrupted_crc_is_still_a_frame() {
        let mut bytes = encode(3, b"abc").unwrap();
        bytes[4] ^= 0x01;
        let f = decode(&bytes).unwrap();
        assert!(!f.crc_ok());
        assert_eq!(f.payload, b"abc");
    }

    #[test]
    fn hex_rendering() {
        let f = decode(&encode(1, &[0xDE, 0xAD]).unwrap()).unwrap();
        let crc = crc16(&[0xDE, 0xAD]);
        assert_eq!(f.to_hex(), format!("aa,01,0x02,dead,{:04x},55", crc));
    }
}
