use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no payload format registered for frame id {0:#04x}")]
    UnknownFrameId(u8),
    #[error("frame id {frame_id:#04x} expects {expected} payload bytes, got {actual}")]
    Unpack {
        frame_id: u8,
        expected: usize,
        actual: usize,
    },
    #[error("bad payload format {format:?}: {reason}")]
    BadFormat { format: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    /// Skipped byte, produces no value.
    Pad,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 | FieldKind::Pad => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 | FieldKind::I64 => 8,
        }
    }

    fn signed(self) -> bool {
        matches!(
            self,
            FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64
        )
    }

    fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'B' => FieldKind::U8,
            'b' => FieldKind::I8,
            'H' => FieldKind::U16,
            'h' => FieldKind::I16,
            'I' | 'L' => FieldKind::U32,
            'i' | 'l' => FieldKind::I32,
            'Q' => FieldKind::U64,
            'q' => FieldKind::I64,
            'x' => FieldKind::Pad,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned(v) => write!(f, "{}", v),
            FieldValue::Signed(v) => write!(f, "{}", v),
        }
    }
}

/// Fixed-width payload layout written as a struct-style format string,
/// e.g. `"<6I"` or `"32B"`. An optional leading `<`, `=` or `@` selects
/// little-endian (the default), `>` or `!` big-endian. Fields are packed
/// without alignment padding; use `x` for explicit pad bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFormat {
    order: ByteOrder,
    fields: Vec<FieldKind>,
    width: usize,
}

impl FieldFormat {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    fn unpack(&self, frame_id: u8, payload: &[u8]) -> Result<Vec<FieldValue>, DecodeError> {
        if payload.len() != self.width {
            return Err(DecodeError::Unpack {
                frame_id,
                expected: self.width,
                actual: payload.len(),
            });
        }
        let mut out = Vec::with_capacity(self.fields.len());
        let mut at = 0;
        for &kind in &self.fields {
            let w = kind.width();
            let raw = &payload[at..at + w];
            at += w;
            if kind == FieldKind::Pad {
                continue;
            }
            let mut word = [0u8; 8];
            let unsigned = match self.order {
                ByteOrder::Little => {
                    word[..w].copy_from_slice(raw);
                    u64::from_le_bytes(word)
                }
                ByteOrder::Big => {
                    word[8 - w..].copy_from_slice(raw);
                    u64::from_be_bytes(word)
                }
            };
            out.push(if kind.signed() {
                // sign-extend from the field width
                let shift = 64 - 8 * w as u32;
                FieldValue::Signed(((unsigned << shift) as i64) >> shift)
            } else {
                FieldValue::Unsigned(unsigned)
            });
        }
        Ok(out)
    }
}

impl FromStr for FieldFormat {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: String| DecodeError::BadFormat {
            format: s.to_string(),
            reason,
        };
        let mut chars = s.trim().chars().peekable();
        let order = match chars.peek() {
            Some('<' | '=' | '@') => {
                chars.next();
                ByteOrder::Little
            }
            Some('>' | '!') => {
                chars.next();
                ByteOrder::Big
            }
            _ => ByteOrder::Little,
        };

        let too_wide = || {
            bad(format!(
                "width exceeds the {} byte payload limit",
                crate::frame::MAX_PAYLOAD
            ))
        };
        let mut fields = Vec::new();
        let mut width = 0usize;
        let mut count: Option<usize> = None;
        for c in chars {
            if let Some(d) = c.to_digit(10) {
                let n = count
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(d as usize))
                    .ok_or_else(|| bad("repeat count too large".into()))?;
                count = Some(n);
                continue;
            }
            if c.is_whitespace() {
                if count.is_some() {
                    return Err(bad("repeat count not followed by a field".into()));
                }
                continue;
            }
            let kind = FieldKind::from_code(c).ok_or_else(|| bad(format!("unsupported field code '{}'", c)))?;
            let n = count.take().unwrap_or(1);
            width = n
                .checked_mul(kind.width())
                .and_then(|w| w.checked_add(width))
                .filter(|&w| w <= crate::frame::MAX_PAYLOAD)
                .ok_or_else(too_wide)?;
            fields.extend(std::iter::repeat_n(kind, n));
        }
        if count.is_some() {
            return Err(bad("trailing repeat count".into()));
        }
        Ok(FieldFormat {
            order,
            fields,
            width,
        })
    }
}

/// Read-only mapping from frame id to payload layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadSchema {
    formats: BTreeMap<u8, FieldFormat>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_strings<'a, I>(entries: I) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = (u8, &'a str)>,
    {
        let mut schema = Self::new();
        for (id, fmt) in entries {
            schema.insert(id, fmt.parse()?);
        }
        Ok(schema)
    }

    pub fn insert(&mut self, frame_id: u8, format: FieldFormat) {
        self.formats.insert(frame_id, format);
    }

    pub fn get(&self, frame_id: u8) -> Option<&FieldFormat> {
        self.formats.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

pub fn decode_payload(
    frame_id: u8,
    payload: &[u8],
    schema: &PayloadSchema,
) -> Result<Vec<FieldValue>, DecodeError> {
    schema
        .get(frame_id)
        .ok_or(DecodeError::UnknownFrameId(frame_id))?
        .unpack(frame_id, payload)
}
