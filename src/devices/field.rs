// MIT License - Copyright (c) 2026 Peter Wright
// State frame field decoding

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Status bits carried in single-byte state fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusBits: u8 {
        /// Power / heating / valve bit
        const POWER    = 0b0000_0001;
        /// Plug standby-power cutoff
        const IDLE_CUT = 0b0001_0000;
    }
}

/// How a state byte maps to attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// 8 bits → `name1..name8`, `ON`/`OFF`
    Bitmap,
    /// bit0 → `ON`/`OFF`
    Toggle,
    /// bit0 → `OFF`/`ON`
    Invert,
    /// bit4 → `ON`/`OFF`
    Toggle2,
    /// 0 → 5, anything else → 6 (the fan's power command codes)
    FanToggle,
    /// 1..=4 → high/medium/low/auto, otherwise suppressed
    FanSpeed,
    /// bit0 → `heat`/`off`
    HeatToggle,
    /// raw byte
    Value,
    /// big-endian u16 of the preceding byte and this one
    TwoByte,
    /// three bytes rendered as hex digits (6-digit meter reading)
    SixDecimal,
}

/// One decoded field of a state frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub attribute: &'static str,
    pub offset: usize,
    pub pattern: Pattern,
}

impl FieldDescriptor {
    pub const fn new(attribute: &'static str, offset: usize, pattern: Pattern) -> Self {
        Self {
            attribute,
            offset,
            pattern,
        }
    }
}

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(&'static str),
    Number(u16),
    Hex(String),
}

impl FieldValue {
    /// Empty values are never published.
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.is_empty())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Hex(s) => f.write_str(s),
        }
    }
}

fn on_off(on: bool) -> FieldValue {
    FieldValue::Text(if on { "ON" } else { "OFF" })
}

/// Decode one field of a validated state frame into `(attribute, value)` pairs.
///
/// A field whose offset lies outside the frame yields nothing.
pub fn decode(field: &FieldDescriptor, frame: &[u8]) -> Vec<(String, FieldValue)> {
    let Some(&byte) = frame.get(field.offset) else {
        return Vec::new();
    };
    let bits = StatusBits::from_bits_retain(byte);
    let attr = field.attribute;

    let value = match field.pattern {
        Pattern::Bitmap => {
            return (0..8)
                .map(|i| (format!("{attr}{}", i + 1), on_off(byte & (1 << i) != 0)))
                .collect();
        }
        Pattern::Toggle => on_off(bits.contains(StatusBits::POWER)),
        Pattern::Invert => on_off(!bits.contains(StatusBits::POWER)),
        Pattern::Toggle2 => on_off(bits.contains(StatusBits::IDLE_CUT)),
        Pattern::FanToggle => FieldValue::Number(if byte == 0 { 5 } else { 6 }),
        Pattern::FanSpeed => FieldValue::Text(match byte {
            1 => "high",
            2 => "medium",
            3 => "low",
            4 => "auto",
            _ => "",
        }),
        Pattern::HeatToggle => FieldValue::Text(if bits.contains(StatusBits::POWER) {
            "heat"
        } else {
            "off"
        }),
        Pattern::Value => FieldValue::Number(byte as u16),
        Pattern::TwoByte => {
            let Some(high) = field.offset.checked_sub(1).and_then(|i| frame.get(i)) else {
                return Vec::new();
            };
            FieldValue::Number(((*high as u16) << 8) | byte as u16)
        }
        Pattern::SixDecimal => {
            let Some(digits) = frame.get(field.offset..field.offset + 3) else {
                return Vec::new();
            };
            FieldValue::Hex(crate::protocol::hex(digits))
        }
    };

    vec![(attr.to_string(), value)]
}
