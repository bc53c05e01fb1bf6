// src/signal.rs
//
// Signal codec for virtual CAN channels. Maps engineering values to and from
// byte fields inside an 8-byte CAN payload, described by a ChannelMapping.
// Field offsets are defined against the byte-swapped (normalized) payload;
// decode swaps the container before extraction, encode writes without the
// swap. That asymmetry matches the mapping tables this codec was built for
// and must not be "fixed" independently of them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::conversions::Conversion;
use crate::io::MAX_11_BIT_ID;

// ============================================================================
// Types
// ============================================================================

/// Interpretation of the raw bytes of a channel field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Unsigned,
    Signed,
    Float,
    SignMagnitude,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceType::Unsigned => "unsigned",
            SourceType::Signed => "signed",
            SourceType::Float => "float",
            SourceType::SignMagnitude => "sign_magnitude",
        };
        write!(f, "{}", name)
    }
}

/// Placement and scaling of one virtual channel inside a CAN frame.
///
/// `offset` and `length` are in bytes against the normalized 8-byte payload,
/// with `offset + length <= 8`. The linear formula is applied in the same
/// direction on both decode and encode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub id: u32,
    pub can_id: u32,
    pub offset: u8,
    pub length: u8,
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    #[serde(default = "default_big_endian")]
    pub is_big_endian: bool,
    #[serde(default = "default_multiplier")]
    pub formula_multiplier: f64,
    #[serde(default)]
    pub formula_divider: f64,
    #[serde(default)]
    pub formula_const: f64,
    #[serde(default)]
    pub conversion: Conversion,
    #[serde(default = "default_frequency_ms")]
    pub virtual_frequency_ms: u64,
    #[serde(default)]
    pub channel_name: String,
}

fn default_source_type() -> SourceType {
    SourceType::Unsigned
}
fn default_big_endian() -> bool {
    true
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_frequency_ms() -> u64 {
    1000
}

/// Latest engineering value observed for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: u32,
    pub value: f32,
    pub timestamp_us: u64,
}

/// Errors raised by the codec and the broadcast scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalError {
    /// Field width not supported for this source type (e.g. 3-byte signed).
    UnsupportedWidth { source_type: SourceType, length: u8 },
    /// Source type has no encoder.
    UnsupportedSourceType(SourceType),
    /// Bitrate string did not match any of the nine standard CAN speeds.
    UnsupportedBitrate(String),
    /// Broadcast started while already running.
    DuplicateStart,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::UnsupportedWidth {
                source_type,
                length,
            } => write!(f, "{} field width {} unsupported", source_type, length),
            SignalError::UnsupportedSourceType(source_type) => {
                write!(f, "source type {} cannot be encoded", source_type)
            }
            SignalError::UnsupportedBitrate(text) => {
                write!(f, "unsupported CAN bitrate: {}", text)
            }
            SignalError::DuplicateStart => write!(f, "broadcast already started"),
        }
    }
}

impl std::error::Error for SignalError {}

// ============================================================================
// Codec
// ============================================================================

/// Contiguous byte mask for a field, left-shifted into place.
fn field_mask(offset: u8, length: u8) -> u64 {
    (u64::MAX >> ((8 - length as u32) * 8)) << (offset as u32 * 8)
}

/// Pull the raw field bytes out of a payload, right-aligned.
/// The container is byte-swapped first so offsets count from the
/// most significant end of the wire representation.
fn extract_field(payload: u64, mapping: &ChannelMapping) -> u64 {
    let data = payload.swap_bytes();
    let mask = field_mask(mapping.offset, mapping.length);
    let mut field = (data & mask) >> (mapping.offset as u32 * 8);
    if !mapping.is_big_endian {
        field = field.swap_bytes();
    }
    field
}

/// Linear scaling shared by decode and encode. A divider of 0 disables
/// the division step rather than producing infinity.
fn run_formula(value: f64, mapping: &ChannelMapping) -> f64 {
    let mut value = value * mapping.formula_multiplier;
    if mapping.formula_divider != 0.0 {
        value /= mapping.formula_divider;
    }
    value + mapping.formula_const
}

/// Decode one channel's engineering value from a packed 8-byte payload.
pub fn decode_value(payload: u64, mapping: &ChannelMapping) -> Result<f32, SignalError> {
    let field = extract_field(payload, mapping);
    let value: f64 = match mapping.source_type {
        SourceType::Unsigned => field as f64,
        SourceType::Signed => match mapping.length {
            2 => (field as u16 as i16) as f64,
            4 => (field as u32 as i32) as f64,
            _ => {
                return Err(SignalError::UnsupportedWidth {
                    source_type: mapping.source_type,
                    length: mapping.length,
                })
            }
        },
        SourceType::Float => {
            if mapping.length != 4 {
                return Err(SignalError::UnsupportedWidth {
                    source_type: mapping.source_type,
                    length: mapping.length,
                });
            }
            f32::from_bits(field as u32) as f64
        }
        SourceType::SignMagnitude => {
            // Sign bit plus absolute magnitude, e.g. the BMW E46 steering
            // angle sensor.
            let sign = 1u64 << (mapping.length as u32 * 8 - 1);
            if field < sign {
                field as f64
            } else {
                -((field & (sign - 1)) as f64)
            }
        }
    };
    let value = run_formula(value, mapping) as f32;
    Ok(crate::conversions::convert(value, mapping.conversion))
}

/// Fold one channel's engineering value into a packed payload, leaving
/// bytes outside the mapping's field untouched.
pub fn encode_value(payload: u64, value: f32, mapping: &ChannelMapping) -> Result<u64, SignalError> {
    let scaled = run_formula(value as f64, mapping);
    let rep: u64 = match mapping.source_type {
        SourceType::Unsigned => match mapping.length {
            1 => scaled as u8 as u64,
            2 => scaled as u16 as u64,
            3 | 4 => scaled as u32 as u64,
            _ => {
                return Err(SignalError::UnsupportedWidth {
                    source_type: mapping.source_type,
                    length: mapping.length,
                })
            }
        },
        SourceType::Signed => match mapping.length {
            2 => scaled as i16 as u16 as u64,
            4 => scaled as i32 as u32 as u64,
            _ => {
                return Err(SignalError::UnsupportedWidth {
                    source_type: mapping.source_type,
                    length: mapping.length,
                })
            }
        },
        SourceType::Float => {
            if mapping.length != 4 {
                return Err(SignalError::UnsupportedWidth {
                    source_type: mapping.source_type,
                    length: mapping.length,
                });
            }
            (scaled as f32).to_bits() as u64
        }
        SourceType::SignMagnitude => {
            return Err(SignalError::UnsupportedSourceType(mapping.source_type))
        }
    };
    let mask = field_mask(mapping.offset, mapping.length);
    // Clamp the representation to the field width so a wide cast cannot
    // bleed into neighbouring channels.
    let rep = rep & (mask >> (mapping.offset as u32 * 8));
    Ok((payload & !mask) | (rep << (mapping.offset as u32 * 8)))
}

// ============================================================================
// Text helpers
// ============================================================================

/// Render a CAN id for the wire tools: 3 hex digits for an 11-bit id,
/// 8 hex digits for a 29-bit id.
pub fn format_can_id(can_id: u32) -> String {
    if can_id > MAX_11_BIT_ID {
        format!("{:08X}", can_id)
    } else {
        format!("{:03X}", can_id)
    }
}

/// Render the low `length` bytes of a packed payload as hex byte pairs,
/// most significant byte first.
pub fn format_payload(data: u64, length: u8) -> String {
    let bytes = data.to_le_bytes();
    let mut out = String::with_capacity(length as usize * 2);
    for i in (0..length.min(8)).rev() {
        out.push_str(&format!("{:02X}", bytes[i as usize]));
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::pican::parser::parse_dump_line;

    fn mapping(offset: u8, length: u8, source_type: SourceType) -> ChannelMapping {
        ChannelMapping {
            id: 1,
            can_id: 0x123,
            offset,
            length,
            source_type,
            is_big_endian: true,
            formula_multiplier: 1.0,
            formula_divider: 0.0,
            formula_const: 0.0,
            conversion: Conversion::None,
            virtual_frequency_ms: 100,
            channel_name: "test".to_string(),
        }
    }

    /// Payload whose normalized (byte-swapped) form equals `normalized`.
    fn payload_from_normalized(normalized: u64) -> u64 {
        normalized.swap_bytes()
    }

    #[test]
    fn test_field_mask() {
        assert_eq!(field_mask(0, 1), 0xFF);
        assert_eq!(field_mask(0, 2), 0xFFFF);
        assert_eq!(field_mask(2, 2), 0xFFFF_0000);
        assert_eq!(field_mask(7, 1), 0xFF00_0000_0000_0000);
        assert_eq!(field_mask(0, 8), u64::MAX);
    }

    #[test]
    fn test_swap_involution() {
        // Normalizing twice must give back the wire payload
        for x in [0u64, u64::MAX, 0x0102_0304_0506_0708, 0x00FF_00AA_1200_0001] {
            assert_eq!(x.swap_bytes().swap_bytes(), x);
        }
    }

    #[test]
    fn test_decode_unsigned() {
        let payload = payload_from_normalized(0x0102_0304_0506_0708);
        let m = mapping(0, 2, SourceType::Unsigned);
        assert_eq!(decode_value(payload, &m).unwrap(), 0x0708 as f32);

        let m = mapping(6, 2, SourceType::Unsigned);
        assert_eq!(decode_value(payload, &m).unwrap(), 0x0102 as f32);

        let m = mapping(3, 1, SourceType::Unsigned);
        assert_eq!(decode_value(payload, &m).unwrap(), 0x05 as f32);
    }

    #[test]
    fn test_decode_signed() {
        let payload = payload_from_normalized(0xFF38);
        let m = mapping(0, 2, SourceType::Signed);
        assert_eq!(decode_value(payload, &m).unwrap(), -200.0);

        let payload = payload_from_normalized(0xFFFF_FF38);
        let m = mapping(0, 4, SourceType::Signed);
        assert_eq!(decode_value(payload, &m).unwrap(), -200.0);
    }

    #[test]
    fn test_decode_signed_odd_width_fails() {
        let payload = payload_from_normalized(0x01_0203);
        for length in [1, 3] {
            let m = mapping(0, length, SourceType::Signed);
            assert_eq!(
                decode_value(payload, &m),
                Err(SignalError::UnsupportedWidth {
                    source_type: SourceType::Signed,
                    length,
                })
            );
        }
    }

    #[test]
    fn test_decode_float() {
        let bits = 9.25f32.to_bits() as u64;
        let payload = payload_from_normalized(bits);
        let m = mapping(0, 4, SourceType::Float);
        assert_eq!(decode_value(payload, &m).unwrap(), 9.25);

        let m = mapping(0, 2, SourceType::Float);
        assert!(matches!(
            decode_value(payload, &m),
            Err(SignalError::UnsupportedWidth { .. })
        ));
    }

    #[test]
    fn test_decode_sign_magnitude() {
        let m = mapping(0, 2, SourceType::SignMagnitude);

        // Sign bit alone is zero magnitude
        assert_eq!(
            decode_value(payload_from_normalized(0x8000), &m).unwrap(),
            0.0
        );
        assert_eq!(decode_value(payload_from_normalized(0), &m).unwrap(), 0.0);
        assert_eq!(
            decode_value(payload_from_normalized(0x0005), &m).unwrap(),
            5.0
        );
        assert_eq!(
            decode_value(payload_from_normalized(0x8005), &m).unwrap(),
            -5.0
        );
    }

    #[test]
    fn test_formula() {
        let payload = payload_from_normalized(100);
        let mut m = mapping(0, 2, SourceType::Unsigned);
        m.formula_multiplier = 0.1;
        m.formula_const = 32.0;
        assert!((decode_value(payload, &m).unwrap() - 42.0).abs() < 1e-5);

        let mut m = mapping(0, 2, SourceType::Unsigned);
        m.formula_divider = 4.0;
        assert_eq!(decode_value(payload, &m).unwrap(), 25.0);
    }

    #[test]
    fn test_encode_preserves_neighbours() {
        let m = mapping(2, 1, SourceType::Unsigned);
        let payload = encode_value(u64::MAX, 0x12 as f32, &m).unwrap();
        assert_eq!(payload, 0xFFFF_FFFF_FF12_FFFF);
    }

    #[test]
    fn test_encode_signed() {
        let m = mapping(0, 2, SourceType::Signed);
        let payload = encode_value(0, -200.0, &m).unwrap();
        assert_eq!(payload, 0xFF38);

        for length in [1, 3] {
            let m = mapping(0, length, SourceType::Signed);
            assert!(matches!(
                encode_value(0, 1.0, &m),
                Err(SignalError::UnsupportedWidth { .. })
            ));
        }
    }

    #[test]
    fn test_encode_three_byte_field_stays_in_bounds() {
        let m = mapping(1, 3, SourceType::Unsigned);
        let payload = encode_value(0, 16_777_215.0, &m).unwrap();
        assert_eq!(payload, 0x0000_0000_FFFF_FF00);
    }

    #[test]
    fn test_encode_sign_magnitude_fails() {
        let m = mapping(0, 2, SourceType::SignMagnitude);
        assert_eq!(
            encode_value(0, 1.0, &m),
            Err(SignalError::UnsupportedSourceType(SourceType::SignMagnitude))
        );
    }

    #[test]
    fn test_encode_float() {
        let m = mapping(4, 4, SourceType::Float);
        let payload = encode_value(0, 9.25, &m).unwrap();
        assert_eq!(payload, (9.25f32.to_bits() as u64) << 32);
    }

    /// Values survive the full path out to the wire text and back in:
    /// encode, render all eight bytes the way the dump tool prints them,
    /// reparse, decode.
    #[test]
    fn test_unsigned_wire_round_trip() {
        let cases: [(u8, u8, f32); 5] = [
            (0, 1, 200.0),
            (3, 1, 7.0),
            (7, 1, 31.0),
            (0, 2, 1800.0),
            (2, 4, 123_456.0),
        ];
        for (offset, length, value) in cases {
            let m = mapping(offset, length, SourceType::Unsigned);
            let base = 0x1122_3344_5566_7788u64;
            let encoded = encode_value(base, value, &m).unwrap();

            // Bits outside the field are untouched
            let mask = field_mask(offset, length);
            assert_eq!(encoded & !mask, base & !mask);

            let line = format!("can0 123 [8] {}", format_payload(encoded, 8));
            let msg = parse_dump_line(&line).unwrap();
            let decoded = decode_value(msg.payload(), &m).unwrap();
            assert!(
                (decoded - value).abs() < 1e-3,
                "offset {} length {}: {} != {}",
                offset,
                length,
                decoded,
                value
            );
        }
    }

    #[test]
    fn test_format_can_id() {
        assert_eq!(format_can_id(0x123), "123");
        assert_eq!(format_can_id(0x7FF), "7FF");
        assert_eq!(format_can_id(0x800), "00000800");
        assert_eq!(format_can_id(0x18FF_0102), "18FF0102");
    }

    #[test]
    fn test_format_payload() {
        assert_eq!(format_payload(0x0102_0304, 4), "01020304");
        assert_eq!(format_payload(0xAABB, 2), "AABB");
        assert_eq!(format_payload(0xAABB, 1), "BB");
        assert_eq!(format_payload(0x05, 8), "0000000000000005");
    }
}
