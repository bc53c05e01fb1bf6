// src/io/slcan/parser.rs
//
// Frame assembly for the slcan ASCII wire format. A single serial read may
// carry zero, one, or several frames and may stop mid-frame; the buffer
// keeps the unterminated tail until the next read completes it.

use crate::io::{now_us, CanMessage, IdLength};

/// Carry-over buffer that turns raw serial chunks into parsed messages.
#[derive(Default)]
pub struct AsciiFrameBuffer {
    carry: String,
}

impl AsciiFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk and drain every complete frame from the buffer.
    /// The trailing unterminated segment, if any, is retained.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<CanMessage> {
        self.carry.push_str(&String::from_utf8_lossy(bytes));
        if !self.carry.contains('\r') {
            return Vec::new();
        }
        let working = std::mem::take(&mut self.carry);
        let mut segments: Vec<&str> = working.split('\r').collect();
        if let Some(tail) = segments.pop() {
            // Empty when the chunk ended on a terminator
            self.carry.push_str(tail);
        }
        segments
            .iter()
            .filter_map(|segment| parse_segment(segment))
            .collect()
    }
}

/// Parse one terminated segment.
///
/// `T` carries an 8-hex-digit 29-bit id, `t` a 3-hex-digit 11-bit id; the
/// next character is a single decimal data length 0-8 followed by that many
/// hex byte pairs. The bytes are zero-padded to 8 and byte-order reversed
/// before packing so the payload reads in wire order. Segments that do not
/// fit the grammar are noise from the adapter and are dropped silently.
fn parse_segment(segment: &str) -> Option<CanMessage> {
    let bytes = segment.as_bytes();
    if bytes.len() < 6 {
        return None;
    }

    let (id_digits, id_length) = match bytes[0] {
        b'T' => (8usize, IdLength::Bit29),
        b't' => (3usize, IdLength::Bit11),
        _ => return None,
    };
    if bytes.len() < 1 + id_digits + 1 {
        return None;
    }

    let id_text = std::str::from_utf8(&bytes[1..1 + id_digits]).ok()?;
    let can_id = u32::from_str_radix(id_text, 16).ok()?;

    let count = (bytes[1 + id_digits] as char).to_digit(10)?;
    if count > 8 {
        return None;
    }

    let data_start = 1 + id_digits + 1;
    let data_len = count as usize * 2;
    if bytes.len() < data_start + data_len {
        return None;
    }
    let hex_text = std::str::from_utf8(&bytes[data_start..data_start + data_len]).ok()?;
    let mut data = hex::decode(hex_text).ok()?;
    data.resize(8, 0);
    data.reverse();

    Some(CanMessage {
        can_id,
        id_length,
        data,
        data_length: count as u8,
        timestamp_us: now_us(),
    })
}
