// src/io/pican/parser.rs
//
// Parser for candump text output, e.g. `can0 123 [8] 01 02 03 04 05 06 07 08`.

use crate::io::{now_us, CanMessage, IdLength};

/// Parse one dump line into a message.
///
/// Expected shape: `<bus> <id> [<len>] <hex bytes>` where `<bus>` is `can`
/// plus a digit, `<id>` is 3 hex digits (11-bit) or 8 hex digits (29-bit),
/// `<len>` is a single digit 0-8 and the byte text carries at least `len`
/// hex pairs. Anything else is treated as noise: logged and skipped, never
/// surfaced to the caller.
pub fn parse_dump_line(line: &str) -> Option<CanMessage> {
    let parsed = parse_tokens(line);
    if parsed.is_none() && !line.trim().is_empty() {
        tlog!("[pican] Ignoring unparseable line: {}", line.trim());
    }
    parsed
}

fn parse_tokens(line: &str) -> Option<CanMessage> {
    let mut tokens = line.split_whitespace();

    let bus = tokens.next()?;
    if bus.len() != 4 || !bus.starts_with("can") || !bus.as_bytes()[3].is_ascii_digit() {
        return None;
    }

    let id_text = tokens.next()?;
    let can_id = u32::from_str_radix(id_text, 16).ok()?;
    // Id width follows how the tool printed it, not the numeric value
    let id_length = if id_text.len() == 3 {
        IdLength::Bit11
    } else {
        IdLength::Bit29
    };

    let len_token = tokens.next()?.as_bytes();
    if len_token.len() != 3 || len_token[0] != b'[' || len_token[2] != b']' {
        return None;
    }
    let count = (len_token[1] as char).to_digit(10)? as u8;
    if count > 8 {
        return None;
    }

    let hex_text: String = tokens.collect();
    if hex_text.is_empty() || !hex_text.is_ascii() || hex_text.len() < count as usize * 2 {
        return None;
    }
    let data = hex::decode(&hex_text[..count as usize * 2]).ok()?;

    Some(CanMessage {
        can_id,
        id_length,
        data,
        data_length: count,
        timestamp_us: now_us(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_frame() {
        let msg = parse_dump_line("can0 123 [8] 01 02 03 04 05 06 07 08").unwrap();
        assert_eq!(msg.can_id, 0x123);
        assert_eq!(msg.id_length, IdLength::Bit11);
        assert_eq!(msg.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(msg.data_length, 8);
    }

    #[test]
    fn test_parse_extended_frame() {
        let msg = parse_dump_line("can0 00000123 [3] AA BB CC").unwrap();
        assert_eq!(msg.can_id, 0x123);
        assert_eq!(msg.id_length, IdLength::Bit29);
        assert_eq!(msg.data, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(msg.data_length, 3);
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        let msg = parse_dump_line("  can1   7FF  [2]  DE AD  ").unwrap();
        assert_eq!(msg.can_id, 0x7FF);
        assert_eq!(msg.data, vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_short_byte_text_yields_nothing() {
        // Declared two bytes, only one byte of hex present
        assert!(parse_dump_line("can0 123 [2] AA").is_none());
    }

    #[test]
    fn test_rejects_noise() {
        assert!(parse_dump_line("").is_none());
        assert!(parse_dump_line("interface can0 is up").is_none());
        assert!(parse_dump_line("vcan0 123 [1] AA").is_none());
        assert!(parse_dump_line("can0 123 [9] 01 02 03 04 05 06 07 08 09").is_none());
        assert!(parse_dump_line("can0 123 [2] GG HH").is_none());
        assert!(parse_dump_line("can0 123 2 AA BB").is_none());
    }

    #[test]
    fn test_zero_length_frame_needs_byte_text() {
        // The dump tool never prints a frame without byte text; a bare
        // zero-length line is noise
        assert!(parse_dump_line("can0 123 [0]").is_none());
    }
}
