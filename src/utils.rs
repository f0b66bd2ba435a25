//! Utility functions for hex text, HART packed ASCII and timestamps.
//!
//! # Example
//!
//! ```
//! use hart_ip::utils::{format_hex, parse_hex, unpack_ascii};
//!
//! let data = parse_hex("01 0a FF").unwrap();
//! assert_eq!(data, vec![0x01, 0x0A, 0xFF]);
//! assert_eq!(format_hex(&data), "01 0A FF");
//!
//! // "ABCD" packed into 3 bytes
//! assert_eq!(unpack_ascii(&[0x04, 0x20, 0xC4]), "ABCD");
//! ```

use chrono::Local;

use crate::error::{HartError, Result};

/// Parses user-entered hex text into bytes.
///
/// Whitespace between digits is ignored, so both `"0A0B"` and `"0A 0B"` are
/// accepted. An empty string yields an empty payload.
///
/// # Errors
///
/// Returns `HartError::InvalidParameter` if the text has an odd number of hex
/// digits or contains a character that is not a hex digit.
///
/// # Example
///
/// ```
/// use hart_ip::utils::parse_hex;
///
/// assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
/// assert!(parse_hex("ABC").is_err());
/// assert!(parse_hex("ZZ").is_err());
/// ```
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(HartError::invalid_parameter(
            "data",
            "odd number of hex digits",
        ));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let high = hex_value(pair[0])?;
            let low = hex_value(pair[1])?;
            Ok((high << 4) | low)
        })
        .collect()
}

fn hex_value(c: char) -> Result<u8> {
    c.to_digit(16)
        .map(|v| v as u8)
        .ok_or_else(|| HartError::invalid_parameter("data", format!("'{}' is not a hex digit", c)))
}

/// Formats bytes as space-separated upper-case hex.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unpacks HART packed ASCII (4 six-bit characters per 3 bytes).
///
/// Trailing bytes that do not complete a 3-byte group are ignored.
pub fn unpack_ascii(packed: &[u8]) -> String {
    let mut out = String::with_capacity(packed.len() / 3 * 4);
    for group in packed.chunks_exact(3) {
        let word = (u32::from(group[0]) << 16) | (u32::from(group[1]) << 8) | u32::from(group[2]);
        for shift in [18u32, 12, 6, 0] {
            let mut c = ((word >> shift) & 0x3F) as u8;
            // bit 6 is the complement of bit 5
            if c & 0x20 == 0 {
                c |= 0x40;
            }
            out.push(c as char);
        }
    }
    out
}

/// Packs text into HART packed ASCII.
///
/// Lower-case letters are folded to upper case and the text is padded with
/// spaces to a multiple of four characters.
///
/// # Example
///
/// ```
/// use hart_ip::utils::{pack_ascii, unpack_ascii};
///
/// let packed = pack_ascii("PT-101");
/// assert_eq!(packed.len(), 6);
/// assert_eq!(unpack_ascii(&packed), "PT-101  ");
/// ```
pub fn pack_ascii(text: &str) -> Vec<u8> {
    let mut chars: Vec<u8> = text
        .bytes()
        .map(|b| b.to_ascii_uppercase() & 0x3F)
        .collect();
    while chars.len() % 4 != 0 {
        chars.push(b' ' & 0x3F);
    }

    let mut out = Vec::with_capacity(chars.len() / 4 * 3);
    for quad in chars.chunks_exact(4) {
        let word = (u32::from(quad[0]) << 18)
            | (u32::from(quad[1]) << 12)
            | (u32::from(quad[2]) << 6)
            | u32::from(quad[3]);
        out.extend_from_slice(&[(word >> 16) as u8, (word >> 8) as u8, word as u8]);
    }
    out
}

/// Reads a fixed-width ASCII field, stopping at the first NUL and trimming
/// surrounding whitespace.
pub fn ascii_field(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

/// Local wall-clock time formatted for log lines (`MM/dd/yyyy HH:mm:ss:fff`).
pub fn timestamp() -> String {
    Local::now().format("%m/%d/%Y %H:%M:%S:%3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_with_spaces() {
        assert_eq!(parse_hex("00 1b 1E").unwrap(), vec![0x00, 0x1B, 0x1E]);
        assert_eq!(parse_hex("DEADbeef").unwrap(), hex::decode("deadbeef").unwrap());
    }

    #[test]
    fn test_parse_hex_rejects_odd_length() {
        let err = parse_hex("0A0").unwrap_err();
        assert!(matches!(err, HartError::InvalidParameter { .. }));
    }

    #[test]
    fn test_parse_hex_rejects_bad_digit() {
        let err = parse_hex("0G").unwrap_err();
        assert!(err.to_string().contains("'G' is not a hex digit"));
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex(&[0x00, 0xAB, 0x7F]), "00 AB 7F");
    }

    #[test]
    fn test_unpack_ascii_known_tag() {
        // "TAG1" => T=0x14, A=0x01, G=0x07, 1=0x31
        let packed = [0x50, 0x11, 0xF1];
        assert_eq!(unpack_ascii(&packed), "TAG1");
    }

    #[test]
    fn test_unpack_ignores_partial_group() {
        assert_eq!(unpack_ascii(&[0x04, 0x20, 0xC4, 0x04]), "ABCD");
    }

    #[test]
    fn test_pack_ascii_round_trip() {
        let packed = pack_ascii("flow01");
        assert_eq!(unpack_ascii(&packed), "FLOW01  ");
    }

    #[test]
    fn test_ascii_field_stops_at_nul() {
        let mut data = b"  TT-200".to_vec();
        data.extend_from_slice(&[0, b'X', b'Y']);
        assert_eq!(ascii_field(&data), "TT-200");
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), "10/17/2026 12:00:00:000".len());
        assert_eq!(&ts[2..3], "/");
    }
}
