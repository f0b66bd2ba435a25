//! Response payload decoding driven by a field-layout table.
//!
//! The layout table is an INI-style text file. Each section is named after a
//! command number (`[048]`) or an extended command reached through command
//! 31 (`[031_1024]`), and lists the response fields in order:
//!
//! ```text
//! [001]
//! Output1=Response Code,U8
//! Output2=Device Status,BITS8
//! Output3=PV Units,U8
//! Output4=PV,FLOAT
//! ```
//!
//! Only keys containing `Output` are used. The response code and device
//! status are part of the decoded payload, so layouts list them first.
//!
//! # Example
//!
//! ```
//! use hart_ip::decoder::{decode_payload, LayoutTable, LayoutKey};
//!
//! let table = LayoutTable::parse("[001]\nOutput1=PV,FLOAT\n").unwrap();
//! let layout = table.get(LayoutKey::Command(1)).unwrap();
//!
//! let decoded = decode_payload(layout, &[0x40, 0x48, 0xF5, 0xC3]);
//! assert_eq!(decoded.to_string(), "\r\nPV=3.14");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::DateTime;

use crate::command::CMD_EXTENDED;
use crate::error::{HartError, Result};
use crate::response::HartIpResponse;
use crate::utils::{ascii_field, unpack_ascii};

/// Primitive type of a response field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// `HEX:n`, raw bytes as hex.
    Hex(usize),
    /// `ASCII:n` / `AS:n`, NUL-terminated text.
    Ascii(usize),
    /// `PACKED_ASCII:n` / `PA:n`, HART packed ASCII.
    PackedAscii(usize),
    /// `BITS8`, bits listed LSB first.
    Bits8,
    /// Unsigned 8-bit.
    U8,
    /// Signed 8-bit.
    S8,
    /// Unsigned 16-bit.
    U16,
    /// Signed 16-bit.
    S16,
    /// Unsigned 24-bit.
    U24,
    /// Signed 24-bit.
    S24,
    /// Unsigned 32-bit.
    U32,
    /// Signed 32-bit.
    S32,
    /// Unsigned 40-bit.
    U40,
    /// IEEE-754 single.
    Float,
    /// Signed 64-bit.
    Long,
    /// Milliseconds since 1970-01-01.
    LongTime,
    /// Time of day in 1/32 ms ticks.
    Time {
        /// 24-hour display instead of AM/PM.
        hours24: bool,
    },
    /// Unrecognized type text.
    Unknown(String),
}

impl FieldType {
    /// Parses the type column of a layout entry.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::decoder::FieldType;
    ///
    /// assert_eq!(FieldType::parse("PACKED ASCII:6"), FieldType::PackedAscii(6));
    /// assert_eq!(FieldType::parse("R24"), FieldType::S24);
    /// assert_eq!(FieldType::parse("TIME-24H"), FieldType::Time { hours24: true });
    /// assert_eq!(FieldType::parse("BOGUS"), FieldType::Unknown("BOGUS".into()));
    /// ```
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let upper = text.to_ascii_uppercase();

        let sized = |prefixes: &[&str]| -> Option<Option<usize>> {
            prefixes
                .iter()
                .find(|p| upper.starts_with(*p))
                .map(|p| upper[p.len()..].trim().parse().ok())
        };
        if let Some(size) = sized(&["HEX:"]) {
            return size.map_or_else(|| Self::Unknown(text.to_string()), Self::Hex);
        }
        if let Some(size) = sized(&["ASCII:", "AS:"]) {
            return size.map_or_else(|| Self::Unknown(text.to_string()), Self::Ascii);
        }
        if let Some(size) = sized(&["PACKED ASCII:", "PACKED_ASCII:", "PA:"]) {
            return size.map_or_else(|| Self::Unknown(text.to_string()), Self::PackedAscii);
        }

        match upper.as_str() {
            "BITS8" => Self::Bits8,
            "BL" | "BOOLEAN" | "UNSIGNED8" | "U8" => Self::U8,
            "SIGNED8" | "S8" => Self::S8,
            "UNSIGNED16" | "U16" => Self::U16,
            "SIGNED16" | "S16" => Self::S16,
            "UNSIGNED24" | "U24" => Self::U24,
            "SIGNED24" | "S24" | "RAW24" | "R24" => Self::S24,
            "UNSIGNED32" | "U32" => Self::U32,
            "SIGNED32" | "S32" | "RAW32" | "R32" => Self::S32,
            "UNSIGNED40" | "U40" => Self::U40,
            "FLOAT" | "FL" | "F32" => Self::Float,
            "LONG" => Self::Long,
            "LONG:TIME" => Self::LongTime,
            "TIME" | "T12" | "TIME_12" | "TIME-12" | "TIME_12H" | "TIME-12H" => {
                Self::Time { hours24: false }
            }
            "T24" | "TIME_24" | "TIME-24" | "TIME_24H" | "TIME-24H" => Self::Time { hours24: true },
            _ => Self::Unknown(text.to_string()),
        }
    }

    /// Number of payload bytes consumed, `None` for unknown types.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Hex(n) | Self::Ascii(n) | Self::PackedAscii(n) => Some(*n),
            Self::Bits8 | Self::U8 | Self::S8 => Some(1),
            Self::U16 | Self::S16 => Some(2),
            Self::U24 | Self::S24 => Some(3),
            Self::U32 | Self::S32 | Self::Float | Self::Time { .. } => Some(4),
            Self::U40 => Some(5),
            Self::Long | Self::LongTime => Some(8),
            Self::Unknown(_) => None,
        }
    }
}

/// One named field of a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
}

/// Section key of the layout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKey {
    /// `[nnn]` section.
    Command(u16),
    /// `[031_nnn]` section.
    Extended(u16),
}

impl LayoutKey {
    fn parse(section: &str) -> Option<Self> {
        match section.split_once('_') {
            Some((prefix, ext)) => {
                let prefix: u16 = prefix.trim().parse().ok()?;
                if prefix != CMD_EXTENDED {
                    return None;
                }
                ext.trim().parse().ok().map(Self::Extended)
            }
            None => section.trim().parse().ok().map(Self::Command),
        }
    }
}

/// Command layouts loaded from a definition file.
#[derive(Debug, Clone, Default)]
pub struct LayoutTable {
    sections: HashMap<LayoutKey, Vec<FieldLayout>>,
}

impl LayoutTable {
    /// Parses layout table text.
    ///
    /// Lines starting with `;` or `#` are comments. Sections whose name is not
    /// a command number are skipped.
    ///
    /// # Errors
    ///
    /// Returns `HartError::Decode` for an unterminated section header.
    pub fn parse(text: &str) -> Result<Self> {
        let mut raw: HashMap<LayoutKey, Vec<(String, FieldLayout)>> = HashMap::new();
        let mut current: Option<LayoutKey> = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[') {
                let name = section.strip_suffix(']').ok_or_else(|| {
                    HartError::decode(format!("line {}: unterminated section '{}'", number + 1, line))
                })?;
                current = LayoutKey::parse(name);
                if current.is_none() {
                    log::debug!("layout section [{}] is not a command, skipped", name);
                }
                continue;
            }

            let (Some(key), Some((name, value))) = (current, line.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if !name.to_ascii_lowercase().contains("output") {
                continue;
            }

            let field = match value.split_once(',') {
                Some((field_name, field_type)) => FieldLayout {
                    name: field_name.trim().to_string(),
                    field_type: FieldType::parse(field_type),
                },
                None => FieldLayout {
                    name: value.trim().to_string(),
                    field_type: FieldType::Unknown(String::new()),
                },
            };
            let entries = raw.entry(key).or_default();
            // a repeated key replaces the earlier definition
            entries.retain(|(k, _)| k != name);
            entries.push((name.to_string(), field));
        }

        let sections = raw
            .into_iter()
            .map(|(key, mut entries)| {
                entries.sort_by_key(|(k, _)| output_index(k));
                (key, entries.into_iter().map(|(_, f)| f).collect())
            })
            .collect();
        Ok(Self { sections })
    }

    /// Reads and parses a layout file.
    ///
    /// # Errors
    ///
    /// Returns `HartError::Io` if the file cannot be read, or a parse error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Layout of a section.
    pub fn get(&self, key: LayoutKey) -> Option<&[FieldLayout]> {
        self.sections.get(&key).map(Vec::as_slice)
    }

    /// Number of sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns whether the table has no section.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Numeric suffix of an `OutputN` key; keys without one sort last in file order.
fn output_index(key: &str) -> u32 {
    let prefix = key.trim_end_matches(|c: char| c.is_ascii_digit());
    key[prefix.len()..].parse().unwrap_or(u32::MAX)
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Text, hex strings and bit strings.
    Text(String),
    /// Unsigned integers.
    Unsigned(u64),
    /// Signed integers.
    Signed(i64),
    /// Floating point.
    Float(f32),
    /// Absolute time in ms since 1970.
    Timestamp(i64),
    /// Time of day.
    TimeOfDay {
        /// Hours (0-23).
        hours: u32,
        /// Minutes.
        minutes: u32,
        /// Seconds.
        seconds: u32,
        /// Milliseconds.
        millis: u32,
        /// 24-hour display.
        hours24: bool,
    },
    /// Not decodable.
    Unknown,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Timestamp(ms) => match DateTime::from_timestamp_millis(*ms) {
                Some(time) => write!(f, "{}", time.format("%m/%d/%y %H:%M:%S%.3f")),
                None => write!(f, "{}", ms),
            },
            Self::TimeOfDay {
                hours,
                minutes,
                seconds,
                millis,
                hours24: true,
            } => write!(f, "{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis),
            Self::TimeOfDay {
                hours,
                minutes,
                seconds,
                millis,
                hours24: false,
            } => {
                let (display, suffix) = if *hours >= 12 {
                    (hours - 12, "PM")
                } else {
                    (*hours, "AM")
                };
                write!(
                    f,
                    "{:02}:{:02}:{:02}.{:03} {}",
                    display, minutes, seconds, millis, suffix
                )
            }
            Self::Unknown => f.write_str("???"),
        }
    }
}

/// A decoded field.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    /// Field name.
    pub name: String,
    /// Decoded value.
    pub value: FieldValue,
}

/// Result of decoding a payload against a layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedPayload {
    /// Fields in layout order.
    pub fields: Vec<DecodedField>,
    /// Bytes not covered by any field.
    pub undefined: Vec<u8>,
}

impl DecodedPayload {
    /// Value of the first field with the given name.
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

impl fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            write!(f, "\r\n{}={}", field.name, field.value)?;
        }
        if !self.undefined.is_empty() {
            f.write_str("\r\nUndefined data bytes=")?;
            for b in &self.undefined {
                write!(f, "{:02X}", b)?;
            }
        }
        Ok(())
    }
}

fn be_unsigned(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn be_signed(bytes: &[u8]) -> i64 {
    let bits = bytes.len() as u32 * 8;
    let raw = be_unsigned(bytes);
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn decode_field(field_type: &FieldType, bytes: &[u8]) -> FieldValue {
    match field_type {
        FieldType::Hex(_) => FieldValue::Text(bytes.iter().map(|b| format!("{:02X}", b)).collect()),
        FieldType::Ascii(_) => FieldValue::Text(ascii_field(bytes)),
        FieldType::PackedAscii(_) => FieldValue::Text(unpack_ascii(bytes).trim().to_string()),
        FieldType::Bits8 => FieldValue::Text(
            (0..8)
                .map(|bit| if bytes[0] & (1 << bit) != 0 { '1' } else { '0' })
                .collect(),
        ),
        FieldType::U8 | FieldType::U16 | FieldType::U24 | FieldType::U32 | FieldType::U40 => {
            FieldValue::Unsigned(be_unsigned(bytes))
        }
        FieldType::S8 | FieldType::S16 | FieldType::S24 | FieldType::S32 | FieldType::Long => {
            FieldValue::Signed(be_signed(bytes))
        }
        FieldType::Float => {
            FieldValue::Float(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        FieldType::LongTime => FieldValue::Timestamp(be_signed(bytes)),
        FieldType::Time { hours24 } => {
            let mut t = be_unsigned(bytes) as u32 / 32;
            let millis = t % 1000;
            t /= 1000;
            let seconds = t % 60;
            t /= 60;
            FieldValue::TimeOfDay {
                hours: t / 60,
                minutes: t % 60,
                seconds,
                millis,
                hours24: *hours24,
            }
        }
        FieldType::Unknown(_) => FieldValue::Unknown,
    }
}

/// Decodes `data` field by field.
///
/// Decoding stops before a field when the data is used up. An unknown type,
/// or a field longer than the remaining data, is reported as `???` and ends
/// decoding. Bytes left over are reported as undefined.
pub fn decode_payload(layout: &[FieldLayout], data: &[u8]) -> DecodedPayload {
    let mut payload = DecodedPayload::default();
    let mut index = 0;

    for field in layout {
        if index >= data.len() {
            break;
        }
        let size = field
            .field_type
            .size()
            .filter(|size| index + size <= data.len());
        let Some(size) = size else {
            payload.fields.push(DecodedField {
                name: field.name.clone(),
                value: FieldValue::Unknown,
            });
            break;
        };

        payload.fields.push(DecodedField {
            name: field.name.clone(),
            value: decode_field(&field.field_type, &data[index..index + size]),
        });
        index += size;
    }

    payload.undefined = data[index..].to_vec();
    payload
}

/// Renders responses using a lazily loaded layout table.
///
/// A missing or unreadable file disables decoding; responses are then shown
/// as a hex dump.
#[derive(Debug)]
pub struct ResponseDecoder {
    path: PathBuf,
    table: OnceLock<Option<LayoutTable>>,
}

impl ResponseDecoder {
    /// Creates a decoder for the layout file at `path`. The file is read on
    /// first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: OnceLock::new(),
        }
    }

    /// Creates a decoder from an already parsed table.
    pub fn from_table(table: LayoutTable) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Some(table));
        Self {
            path: PathBuf::new(),
            table: cell,
        }
    }

    /// Layout table, loading it on first call.
    pub fn table(&self) -> Option<&LayoutTable> {
        self.table
            .get_or_init(|| match LayoutTable::load(&self.path) {
                Ok(table) => {
                    log::debug!(
                        "loaded {} command layouts from {}",
                        table.len(),
                        self.path.display()
                    );
                    Some(table)
                }
                Err(e) => {
                    log::warn!(
                        "response decoding disabled, cannot load {}: {}",
                        self.path.display(),
                        e
                    );
                    None
                }
            })
            .as_ref()
    }

    /// Renders a response as `Rx Cmd=<n>` followed by one line per field.
    ///
    /// Without a layout for the command the data is shown as a hex dump.
    pub fn decode(&self, response: &HartIpResponse) -> String {
        let command = u16::from(response.command);
        let found = self
            .table()
            .and_then(|table| Self::find_layout(table, command, &response.data));

        match found {
            Some((shown_command, layout, tail)) => {
                let mut data = Vec::with_capacity(2 + tail.len());
                data.push(response.response_code);
                data.push(response.device_status);
                data.extend_from_slice(tail);
                format!("Rx Cmd={}{}", shown_command, decode_payload(layout, &data))
            }
            None => {
                let mut out = format!("Rx Cmd={}\r\nData: ", command);
                for b in &response.data {
                    out.push_str(&format!("{:02X} ", b));
                }
                out.truncate(out.trim_end().len());
                out
            }
        }
    }

    /// Command 31 replies are looked up by their extended command, first as a
    /// plain section without the two extension bytes, then as `031_<ext>`.
    fn find_layout<'a>(
        table: &'a LayoutTable,
        command: u16,
        data: &'a [u8],
    ) -> Option<(u16, &'a [FieldLayout], &'a [u8])> {
        if command != CMD_EXTENDED || data.len() < 2 {
            return table.get(LayoutKey::Command(command)).map(|l| (command, l, data));
        }
        let ext = u16::from_be_bytes([data[0], data[1]]);
        table
            .get(LayoutKey::Command(ext))
            .map(|l| (ext, l, &data[2..]))
            .or_else(|| table.get(LayoutKey::Extended(ext)).map(|l| (command, l, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUTS: &str = "\
; test layouts
[001]
Output1=Response Code,U8
Output2=Device Status,BITS8
Output3=PV Units,U8
Output4=PV,FLOAT

[020]
Output2=Device Status,HEX:1
Output1=Response Code,U8
Output3=Tag,ASCII:32
Description=not an output

[1024]
Output1=Response Code,U8
Output2=Device Status,U8
Output3=Counter,U16

[031_2048]
Output1=Response Code,U8
Output2=Device Status,U8
Output3=Extended,U16
Output4=Value,S16
";

    fn decoder() -> ResponseDecoder {
        ResponseDecoder::from_table(LayoutTable::parse(LAYOUTS).unwrap())
    }

    fn layout(entries: &[(&str, &str)]) -> Vec<FieldLayout> {
        entries
            .iter()
            .map(|(name, ty)| FieldLayout {
                name: name.to_string(),
                field_type: FieldType::parse(ty),
            })
            .collect()
    }

    #[test]
    fn test_float_field() {
        let decoded = decode_payload(&layout(&[("Pressure", "FLOAT")]), &[0x40, 0x48, 0xF5, 0xC3]);
        assert_eq!(decoded.to_string(), "\r\nPressure=3.14");
        match decoded.value("Pressure") {
            Some(FieldValue::Float(v)) => assert!((v - 3.14).abs() < 1e-6),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_halts_and_reports_rest() {
        let decoded = decode_payload(&layout(&[("X", "BOGUS"), ("Y", "U8")]), &[0x01, 0x02, 0x03]);
        assert_eq!(decoded.to_string(), "\r\nX=???\r\nUndefined data bytes=010203");
        assert_eq!(decoded.fields.len(), 1);
    }

    #[test]
    fn test_short_data_marks_field_unknown() {
        let decoded = decode_payload(&layout(&[("A", "U8"), ("B", "U32")]), &[7, 1, 2]);
        assert_eq!(decoded.to_string(), "\r\nA=7\r\nB=???\r\nUndefined data bytes=0102");
    }

    #[test]
    fn test_fields_stop_when_data_used_up() {
        let decoded = decode_payload(&layout(&[("A", "U16"), ("B", "U8")]), &[0x01, 0x00]);
        assert_eq!(decoded.to_string(), "\r\nA=256");
    }

    #[test]
    fn test_integer_types() {
        let decoded = decode_payload(
            &layout(&[("a", "S8"), ("b", "S16"), ("c", "S24"), ("d", "U24"), ("e", "U40"), ("f", "S32")]),
            &[
                0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
                0x00, 0x80, 0x00, 0x00, 0x00,
            ],
        );
        assert_eq!(decoded.value("a"), Some(&FieldValue::Signed(-1)));
        assert_eq!(decoded.value("b"), Some(&FieldValue::Signed(-2)));
        assert_eq!(decoded.value("c"), Some(&FieldValue::Signed(-3)));
        assert_eq!(decoded.value("d"), Some(&FieldValue::Unsigned(65536)));
        assert_eq!(decoded.value("e"), Some(&FieldValue::Unsigned(1 << 32)));
        assert_eq!(decoded.value("f"), Some(&FieldValue::Signed(i64::from(i32::MIN))));
    }

    #[test]
    fn test_text_types() {
        let mut data = b"PT-1\0\0".to_vec();
        data.extend_from_slice(&crate::utils::pack_ascii("TAG1"));
        data.extend_from_slice(&[0xDE, 0xAD, 0b0000_0101]);
        let decoded = decode_payload(
            &layout(&[("a", "ASCII:6"), ("p", "PA:3"), ("h", "HEX:2"), ("bits", "BITS8")]),
            &data,
        );
        assert_eq!(decoded.to_string(), "\r\na=PT-1\r\np=TAG1\r\nh=DEAD\r\nbits=10100000");
    }

    #[test]
    fn test_time_of_day() {
        // 13:05:09.250 in 1/32 ms ticks
        let ms = ((13 * 60 + 5) * 60 + 9) * 1000 + 250;
        let ticks = (ms as u32 * 32).to_be_bytes();
        let decoded = decode_payload(&layout(&[("t", "TIME"), ("u", "T24")]), &[ticks, ticks].concat());
        assert_eq!(decoded.to_string(), "\r\nt=01:05:09.250 PM\r\nu=13:05:09.250");
    }

    #[test]
    fn test_long_time() {
        let ms: i64 = 1_000_000_000_123;
        let decoded = decode_payload(&layout(&[("when", "LONG:TIME"), ("n", "LONG")]), &[ms.to_be_bytes(), (-5i64).to_be_bytes()].concat());
        assert_eq!(decoded.to_string(), "\r\nwhen=09/09/01 01:46:40.123\r\nn=-5");
    }

    #[test]
    fn test_type_aliases() {
        assert_eq!(FieldType::parse("BOOLEAN"), FieldType::U8);
        assert_eq!(FieldType::parse("raw32"), FieldType::S32);
        assert_eq!(FieldType::parse("AS:8"), FieldType::Ascii(8));
        assert_eq!(FieldType::parse("PACKED_ASCII:6"), FieldType::PackedAscii(6));
        assert_eq!(FieldType::parse("TIME_12H"), FieldType::Time { hours24: false });
        assert_eq!(FieldType::parse("HEX:x"), FieldType::Unknown("HEX:x".into()));
    }

    #[test]
    fn test_layout_table_sorts_outputs_and_skips_others() {
        let table = LayoutTable::parse(LAYOUTS).unwrap();
        assert_eq!(table.len(), 4);

        let tag = table.get(LayoutKey::Command(20)).unwrap();
        let names: Vec<_> = tag.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Response Code", "Device Status", "Tag"]);
        assert!(table.get(LayoutKey::Extended(2048)).is_some());
    }

    #[test]
    fn test_layout_table_rejects_bad_section() {
        assert!(LayoutTable::parse("[001\nOutput1=A,U8").is_err());
    }

    #[test]
    fn test_decode_response_with_layout() {
        let rsp = HartIpResponse::for_command(1, 0, &[32, 0x40, 0x48, 0xF5, 0xC3]);
        assert_eq!(
            decoder().decode(&rsp),
            "Rx Cmd=1\r\nResponse Code=0\r\nDevice Status=00000000\r\nPV Units=32\r\nPV=3.14"
        );
    }

    #[test]
    fn test_decode_response_without_layout() {
        let rsp = HartIpResponse::for_command(48, 0, &[0x01, 0xAB]);
        assert_eq!(decoder().decode(&rsp), "Rx Cmd=48\r\nData: 01 AB");
    }

    #[test]
    fn test_decode_extended_plain_section() {
        let rsp = HartIpResponse::for_command(31, 0, &[0x04, 0x00, 0x00, 0x2A]);
        assert_eq!(
            decoder().decode(&rsp),
            "Rx Cmd=1024\r\nResponse Code=0\r\nDevice Status=0\r\nCounter=42"
        );
    }

    #[test]
    fn test_decode_extended_compound_section() {
        let rsp = HartIpResponse::for_command(31, 0, &[0x08, 0x00, 0xFF, 0xFE]);
        assert_eq!(
            decoder().decode(&rsp),
            "Rx Cmd=31\r\nResponse Code=0\r\nDevice Status=0\r\nExtended=2048\r\nValue=-2"
        );
    }

    #[test]
    fn test_missing_file_disables_decoding() {
        let decoder = ResponseDecoder::new("/nonexistent/hart-layouts.ini");
        assert!(decoder.table().is_none());
        let rsp = HartIpResponse::for_command(1, 0, &[0x10]);
        assert_eq!(decoder.decode(&rsp), "Rx Cmd=1\r\nData: 10");
    }
}
