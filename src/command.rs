//! HART command frames (PDUs) and their serialization.
//!
//! A HART PDU travels inside the body of a HART-IP message. Requests are
//! either *short* frames, addressed by polling address, or *long* frames,
//! addressed by the 5-byte unique identifier of the device:
//!
//! | Frame | Delimiter | Address |
//! |-------|-----------|---------|
//! | Short | `0x02` | `0x80 \| polling address` |
//! | Long  | `0x82` | `0x80 \| type high`, type low, 24-bit device id |
//!
//! The address is followed by the command byte, the data byte count, the
//! data and an XOR checksum over every preceding byte.
//!
//! # Example
//!
//! ```
//! use hart_ip::{Address, CommandFrame, DeviceId};
//!
//! let frame = CommandFrame::new(Address::Short(0), 0, Vec::new());
//! assert_eq!(frame.to_bytes().unwrap(), vec![0x02, 0x80, 0x00, 0x00, 0x82]);
//!
//! let id = DeviceId::new(0x2607, 0x123456);
//! let frame = CommandFrame::new(Address::Long(id), 20, Vec::new());
//! let bytes = frame.to_bytes().unwrap();
//! assert_eq!(&bytes[..6], &[0x82, 0xA6, 0x07, 0x12, 0x34, 0x56]);
//! ```
//!
//! # Constants
//!
//! - [`MAX_REQUEST_PDU_LEN`] - Maximum size of a request PDU (255 bytes)
//! - [`MAX_SINGLE_BYTE_CMD`] - Highest command number sent without extension

use crate::device::DeviceId;
use crate::error::{HartError, Result};

/// Read Unique Identifier.
pub const CMD_READ_UNIQUE_ID: u16 = 0;
/// Read Tag, Descriptor, Date (packed tag).
pub const CMD_READ_TAG_DESCRIPTOR: u16 = 13;
/// Read Long Tag.
pub const CMD_READ_LONG_TAG: u16 = 20;
/// Extended command wrapper.
pub const CMD_EXTENDED: u16 = 31;
/// Read I/O System Capabilities.
pub const CMD_READ_IO_CAPABILITIES: u16 = 74;
/// Send Command to Sub-Device (tunnel).
pub const CMD_TUNNEL: u16 = 77;
/// Read Sub-Device Identity Summary.
pub const CMD_READ_SUB_DEVICE_IDENTITY: u16 = 84;
/// Flush Delayed Responses.
pub const CMD_FLUSH_DELAYED_RESPONSES: u16 = 106;
/// Read sub-device count on pre-revision-7 I/O systems.
pub const CMD_READ_SUB_DEVICE_COUNT: u16 = 128;

/// Maximum size of a request PDU.
pub const MAX_REQUEST_PDU_LEN: usize = 255;
/// Highest command number that fits the single command byte.
pub const MAX_SINGLE_BYTE_CMD: u16 = 253;

/// Short-frame request delimiter.
pub const DELIMITER_SHORT_REQUEST: u8 = 0x02;
/// Long-frame request delimiter.
pub const DELIMITER_LONG_REQUEST: u8 = 0x82;
/// Short-frame response delimiter.
pub const DELIMITER_SHORT_RESPONSE: u8 = 0x06;
/// Long-frame response delimiter.
pub const DELIMITER_LONG_RESPONSE: u8 = 0x86;

/// Preamble count carried in a command 77 tunnel envelope.
pub const TUNNEL_PREAMBLES: u8 = 5;

/// Primary master bit set in every request address.
const PRIMARY_MASTER: u8 = 0x80;

/// Response codes with protocol meaning to the client.
pub mod rc {
    /// Command executed without error.
    pub const SUCCESS: u8 = 0;
    /// Value was set to the nearest possible value.
    pub const SET_TO_NEAREST: u8 = 8;
    /// Device busy.
    pub const BUSY: u8 = 32;
    /// Delayed response initiated.
    pub const DR_INITIATE: u8 = 33;
    /// Delayed response running.
    pub const DR_RUNNING: u8 = 34;
    /// Delayed response dead.
    pub const DR_DEAD: u8 = 35;
    /// Delayed response conflict.
    pub const DR_CONFLICT: u8 = 36;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u8 = 64;
    /// Communication error flag.
    pub const COMM_ERROR: u8 = 0x80;
    /// No response was received.
    pub const NO_RESPONSE: u8 = 255;
}

/// XOR checksum over a HART frame.
///
/// # Example
///
/// ```
/// use hart_ip::command::checksum;
///
/// assert_eq!(checksum(&[0x02, 0x80, 0x00, 0x00]), 0x82);
/// ```
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Destination of a HART command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Short frame addressed by polling address (0-63).
    Short(u8),
    /// Long frame addressed by unique identifier.
    Long(DeviceId),
}

impl Address {
    /// Returns whether this is a long-frame address.
    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long(_))
    }

    fn delimiter(&self) -> u8 {
        match self {
            Self::Short(_) => DELIMITER_SHORT_REQUEST,
            Self::Long(_) => DELIMITER_LONG_REQUEST,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Short(poll) => out.push((poll & 0x3F) | PRIMARY_MASTER),
            Self::Long(id) => {
                out.push((((id.device_type >> 8) as u8) & 0x3F) | PRIMARY_MASTER);
                out.push(id.device_type as u8);
                out.push((id.device_id >> 16) as u8);
                out.push((id.device_id >> 8) as u8);
                out.push(id.device_id as u8);
            }
        }
    }
}

/// A HART request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Destination device.
    pub address: Address,
    /// Command number, extended commands included.
    pub command: u16,
    /// Request data bytes, without extended command prefix.
    pub data: Vec<u8>,
}

impl CommandFrame {
    /// Creates a new command frame.
    pub fn new(address: Address, command: u16, data: Vec<u8>) -> Self {
        Self {
            address,
            command,
            data,
        }
    }

    /// Wraps `inner` into a command 77 tunnel frame addressed to `root`.
    ///
    /// The tunnel data is the sub-device's I/O card, its channel, the
    /// preamble count and the inner frame without checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the inner frame cannot be serialized.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{Address, CommandFrame, DeviceId};
    ///
    /// let sub = DeviceId::new(0x1A2B, 0x000102);
    /// let inner = CommandFrame::new(Address::Long(sub), 0, Vec::new());
    /// let root = DeviceId::new(0xE1F6, 0x000001);
    ///
    /// let tunnel = CommandFrame::tunnel(root, 2, 3, &inner).unwrap();
    /// assert_eq!(tunnel.command, 77);
    /// assert_eq!(&tunnel.data[..3], &[2, 3, 5]);
    /// ```
    pub fn tunnel(root: DeviceId, io_card: u8, channel: u8, inner: &CommandFrame) -> Result<Self> {
        let inner_bytes = inner.to_unsealed_bytes()?;
        let mut data = Vec::with_capacity(3 + inner_bytes.len());
        data.push(io_card);
        data.push(channel);
        data.push(TUNNEL_PREAMBLES);
        data.extend_from_slice(&inner_bytes);

        Ok(Self::new(Address::Long(root), CMD_TUNNEL, data))
    }

    /// Serializes the frame without the trailing checksum.
    ///
    /// Commands above [`MAX_SINGLE_BYTE_CMD`] are sent as command 31 with the
    /// 16-bit command number prefixed to the data.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidParameter` if the frame would exceed
    /// [`MAX_REQUEST_PDU_LEN`] or the data is longer than a byte count can hold.
    pub fn to_unsealed_bytes(&self) -> Result<Vec<u8>> {
        let (command, ext) = if self.command > MAX_SINGLE_BYTE_CMD {
            (CMD_EXTENDED as u8, Some(self.command.to_be_bytes()))
        } else {
            (self.command as u8, None)
        };

        let data_len = self.data.len() + if ext.is_some() { 2 } else { 0 };
        if data_len > u8::MAX as usize {
            return Err(HartError::invalid_parameter(
                "data",
                format!("{} data bytes exceed the byte count field", data_len),
            ));
        }

        let mut out = Vec::with_capacity(8 + data_len);
        out.push(self.address.delimiter());
        self.address.write_to(&mut out);
        out.push(command);
        out.push(data_len as u8);
        if let Some(ext) = ext {
            out.extend_from_slice(&ext);
        }
        out.extend_from_slice(&self.data);

        if out.len() + 1 > MAX_REQUEST_PDU_LEN {
            return Err(HartError::invalid_parameter(
                "data",
                format!(
                    "request of {} bytes exceeds the maximum of {}",
                    out.len() + 1,
                    MAX_REQUEST_PDU_LEN
                ),
            ));
        }
        Ok(out)
    }

    /// Serializes the frame with its checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = self.to_unsealed_bytes()?;
        out.push(checksum(&out));
        Ok(out)
    }
}

/// A HART response frame as produced by a field device.
///
/// The client only parses responses; this encoder exists for simulated
/// responders and for rebuilding a tunneled reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    /// Responding device.
    pub address: Address,
    /// Command byte echoed by the device.
    pub command: u8,
    /// Response code.
    pub response_code: u8,
    /// Field device status.
    pub device_status: u8,
    /// Response data.
    pub data: Vec<u8>,
}

impl ResponsePdu {
    /// Creates a successful response with the given data.
    pub fn success(address: Address, command: u8, data: Vec<u8>) -> Self {
        Self {
            address,
            command,
            response_code: rc::SUCCESS,
            device_status: 0,
            data,
        }
    }

    /// Sets the response code.
    pub fn with_response_code(mut self, response_code: u8) -> Self {
        self.response_code = response_code;
        self
    }

    /// Serializes the response, checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.data.len());
        out.push(if self.address.is_long() {
            DELIMITER_LONG_RESPONSE
        } else {
            DELIMITER_SHORT_RESPONSE
        });
        self.address.write_to(&mut out);
        out.push(self.command);
        out.push((self.data.len() + 2) as u8);
        out.push(self.response_code);
        out.push(self.device_status);
        out.extend_from_slice(&self.data);
        out.push(checksum(&out));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_frame_command_0() {
        let frame = CommandFrame::new(Address::Short(5), 0, Vec::new());
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes, hex::decode("0285000087").unwrap());
    }

    #[test]
    fn test_short_address_masks_polling_address() {
        let frame = CommandFrame::new(Address::Short(0xFF), 0, Vec::new());
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes[1], 0xBF);
    }

    #[test]
    fn test_long_frame_layout() {
        let id = DeviceId::new(0xE1F6, 0xABCDEF);
        let frame = CommandFrame::new(Address::Long(id), 3, vec![0x11, 0x22]);
        let bytes = frame.to_bytes().unwrap();

        assert_eq!(&bytes[..6], &[0x82, 0xA1, 0xF6, 0xAB, 0xCD, 0xEF]);
        assert_eq!(bytes[6], 3);
        assert_eq!(bytes[7], 2);
        assert_eq!(&bytes[8..10], &[0x11, 0x22]);
        assert_eq!(bytes.len(), 11);
    }

    #[test]
    fn test_checksum_covers_every_preceding_byte() {
        let id = DeviceId::new(0x2607, 0x000042);
        for command in [0u16, 20, 48, 106, 254, 1024] {
            let frame = CommandFrame::new(Address::Long(id), command, vec![1, 2, 3, 4]);
            let bytes = frame.to_bytes().unwrap();
            let (body, sum) = bytes.split_at(bytes.len() - 1);
            assert_eq!(checksum(body), sum[0], "command {}", command);
        }
    }

    #[test]
    fn test_extended_command_wraps_in_31() {
        let id = DeviceId::new(0x2607, 1);
        let frame = CommandFrame::new(Address::Long(id), 1024, vec![0xAA]);
        let bytes = frame.to_bytes().unwrap();

        assert_eq!(bytes[6], 31);
        assert_eq!(bytes[7], 3);
        assert_eq!(&bytes[8..11], &[0x04, 0x00, 0xAA]);
    }

    #[test]
    fn test_command_253_is_not_extended() {
        let frame = CommandFrame::new(Address::Short(0), 253, Vec::new());
        assert_eq!(frame.to_bytes().unwrap()[2], 253);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let frame = CommandFrame::new(Address::Short(0), 130, vec![0; 251]);
        let err = frame.to_bytes().unwrap_err();
        assert!(matches!(err, HartError::InvalidParameter { .. }));

        let frame = CommandFrame::new(Address::Short(0), 130, vec![0; 250]);
        assert_eq!(frame.to_bytes().unwrap().len(), MAX_REQUEST_PDU_LEN);
    }

    #[test]
    fn test_tunnel_inner_frame_has_no_checksum() {
        let sub = DeviceId::new(0x1A2B, 0x000102);
        let inner = CommandFrame::new(Address::Long(sub), 0, Vec::new());
        let root = DeviceId::new(0xE1F6, 0x000001);
        let tunnel = CommandFrame::tunnel(root, 1, 4, &inner).unwrap();

        assert_eq!(tunnel.address, Address::Long(root));
        assert_eq!(
            tunnel.data,
            vec![1, 4, 5, 0x82, 0x9A, 0x2B, 0x00, 0x01, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_response_pdu_encoding() {
        let pdu = ResponsePdu::success(Address::Short(0), 0, vec![0xFE]).to_bytes();
        assert_eq!(&pdu[..6], &[0x06, 0x80, 0x00, 0x03, 0x00, 0x00]);
        assert_eq!(pdu[6], 0xFE);
        assert_eq!(pdu[7], checksum(&pdu[..7]));
    }
}
