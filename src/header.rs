//! HART-IP message header.
//!
//! Every HART-IP message, in both directions, starts with a fixed 8-byte
//! header followed by an optional body:
//!
//! | Byte | Field | Description |
//! |------|-------|-------------|
//! | 0 | Version | Protocol version (always 1) |
//! | 1 | Message Type | 0 = request, 1 = ACK, 2 = publish/notify, 15 = NAK |
//! | 2 | Message ID | Session initiate/close, keep alive, PDU, discovery |
//! | 3 | Status | Request: 0, response: status code |
//! | 4-5 | Transaction ID | Big-endian sequence number |
//! | 6-7 | Byte Count | Big-endian total length, header included |
//!
//! # Example
//!
//! ```
//! use hart_ip::{HartIpHeader, MessageId, MessageType};
//!
//! let header = HartIpHeader::request(MessageId::KeepAlive, 7, 0);
//! let bytes = header.to_bytes();
//! assert_eq!(bytes, [0x01, 0x00, 0x02, 0x00, 0x00, 0x07, 0x00, 0x08]);
//!
//! let parsed = HartIpHeader::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.message_type, MessageType::Request);
//! ```

use std::fmt;

use crate::error::{HartError, Result};

/// HART-IP header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// HART-IP protocol version spoken by this client.
pub const PROTOCOL_VERSION: u8 = 1;

/// HART-IP message type (header byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request from the client (STX).
    Request,
    /// Response to a request (ACK).
    Response,
    /// Unsolicited publish or notification from the server.
    PublishNotify,
    /// Negative acknowledgement.
    Nak,
}

impl MessageType {
    /// Returns the wire value of this message type.
    pub fn code(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::PublishNotify => 2,
            Self::Nak => 15,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = HartError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::PublishNotify),
            15 => Ok(Self::Nak),
            other => Err(HartError::UnsupportedMessageType(other)),
        }
    }
}

/// HART-IP message identifier (header byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Open a session.
    SessionInitiate,
    /// Close the session.
    SessionClose,
    /// Keep the session alive.
    KeepAlive,
    /// Token-passing (wired) HART PDU.
    HartWiredPdu,
    /// Direct wireless HART PDU.
    HartWirelessPdu,
    /// Server discovery.
    Discovery,
}

impl MessageId {
    /// Returns the wire value of this message id.
    pub fn code(self) -> u8 {
        match self {
            Self::SessionInitiate => 0,
            Self::SessionClose => 1,
            Self::KeepAlive => 2,
            Self::HartWiredPdu => 3,
            Self::HartWirelessPdu => 4,
            Self::Discovery => 128,
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = HartError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::SessionInitiate),
            1 => Ok(Self::SessionClose),
            2 => Ok(Self::KeepAlive),
            3 => Ok(Self::HartWiredPdu),
            4 => Ok(Self::HartWirelessPdu),
            128 => Ok(Self::Discovery),
            other => Err(HartError::invalid_response(format!(
                "unknown message id {}",
                other
            ))),
        }
    }
}

/// HART-IP message header (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HartIpHeader {
    /// Protocol version.
    pub version: u8,
    /// Message type.
    pub message_type: MessageType,
    /// Message id.
    pub message_id: MessageId,
    /// Status byte (0 in requests).
    pub status: u8,
    /// Transaction id used to correlate a response with its request.
    pub transaction_id: u16,
    /// Total message length including this header.
    pub byte_count: u16,
}

impl HartIpHeader {
    /// Creates a request header for a message with `body_len` body bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{HartIpHeader, MessageId, HEADER_SIZE};
    ///
    /// let header = HartIpHeader::request(MessageId::HartWiredPdu, 1, 9);
    /// assert_eq!(header.byte_count as usize, HEADER_SIZE + 9);
    /// ```
    pub fn request(message_id: MessageId, transaction_id: u16, body_len: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: MessageType::Request,
            message_id,
            status: 0,
            transaction_id,
            byte_count: (HEADER_SIZE + body_len) as u16,
        }
    }

    /// Serializes the header to bytes, transaction id and byte count in
    /// network order.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let tid = self.transaction_id.to_be_bytes();
        let count = self.byte_count.to_be_bytes();
        [
            self.version,
            self.message_type.code(),
            self.message_id.code(),
            self.status,
            tid[0],
            tid[1],
            count[0],
            count[1],
        ]
    }

    /// Parses a header from bytes.
    ///
    /// # Errors
    ///
    /// - `HartError::InvalidResponse` if the slice is too short or the message
    ///   id is unknown
    /// - `HartError::UnsupportedVersion` if the version byte is not 1
    /// - `HartError::UnsupportedMessageType` for an unknown message type
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(HartError::invalid_response(format!(
                "header too short: expected {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }

        if data[0] != PROTOCOL_VERSION {
            return Err(HartError::UnsupportedVersion(data[0]));
        }

        Ok(Self {
            version: data[0],
            message_type: MessageType::try_from(data[1])?,
            message_id: MessageId::try_from(data[2])?,
            status: data[3],
            transaction_id: u16::from_be_bytes([data[4], data[5]]),
            byte_count: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Number of body bytes announced by the byte count field.
    pub fn body_len(self) -> usize {
        (self.byte_count as usize).saturating_sub(HEADER_SIZE)
    }
}

impl fmt::Display for HartIpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message Header: Ver: {}, MsgType: {}, MsgId: {}, MsgStatus: 0x{:02X}",
            self.version,
            self.message_type.code(),
            self.message_id.code(),
            self.status
        )
    }
}
