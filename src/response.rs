//! HART-IP response parsing.
//!
//! A response is an 8-byte header followed by a body. For PDU messages the
//! body is a HART response frame:
//!
//! | Field | Short frame | Long frame |
//! |-------|-------------|------------|
//! | Delimiter | 1 byte | 1 byte |
//! | Address | 1 byte | 5 bytes (+ expansion bytes) |
//! | Command | 1 byte | 1 byte |
//! | Byte count | 1 byte | 1 byte |
//! | Response code | 1 byte | 1 byte |
//! | Device status | 1 byte | 1 byte |
//! | Data | byte count - 2 | byte count - 2 |
//! | Checksum | 1 byte | 1 byte |
//!
//! For session-initiate replies the body is the raw session payload and the
//! response code is taken from the header status byte.

use std::fmt;

use crate::command::{rc, Address, ResponsePdu, CMD_TUNNEL};
use crate::error::{HartError, Result};
use crate::header::{HartIpHeader, MessageId, MessageType, HEADER_SIZE, PROTOCOL_VERSION};
use crate::utils::{format_hex, timestamp};

/// Largest body accepted; longer bodies are truncated.
pub const MAX_BODY_LEN: usize = 512;

/// Broad meaning of a HART response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    /// Command executed.
    Success,
    /// Executed with a warning.
    Warning,
    /// Command failed.
    Error,
    /// Device busy, retry later.
    Busy,
    /// Delayed response started.
    DrInitiate,
    /// Delayed response still running.
    DrRunning,
    /// Delayed response was lost.
    DrDead,
    /// Delayed response conflict.
    DrConflict,
    /// Command not implemented.
    NotImplemented,
    /// Field communication error.
    CommError,
    /// No response from the device.
    NoResponse,
}

impl ResponseClass {
    /// Classifies a response code.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::ResponseClass;
    ///
    /// assert_eq!(ResponseClass::from_code(0), ResponseClass::Success);
    /// assert_eq!(ResponseClass::from_code(8), ResponseClass::Warning);
    /// assert_eq!(ResponseClass::from_code(33), ResponseClass::DrInitiate);
    /// assert_eq!(ResponseClass::from_code(0x90), ResponseClass::CommError);
    /// ```
    pub fn from_code(code: u8) -> Self {
        match code {
            rc::SUCCESS => Self::Success,
            rc::BUSY => Self::Busy,
            rc::DR_INITIATE => Self::DrInitiate,
            rc::DR_RUNNING => Self::DrRunning,
            rc::DR_DEAD => Self::DrDead,
            rc::DR_CONFLICT => Self::DrConflict,
            rc::NOT_IMPLEMENTED => Self::NotImplemented,
            rc::NO_RESPONSE => Self::NoResponse,
            c if c & rc::COMM_ERROR != 0 => Self::CommError,
            c if is_error_code(c) => Self::Error,
            _ => Self::Warning,
        }
    }

    /// Returns whether the device asked for the request to be repeated.
    pub fn is_delayed(self) -> bool {
        matches!(
            self,
            Self::Busy | Self::DrInitiate | Self::DrRunning | Self::DrConflict
        )
    }
}

/// Returns whether a response code is in one of the error ranges.
pub fn is_error_code(code: u8) -> bool {
    matches!(code, 1..=7 | 9..=13 | 15..=23 | 28 | 29 | 32..=95)
}

/// A parsed HART-IP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HartIpResponse {
    /// Message header.
    pub header: HartIpHeader,
    /// Raw body (HART PDU or session payload), at most [`MAX_BODY_LEN`] bytes.
    pub body: Vec<u8>,
    /// Command byte of the PDU.
    pub command: u8,
    /// Response code (header status when there is no PDU).
    pub response_code: u8,
    /// Field device status byte.
    pub device_status: u8,
    /// Response data, response code and device status stripped.
    pub data: Vec<u8>,
    /// Local receive time.
    pub timestamp: String,
}

struct PduFields<'a> {
    command: u8,
    response_code: u8,
    device_status: u8,
    data: &'a [u8],
}

fn parse_pdu(pdu: &[u8]) -> Result<PduFields<'_>> {
    let first = *pdu
        .first()
        .ok_or_else(|| HartError::invalid_response("empty HART frame"))?;
    let index = if first & 0x80 != 0 {
        6 + usize::from((first & 0x60) >> 5)
    } else {
        2
    };

    if pdu.len() < index + 4 {
        return Err(HartError::invalid_response(format!(
            "HART frame of {} bytes too short for its {} address",
            pdu.len(),
            if first & 0x80 != 0 { "long" } else { "short" }
        )));
    }

    let command = pdu[index];
    let byte_count = usize::from(pdu[index + 1]);
    if byte_count < 2 {
        return Err(HartError::invalid_response(format!(
            "command {} byte count {} does not cover response code and device status",
            command, byte_count
        )));
    }

    let start = index + 4;
    let end = start + byte_count - 2;
    if pdu.len() < end {
        return Err(HartError::invalid_response(format!(
            "response too short for command {}: expected {} data bytes, got {}",
            command,
            byte_count - 2,
            pdu.len() - start
        )));
    }

    Ok(PduFields {
        command,
        response_code: pdu[index + 2],
        device_status: pdu[index + 3],
        data: &pdu[start..end],
    })
}

impl HartIpResponse {
    /// Parses a complete HART-IP message.
    ///
    /// Bodies longer than [`MAX_BODY_LEN`] are truncated rather than rejected.
    ///
    /// # Errors
    ///
    /// - `HartError::UnsupportedVersion` for a version other than 1
    /// - `HartError::UnsupportedMessageType` for an unknown message type
    /// - `HartError::InvalidResponse` if the message or its PDU is truncated
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::HartIpResponse;
    ///
    /// // ACK, keep alive, status 0, tid 3, no body
    /// let rsp = HartIpResponse::from_bytes(&[1, 1, 2, 0, 0, 3, 0, 8]).unwrap();
    /// assert_eq!(rsp.header.transaction_id, 3);
    /// assert_eq!(rsp.response_code, 0);
    /// assert!(rsp.data.is_empty());
    /// ```
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = HartIpHeader::from_bytes(bytes)?;
        let body_len = header.body_len().min(MAX_BODY_LEN);
        let available = bytes.len() - HEADER_SIZE;
        if available < body_len {
            return Err(HartError::invalid_response(format!(
                "message truncated: byte count announces {} body bytes, got {}",
                body_len, available
            )));
        }
        let body = bytes[HEADER_SIZE..HEADER_SIZE + body_len].to_vec();
        Self::from_parts(header, body)
    }

    fn from_parts(header: HartIpHeader, body: Vec<u8>) -> Result<Self> {
        let mut response = Self {
            header,
            body: Vec::new(),
            command: 0,
            response_code: header.status,
            device_status: 0,
            data: Vec::new(),
            timestamp: timestamp(),
        };

        let carries_reply = matches!(
            header.message_type,
            MessageType::Response | MessageType::PublishNotify
        );
        let is_pdu = matches!(
            header.message_id,
            MessageId::HartWiredPdu | MessageId::HartWirelessPdu
        );

        if carries_reply && is_pdu && !body.is_empty() {
            let fields = parse_pdu(&body)?;
            response.command = fields.command;
            response.response_code = fields.response_code;
            response.device_status = fields.device_status;
            response.data = fields.data.to_vec();
        } else if carries_reply {
            response.data = body.clone();
        }
        response.body = body;
        Ok(response)
    }

    /// Builds the wire bytes of a message, for simulated servers.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{HartIpResponse, MessageId, MessageType};
    ///
    /// let bytes = HartIpResponse::encode(MessageType::Response, MessageId::KeepAlive, 0, 9, &[]);
    /// assert_eq!(bytes, vec![1, 1, 2, 0, 0, 9, 0, 8]);
    /// ```
    pub fn encode(
        message_type: MessageType,
        message_id: MessageId,
        status: u8,
        transaction_id: u16,
        body: &[u8],
    ) -> Vec<u8> {
        let header = HartIpHeader {
            version: PROTOCOL_VERSION,
            message_type,
            message_id,
            status,
            transaction_id,
            byte_count: (HEADER_SIZE + body.len()) as u16,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Builds a successful-looking PDU reply without going through the wire,
    /// for fixtures and offline decoding. `data` must fit a byte count.
    pub fn for_command(command: u8, response_code: u8, data: &[u8]) -> Self {
        let pdu = ResponsePdu::success(Address::Short(0), command, data.to_vec())
            .with_response_code(response_code);
        let body = pdu.to_bytes();
        Self {
            header: HartIpHeader {
                version: PROTOCOL_VERSION,
                message_type: MessageType::Response,
                message_id: MessageId::HartWiredPdu,
                status: 0,
                transaction_id: 0,
                byte_count: (HEADER_SIZE + body.len()) as u16,
            },
            body,
            command,
            response_code,
            device_status: 0,
            data: data.to_vec(),
            timestamp: timestamp(),
        }
    }

    /// Serializes the response back to its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(
            self.header.message_type,
            self.header.message_id,
            self.header.status,
            self.header.transaction_id,
            &self.body,
        )
    }

    /// Transaction id of the response.
    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    /// Number of data bytes.
    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the message is an ACK.
    pub fn is_valid_response(&self) -> bool {
        self.header.message_type == MessageType::Response
    }

    /// Returns whether the message is an unsolicited publish.
    pub fn is_publish(&self) -> bool {
        self.header.message_type == MessageType::PublishNotify
    }

    /// Returns whether the header status byte is zero.
    pub fn is_status_success(&self) -> bool {
        self.header.status == 0
    }

    /// Returns whether this is a command 77 reply carrying a nested PDU.
    pub fn is_tunneled(&self) -> bool {
        self.is_pdu() && u16::from(self.command) == CMD_TUNNEL
    }

    fn is_pdu(&self) -> bool {
        matches!(
            self.header.message_id,
            MessageId::HartWiredPdu | MessageId::HartWirelessPdu
        ) && !self.body.is_empty()
    }

    /// Response code classification.
    pub fn class(&self) -> ResponseClass {
        ResponseClass::from_code(self.response_code)
    }

    /// Returns whether the response code is in an error range.
    pub fn is_error_response(&self) -> bool {
        is_error_code(self.response_code)
    }

    /// Inactivity close time granted in a session-initiate reply.
    pub fn inactivity_close_time(&self) -> Option<u32> {
        if self.header.message_id != MessageId::SessionInitiate || self.body.len() < 5 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.body[1],
            self.body[2],
            self.body[3],
            self.body[4],
        ]))
    }

    /// Extracts the sub-device reply nested in a command 77 response.
    ///
    /// The returned value carries the inner PDU as its body and the inner
    /// command, response code, device status and data; `self` is untouched.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidResponse` if this is not a command 77 reply
    /// or the nested frame is malformed.
    pub fn unwrap_tunnel(&self) -> Result<Self> {
        if !self.is_tunneled() {
            return Err(HartError::invalid_response(format!(
                "command {} reply is not a command 77 tunnel",
                self.command
            )));
        }
        if self.data.len() < 2 {
            return Err(HartError::invalid_response(
                "command 77 reply carries no nested frame",
            ));
        }

        let inner = &self.data[2..];
        let fields = parse_pdu(inner)?;
        Ok(Self {
            header: self.header,
            body: inner.to_vec(),
            command: fields.command,
            response_code: fields.response_code,
            device_status: fields.device_status,
            data: fields.data.to_vec(),
            timestamp: self.timestamp.clone(),
        })
    }
}

impl fmt::Display for HartIpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, Rx: {}, TranId: {}, ByteCount: {}",
            self.timestamp,
            self.header,
            self.header.transaction_id,
            self.body.len()
        )?;
        if !self.body.is_empty() {
            write!(f, ", Data: {}", format_hex(&self.body))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;

    fn pdu_message(tid: u16, pdu: &ResponsePdu) -> Vec<u8> {
        HartIpResponse::encode(
            MessageType::Response,
            MessageId::HartWiredPdu,
            0,
            tid,
            &pdu.to_bytes(),
        )
    }

    #[test]
    fn test_parse_short_frame_reply() {
        let pdu = ResponsePdu::success(Address::Short(0), 0, vec![254, 0x26, 0x07]);
        let rsp = HartIpResponse::from_bytes(&pdu_message(12, &pdu)).unwrap();

        assert!(rsp.is_valid_response());
        assert_eq!(rsp.transaction_id(), 12);
        assert_eq!(rsp.command, 0);
        assert_eq!(rsp.response_code, 0);
        assert_eq!(rsp.data, vec![254, 0x26, 0x07]);
    }

    #[test]
    fn test_parse_long_frame_reply() {
        let id = DeviceId::new(0x2607, 0x010203);
        let pdu = ResponsePdu::success(Address::Long(id), 48, vec![1, 2, 3, 4])
            .with_response_code(8);
        let bytes = pdu_message(1, &pdu);
        let rsp = HartIpResponse::from_bytes(&bytes).unwrap();

        assert_eq!(rsp.command, 48);
        assert_eq!(rsp.response_code, 8);
        assert_eq!(rsp.data_count(), 4);
        assert_eq!(rsp.class(), ResponseClass::Warning);
        assert_eq!(rsp.to_bytes(), bytes);
    }

    #[test]
    fn test_long_frame_expansion_bytes_shift_command() {
        // delimiter with one expansion byte
        let mut pdu = vec![0x86 | 0x20, 0xA6, 0x07, 0x01, 0x02, 0x03, 0xEE, 1, 3, 0, 0, 0x55];
        pdu.push(crate::command::checksum(&pdu));
        let bytes = HartIpResponse::encode(MessageType::Response, MessageId::HartWiredPdu, 0, 1, &pdu);
        let rsp = HartIpResponse::from_bytes(&bytes).unwrap();

        assert_eq!(rsp.command, 1);
        assert_eq!(rsp.data, vec![0x55]);
    }

    #[test]
    fn test_session_initiate_reply() {
        let body = [1, 0x00, 0x09, 0x27, 0xC0];
        let bytes = HartIpResponse::encode(
            MessageType::Response,
            MessageId::SessionInitiate,
            8,
            0,
            &body,
        );
        let rsp = HartIpResponse::from_bytes(&bytes).unwrap();

        assert_eq!(rsp.response_code, 8);
        assert_eq!(rsp.data, body.to_vec());
        assert_eq!(rsp.inactivity_close_time(), Some(600_000));
    }

    #[test]
    fn test_empty_body_takes_status() {
        let bytes = HartIpResponse::encode(MessageType::Nak, MessageId::KeepAlive, 15, 4, &[]);
        let rsp = HartIpResponse::from_bytes(&bytes).unwrap();
        assert_eq!(rsp.response_code, 15);
        assert!(!rsp.is_valid_response());
    }

    #[test]
    fn test_oversized_body_is_truncated() {
        let mut bytes = HartIpResponse::encode(
            MessageType::Response,
            MessageId::Discovery,
            0,
            1,
            &vec![0xAB; 600],
        );
        bytes.truncate(HEADER_SIZE + 600);
        let rsp = HartIpResponse::from_bytes(&bytes).unwrap();
        assert_eq!(rsp.body.len(), MAX_BODY_LEN);
    }

    #[test]
    fn test_truncated_pdu_is_reported() {
        let pdu = ResponsePdu::success(Address::Short(0), 20, vec![0x41; 32]).to_bytes();
        let bytes = HartIpResponse::encode(
            MessageType::Response,
            MessageId::HartWiredPdu,
            0,
            1,
            &pdu[..10],
        );
        let err = HartIpResponse::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("response too short for command 20"));
    }

    #[test]
    fn test_truncated_message_is_reported() {
        let mut bytes = HartIpResponse::encode(MessageType::Response, MessageId::HartWiredPdu, 0, 1, &[1, 2, 3]);
        bytes.pop();
        assert!(HartIpResponse::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_unwrap_tunnel() {
        let sub = DeviceId::new(0x1A2B, 0x000102);
        let inner = ResponsePdu::success(Address::Long(sub), 1, vec![0x27, 0x40, 0x48, 0xF5, 0xC3]);
        let mut outer_data = vec![2, 3];
        outer_data.extend_from_slice(&inner.to_bytes());
        let root = DeviceId::new(0xE1F6, 1);
        let outer = ResponsePdu::success(Address::Long(root), 77, outer_data);

        let rsp = HartIpResponse::from_bytes(&pdu_message(7, &outer)).unwrap();
        assert!(rsp.is_tunneled());

        let unwrapped = rsp.unwrap_tunnel().unwrap();
        assert_eq!(unwrapped.command, 1);
        assert_eq!(unwrapped.data, vec![0x27, 0x40, 0x48, 0xF5, 0xC3]);
        assert_eq!(unwrapped.transaction_id(), 7);
        assert!(!unwrapped.is_tunneled());
        assert_eq!(rsp.command, 77);
    }

    #[test]
    fn test_unwrap_non_tunnel_is_rejected() {
        let rsp = HartIpResponse::for_command(0, 0, &[254]);
        assert!(rsp.unwrap_tunnel().is_err());
    }

    #[test]
    fn test_error_ranges() {
        assert!(is_error_code(2));
        assert!(is_error_code(16));
        assert!(is_error_code(64));
        assert!(!is_error_code(0));
        assert!(!is_error_code(8));
        assert!(!is_error_code(24));
        assert!(ResponseClass::Busy.is_delayed());
        assert!(!ResponseClass::DrDead.is_delayed());
    }

    #[test]
    fn test_display_lists_body() {
        let rsp = HartIpResponse::for_command(0, 0, &[]);
        let text = rsp.to_string();
        assert!(text.contains("Rx: Message Header: Ver: 1, MsgType: 1, MsgId: 3"));
        assert!(text.ends_with("ByteCount: 7, Data: 06 80 00 02 00 00 84"));
    }
}
