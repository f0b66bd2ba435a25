//! HART-IP request messages.
//!
//! # Example
//!
//! ```
//! use hart_ip::{Address, CommandFrame, HartIpRequest};
//!
//! let frame = CommandFrame::new(Address::Short(0), 0, Vec::new());
//! let request = HartIpRequest::hart_command(42, &frame).unwrap();
//!
//! let bytes = request.to_bytes();
//! assert_eq!(&bytes[..8], &[0x01, 0x00, 0x03, 0x00, 0x00, 0x2A, 0x00, 0x0D]);
//! ```

use std::fmt;
use std::time::Duration;

use crate::command::{CommandFrame, MAX_REQUEST_PDU_LEN};
use crate::error::{HartError, Result};
use crate::header::{HartIpHeader, MessageId};
use crate::utils::{format_hex, timestamp};

/// Master type sent in session initiate (primary master).
pub const SESSION_MASTER_TYPE: u8 = 1;

/// A HART-IP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HartIpRequest {
    header: HartIpHeader,
    body: Vec<u8>,
    timeout: Option<Duration>,
    timestamp: String,
}

impl HartIpRequest {
    fn new(message_id: MessageId, transaction_id: u16, body: Vec<u8>) -> Self {
        Self {
            header: HartIpHeader::request(message_id, transaction_id, body.len()),
            body,
            timeout: None,
            timestamp: String::new(),
        }
    }

    /// Session initiate carrying the requested inactivity close time in ms.
    pub fn initiate_session(transaction_id: u16, inactivity_close_time: u32) -> Self {
        let mut body = Vec::with_capacity(5);
        body.push(SESSION_MASTER_TYPE);
        body.extend_from_slice(&inactivity_close_time.to_be_bytes());
        Self::new(MessageId::SessionInitiate, transaction_id, body)
    }

    /// Session close.
    pub fn close_session(transaction_id: u16) -> Self {
        Self::new(MessageId::SessionClose, transaction_id, Vec::new())
    }

    /// Keep alive.
    pub fn keep_alive(transaction_id: u16) -> Self {
        Self::new(MessageId::KeepAlive, transaction_id, Vec::new())
    }

    /// Wired HART PDU request built from a command frame.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidParameter` if the frame cannot be serialized
    /// within the 255-byte request limit.
    pub fn hart_command(transaction_id: u16, frame: &CommandFrame) -> Result<Self> {
        Self::hart_pdu(transaction_id, frame.to_bytes()?)
    }

    /// Wired HART PDU request from already serialized frame bytes.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidParameter` if the PDU is longer than
    /// [`MAX_REQUEST_PDU_LEN`].
    pub fn hart_pdu(transaction_id: u16, pdu: Vec<u8>) -> Result<Self> {
        if pdu.len() > MAX_REQUEST_PDU_LEN {
            return Err(HartError::invalid_parameter(
                "command",
                format!("invalid command length: {}", pdu.len()),
            ));
        }
        Ok(Self::new(MessageId::HartWiredPdu, transaction_id, pdu))
    }

    /// Overrides the response timeout for this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy of this request with another transaction id.
    pub fn with_transaction_id(&self, transaction_id: u16) -> Self {
        let mut request = self.clone();
        request.header.transaction_id = transaction_id;
        request
    }

    /// Records the send time shown in the log line.
    pub(crate) fn stamp(&mut self) {
        self.timestamp = timestamp();
    }

    /// Message header.
    pub fn header(&self) -> &HartIpHeader {
        &self.header
    }

    /// Message id.
    pub fn message_id(&self) -> MessageId {
        self.header.message_id
    }

    /// Transaction id.
    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    /// Body bytes (HART PDU or session payload).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Per-request timeout override.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Serializes header and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.byte_count as usize);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

impl fmt::Display for HartIpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.timestamp.is_empty() {
            write!(f, "{}, ", self.timestamp)?;
        }
        write!(
            f,
            "Tx: {}, TranId: {}, ByteCount: {}",
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

/// Meaning of a session-initiate status byte.
pub fn session_status_description(status: u8) -> &'static str {
    match status {
        0 => "Success No error occurred",
        2 => "Invalid Selection(Invalid Master Type)",
        5 => "Too Few Data Bytes Received",
        6 => "Device Specific Command Error",
        8 => "Set to Nearest Possible Value(Inactivity timer value)",
        14 => "Version not supported",
        15 => "All available sessions in use",
        16 => "Session already established",
        _ => "Unknown status",
    }
}
