//! # HART-IP Client Library
//!
//! A Rust library for talking to HART field devices, gateways and I/O
//! systems over IP with the HART-IP protocol.
//!
//! The crate is the protocol engine of a HART-IP host: message framing,
//! the session lifecycle, correlation of concurrent requests with their
//! responses, the Delay-Retry sub-protocol, discovery of the device tree
//! behind an endpoint, command 77 tunneling to sub-devices, and a decoder
//! that renders response payloads as named fields from a layout file.
//!
//! ## Features
//!
//! - **UDP and TCP** transports, default port 5094
//! - **Sessions** with negotiated inactivity close time, keep alive and an
//!   optional background inactivity monitor
//! - **Concurrent requests** matched by transaction id
//! - **Delay-Retry** with bounded backoff, user abort and flush of stale
//!   delayed responses
//! - **Discovery** of the polled device and, for bridges, its sub-devices
//! - **Publish notifications** delivered to subscribed callbacks
//! - **No panics**: all errors returned as `Result<T, HartError>`
//!
//! ## Quick Start
//!
//! ```no_run
//! use hart_ip::{ClientConfig, HartClient, TransportKind, HART_IP_PORT};
//! use std::time::Duration;
//!
//! fn main() -> hart_ip::Result<()> {
//!     let client = HartClient::new(ClientConfig::default());
//!     client.connect("192.168.1.20", HART_IP_PORT, TransportKind::Udp, Duration::from_secs(60))?;
//!
//!     client.discover_devices()?;
//!     for device in client.devices() {
//!         println!("{}", device);
//!     }
//!
//!     // command 1, read primary variable, to the first sub-device
//!     if let Some(device) = client.devices().get(1) {
//!         let response = client.send_request(1, "", device.id.device_type, device.id.device_id)?;
//!         println!("PV bytes: {:02X?}", response.data);
//!     }
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! ## Building Frames
//!
//! ```
//! use hart_ip::{Address, CommandFrame, DeviceId, HartIpRequest};
//!
//! let device = DeviceId::new(0x2607, 0x0A0B0C);
//! let frame = CommandFrame::new(Address::Long(device), 1, Vec::new());
//! let request = HartIpRequest::hart_command(7, &frame)?;
//!
//! assert_eq!(request.transaction_id(), 7);
//! assert_eq!(request.body()[0], 0x82);
//! # Ok::<(), hart_ip::HartError>(())
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade. Every frame sent or received,
//! and every error, is also handed to a [`MessageLog`] sink; the default
//! [`LogFacade`] writes them at info level under the `hart_ip::frames`
//! target.
//!
//! ## Error Handling
//!
//! ```no_run
//! use hart_ip::{ClientConfig, ErrorKind, HartClient, TransportKind};
//! use std::time::Duration;
//!
//! let client = HartClient::new(ClientConfig::default());
//! match client.connect("10.0.0.9", 5094, TransportKind::Tcp, Duration::from_secs(30)) {
//!     Ok(_) => println!("connected"),
//!     Err(e) if e.kind() == ErrorKind::Session => println!("server refused: {}", e),
//!     Err(e) => println!("cannot connect: {}", e),
//! }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod command;
pub mod connection;
pub mod correlator;
pub mod decoder;
pub mod device;
pub mod discovery;
mod error;
pub mod header;
pub mod logger;
pub mod message;
pub mod monitor;
pub mod response;
pub mod retry;
pub mod transport;
pub mod utils;

// Public re-exports
pub use client::{ClientConfig, HartClient};
pub use command::{Address, CommandFrame, ResponsePdu};
pub use connection::{Connection, SessionOptions, SessionState};
pub use correlator::SubscriptionId;
pub use decoder::{LayoutTable, ResponseDecoder};
pub use device::{DeviceId, DeviceList, DeviceProfile, FlagAssignment, HartDevice};
pub use discovery::{DiscoveredTopology, DiscoveryOptions};
pub use error::{ErrorKind, HartError, Result};
pub use header::{HartIpHeader, MessageId, MessageType, HEADER_SIZE};
pub use logger::{LogFacade, MessageLog, NullLog};
pub use message::HartIpRequest;
pub use monitor::InactivityAction;
pub use response::{HartIpResponse, ResponseClass};
pub use retry::{AbortHandle, RetryPolicy};
pub use transport::{TransportKind, HART_IP_PORT};
