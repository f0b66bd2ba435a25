//! Device topology discovery.
//!
//! A HART-IP endpoint exposes exactly one device on its polling bus. The
//! discoverer finds it with short-frame command 0, reads its long tag and,
//! when it multiplexes other devices (I/O system, wireless gateway or
//! protocol bridge), enumerates the sub-devices behind it with command 84.
//!
//! ```text
//! cmd 0 @ poll 0..=63 -> root
//! cmd 20              -> root tag
//! cmd 74 | cmd 128    -> sub-device count   (bridges only)
//! cmd 84 #1..=count   -> sub-devices
//! ```

use std::time::Duration;

use crate::command::{
    Address, CommandFrame, CMD_READ_IO_CAPABILITIES, CMD_READ_LONG_TAG, CMD_READ_SUB_DEVICE_COUNT,
    CMD_READ_SUB_DEVICE_IDENTITY, CMD_READ_UNIQUE_ID,
};
use crate::device::{parse_sub_device_count, parse_tag, HartDevice};
use crate::error::{HartError, Result};
use crate::response::HartIpResponse;

/// Default wait for a command 0 reply at one polling address.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(32);

/// Highest short-frame polling address.
pub const MAX_POLLING_ADDRESS: u8 = 63;

/// Sends one HART command and returns the reply.
pub trait PduTransactor {
    /// Sends `frame` and waits up to `timeout` (or the default wait) for the
    /// reply.
    fn transact(&self, frame: &CommandFrame, timeout: Option<Duration>) -> Result<HartIpResponse>;
}

/// Discovery tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryOptions {
    /// Wait per polling address.
    pub poll_timeout: Duration,
    /// Last polling address tried.
    pub max_polling_address: u8,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_polling_address: MAX_POLLING_ADDRESS,
        }
    }
}

/// Result of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTopology {
    /// Root first, then its sub-devices in index order.
    pub devices: Vec<HartDevice>,
    /// Polling address the root answered on.
    pub last_polled: u8,
}

impl DiscoveredTopology {
    /// The device found by polling.
    pub fn root(&self) -> Option<&HartDevice> {
        self.devices.first()
    }
}

/// Walks the device tree behind one HART-IP endpoint.
pub struct TopologyDiscoverer<'a, T: PduTransactor + ?Sized> {
    transactor: &'a T,
    options: DiscoveryOptions,
}

impl<'a, T: PduTransactor + ?Sized> TopologyDiscoverer<'a, T> {
    /// Creates a discoverer sending through `transactor`.
    pub fn new(transactor: &'a T, options: DiscoveryOptions) -> Self {
        let max_polling_address = options.max_polling_address.min(MAX_POLLING_ADDRESS);
        Self {
            transactor,
            options: DiscoveryOptions {
                max_polling_address,
                ..options
            },
        }
    }

    /// Runs discovery.
    ///
    /// Failures after the root was found (tag, count, a sub-device) end that
    /// step with a warning and keep what was found so far.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NoResponse` if no polling address answered, or a
    /// fatal connection error from any step.
    pub fn discover(&self) -> Result<DiscoveredTopology> {
        let (mut root, last_polled) = self.poll()?;
        log::info!(
            "found device {} at polling address {}",
            root.id,
            last_polled
        );

        self.read_tag(&mut root)?;

        let mut devices = Vec::new();
        if root.is_bridge() {
            match self.read_sub_device_count(&root)? {
                Some(count) => {
                    root.sub_device_count = count;
                    log::info!("{} reports {} sub-devices", root.name, count);
                    devices = self.read_sub_devices(&root)?;
                }
                None => log::warn!("cannot read sub-device count of {}", root.name),
            }
        }

        devices.insert(0, root);
        Ok(DiscoveredTopology {
            devices,
            last_polled,
        })
    }

    fn poll(&self) -> Result<(HartDevice, u8)> {
        for address in 0..=self.options.max_polling_address {
            let frame = CommandFrame::new(Address::Short(address), CMD_READ_UNIQUE_ID, Vec::new());
            match self.transactor.transact(&frame, Some(self.options.poll_timeout)) {
                Ok(response) => match HartDevice::from_identity(&response, address) {
                    Ok(device) => return Ok((device, address)),
                    Err(e) => log::debug!("polling address {}: {}", address, e),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log::trace!("polling address {}: {}", address, e),
            }
        }
        log::warn!(
            "no device answered polling addresses 0-{}",
            self.options.max_polling_address
        );
        Err(HartError::NoResponse)
    }

    fn read_tag(&self, device: &mut HartDevice) -> Result<()> {
        let frame = CommandFrame::new(Address::Long(device.id), CMD_READ_LONG_TAG, Vec::new());
        let tag = match self.transactor.transact(&frame, None) {
            Ok(response) => parse_tag(&response),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => Err(e),
        };
        match tag {
            Ok(tag) if !tag.is_empty() => device.name = tag,
            Ok(_) => log::debug!("{} has no tag", device.id),
            Err(e) => log::warn!("cannot read tag of {}: {}", device.id, e),
        }
        Ok(())
    }

    fn read_sub_device_count(&self, bridge: &HartDevice) -> Result<Option<u16>> {
        let command = if bridge.universal_revision >= 7 {
            CMD_READ_IO_CAPABILITIES
        } else {
            CMD_READ_SUB_DEVICE_COUNT
        };
        let frame = CommandFrame::new(Address::Long(bridge.id), command, Vec::new());
        match self.transactor.transact(&frame, None) {
            Ok(response) => match parse_sub_device_count(&response) {
                Ok(count) => Ok(Some(count)),
                Err(e) => {
                    log::warn!("command {} to {}: {}", command, bridge.id, e);
                    Ok(None)
                }
            },
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::warn!("command {} to {}: {}", command, bridge.id, e);
                Ok(None)
            }
        }
    }

    fn read_sub_devices(&self, bridge: &HartDevice) -> Result<Vec<HartDevice>> {
        let mut devices = Vec::with_capacity(usize::from(bridge.sub_device_count));
        for index in 1..=bridge.sub_device_count {
            let frame = CommandFrame::new(
                Address::Long(bridge.id),
                CMD_READ_SUB_DEVICE_IDENTITY,
                index.to_be_bytes().to_vec(),
            );
            let device = match self.transactor.transact(&frame, None) {
                Ok(response) => HartDevice::from_sub_device_identity(&response, bridge),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => Err(e),
            };
            match device {
                Ok(device) => {
                    log::debug!("sub-device {}: {}", index, device);
                    devices.push(device);
                }
                Err(e) => {
                    log::warn!(
                        "sub-device {} of {}: {}, stopping enumeration",
                        index,
                        bridge.name,
                        e
                    );
                    break;
                }
            }
        }
        Ok(devices)
    }
}
