//! HART field devices and the per-session device list.
//!
//! Devices are discovered with command 0 (the root device found by polling)
//! and command 84 (sub-devices behind a bridge). Sub-devices keep their
//! bridge's [`DeviceId`] as a lookup key rather than a reference, so the
//! list owns every device exactly once.

use std::fmt;

use crate::command::{
    rc, CMD_READ_IO_CAPABILITIES, CMD_READ_LONG_TAG, CMD_READ_SUB_DEVICE_COUNT,
    CMD_READ_SUB_DEVICE_IDENTITY, CMD_READ_TAG_DESCRIPTOR, CMD_READ_UNIQUE_ID,
};
use crate::error::{HartError, Result};
use crate::response::HartIpResponse;
use crate::utils::{ascii_field, unpack_ascii};

/// Length of a long tag (command 20 and command 84).
pub const LONG_TAG_LEN: usize = 32;

/// Minimum command 84 data length (index through long tag).
const SUB_DEVICE_IDENTITY_LEN: usize = 44;

/// Expansion code found in the first byte of a command 0 reply.
const EXPANSION_CODE: u8 = 254;

/// Unique identifier of a HART device: expanded device type and 24-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId {
    /// Expanded device type.
    pub device_type: u16,
    /// Device id (lower 24 bits significant).
    pub device_id: u32,
}

impl DeviceId {
    /// Creates a device identifier, masking the id to 24 bits.
    pub fn new(device_type: u16, device_id: u32) -> Self {
        Self {
            device_type,
            device_id: device_id & 0x00FF_FFFF,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:06X}", self.device_type, self.device_id)
    }
}

/// Device profile from the command 0 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceProfile {
    /// Profile not reported.
    Unknown,
    /// Process automation device.
    Process,
    /// Discrete device.
    Discrete,
    /// Hybrid process/discrete device.
    Hybrid,
    /// I/O system.
    IoSystem,
    /// Wireless process device.
    WirelessProcess,
    /// Wireless discrete device.
    WirelessDiscrete,
    /// Wireless hybrid device.
    WirelessHybrid,
    /// Wireless gateway.
    WirelessGateway,
    /// Wireless process adapter.
    WirelessProcessAdapter,
    /// Wireless discrete adapter.
    WirelessDiscreteAdapter,
    /// Wireless handheld.
    WirelessHandheld,
}

impl DeviceProfile {
    /// Maps the profile byte; unassigned codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Process,
            2 => Self::Discrete,
            3 => Self::Hybrid,
            4 => Self::IoSystem,
            0x81 => Self::WirelessProcess,
            0x82 => Self::WirelessDiscrete,
            0x83 => Self::WirelessHybrid,
            0x84 => Self::WirelessGateway,
            0x8D => Self::WirelessProcessAdapter,
            0x8E => Self::WirelessDiscreteAdapter,
            0x90 => Self::WirelessHandheld,
            _ => Self::Unknown,
        }
    }

    /// Returns whether the profile is one of the wireless variants.
    pub fn is_wireless(self) -> bool {
        matches!(
            self,
            Self::WirelessProcess
                | Self::WirelessDiscrete
                | Self::WirelessHybrid
                | Self::WirelessGateway
                | Self::WirelessProcessAdapter
                | Self::WirelessDiscreteAdapter
                | Self::WirelessHandheld
        )
    }

    /// Display name of the profile.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Process => "Process",
            Self::Discrete => "Discrete",
            Self::Hybrid => "Hybrid",
            Self::IoSystem => "IO System",
            Self::WirelessProcess => "Wireless Process",
            Self::WirelessDiscrete => "Wireless Discrete",
            Self::WirelessHybrid => "Wireless Hybrid",
            Self::WirelessGateway => "Wireless Gateway",
            Self::WirelessProcessAdapter => "Wireless Process Adapter",
            Self::WirelessDiscreteAdapter => "Wireless Discrete Adapter",
            Self::WirelessHandheld => "Wireless Handheld",
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag assignment byte of the command 0 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlagAssignment(pub u8);

impl FlagAssignment {
    /// Multi-sensor field device.
    pub const MULTI_SENSOR: u8 = 0x01;
    /// EEPROM control.
    pub const EEPROM_CONTROL: u8 = 0x02;
    /// Protocol bridge device.
    pub const PROTOCOL_BRIDGE: u8 = 0x04;
    /// IEEE 802.15.4 DSSS with O-QPSK modulation.
    pub const DSSS_O_QPSK: u8 = 0x08;
    /// C8PSK capable field device.
    pub const C8PSK_CAPABLE: u8 = 0x40;
    /// C8PSK in multi-drop only.
    pub const C8PSK_MULTI_DROP_ONLY: u8 = 0x80;

    /// Returns whether `flag` is set.
    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }
}

/// A HART device known to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HartDevice {
    /// Unique identifier.
    pub id: DeviceId,
    /// Universal command revision.
    pub universal_revision: u8,
    /// Tag, or a generated `Unknown (...)` name.
    pub name: String,
    /// Device profile.
    pub profile: DeviceProfile,
    /// Flag assignment.
    pub flags: FlagAssignment,
    /// I/O card of a sub-device (0 for the root).
    pub io_card: u8,
    /// Channel of a sub-device (0 for the root).
    pub channel: u8,
    /// Bridge this device is reached through.
    pub parent: Option<DeviceId>,
    /// Number of sub-devices behind a bridge.
    pub sub_device_count: u16,
    /// Polling address the root answered on.
    pub polling_address: u8,
}

impl HartDevice {
    /// Creates a device with the default name and no classification.
    pub fn new(id: DeviceId, universal_revision: u8, parent: Option<DeviceId>) -> Self {
        Self {
            id,
            universal_revision,
            name: default_name(id, universal_revision),
            profile: DeviceProfile::Unknown,
            flags: FlagAssignment::default(),
            io_card: 0,
            channel: 0,
            parent,
            sub_device_count: 0,
            polling_address: 0,
        }
    }

    /// Builds the root device from a command 0 reply.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidResponse` if the reply is not a successful
    /// command 0 response with at least 12 data bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{DeviceProfile, HartDevice, HartIpResponse};
    ///
    /// let data = [254, 0xE1, 0xF6, 5, 7, 1, 1, 8, 0x04, 0x00, 0x00, 0x2A,
    ///             5, 0, 0, 0, 0, 0, 0, 0, 0, 0x84];
    /// let rsp = HartIpResponse::for_command(0, 0, &data);
    /// let device = HartDevice::from_identity(&rsp, 0).unwrap();
    ///
    /// assert_eq!(device.id.device_type, 0xE1F6);
    /// assert_eq!(device.id.device_id, 42);
    /// assert_eq!(device.profile, DeviceProfile::WirelessGateway);
    /// assert!(device.is_bridge());
    /// ```
    pub fn from_identity(response: &HartIpResponse, polling_address: u8) -> Result<Self> {
        expect_command(response, CMD_READ_UNIQUE_ID, 12)?;
        let data = &response.data;
        if data[0] != EXPANSION_CODE {
            return Err(HartError::invalid_response(format!(
                "command 0 expansion code {} is not 254",
                data[0]
            )));
        }

        let device_type = u16::from_be_bytes([data[1], data[2]]);
        let universal_revision = data[4];
        let device_id = (u32::from(data[9]) << 16) | (u32::from(data[10]) << 8) | u32::from(data[11]);

        let mut device = Self::new(DeviceId::new(device_type, device_id), universal_revision, None);
        device.flags = FlagAssignment(data[8]);
        if universal_revision >= 7 && data.len() >= 22 {
            device.profile = DeviceProfile::from_code(data[21]);
        }
        device.polling_address = polling_address;
        Ok(device)
    }

    /// Builds a sub-device of `parent` from a command 84 reply.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidResponse` if the reply is not a successful
    /// command 84 response with at least 44 data bytes.
    pub fn from_sub_device_identity(response: &HartIpResponse, parent: &HartDevice) -> Result<Self> {
        expect_command(response, CMD_READ_SUB_DEVICE_IDENTITY, SUB_DEVICE_IDENTITY_LEN)?;
        let data = &response.data;

        let device_type = u16::from_be_bytes([data[6], data[7]]);
        let device_id = (u32::from(data[8]) << 16) | (u32::from(data[9]) << 8) | u32::from(data[10]);
        let universal_revision = data[11];

        let mut device = Self::new(
            DeviceId::new(device_type, device_id),
            universal_revision,
            Some(parent.id),
        );
        device.io_card = data[2];
        device.channel = data[3];

        let tag = ascii_field(&data[12..12 + LONG_TAG_LEN]);
        if !tag.is_empty() {
            device.name = tag;
        }
        Ok(device)
    }

    /// Returns whether the device multiplexes sub-devices.
    pub fn is_bridge(&self) -> bool {
        self.profile == DeviceProfile::WirelessGateway
            || self.profile == DeviceProfile::IoSystem
            || self.flags.contains(FlagAssignment::PROTOCOL_BRIDGE)
    }

    /// Returns whether the device has a wireless profile.
    pub fn is_wireless(&self) -> bool {
        self.profile.is_wireless()
    }

    /// Returns whether the device is a root (not reached through a bridge).
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Display for HartDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] rev {}", self.name, self.id, self.universal_revision)?;
        if self.parent.is_some() {
            write!(f, " (card {}, channel {})", self.io_card, self.channel)?;
        }
        Ok(())
    }
}

/// Name given to a device without a tag, shaped like a MAC address.
///
/// Devices with universal revision 7 or later use the HART OUI `00-1B-1E`.
///
/// # Example
///
/// ```
/// use hart_ip::device::{default_name, DeviceId};
///
/// let id = DeviceId::new(0x2607, 0x0A0B0C);
/// assert_eq!(default_name(id, 7), "Unknown (00-1B-1E-26-07-0A-0B-0C)");
/// assert_eq!(default_name(id, 5), "Unknown (00-00-00-26-07-0A-0B-0C)");
/// ```
pub fn default_name(id: DeviceId, universal_revision: u8) -> String {
    let oui = if universal_revision >= 7 {
        "00-1B-1E"
    } else {
        "00-00-00"
    };
    format!(
        "Unknown ({}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X})",
        oui,
        id.device_type >> 8,
        id.device_type & 0xFF,
        (id.device_id >> 16) & 0xFF,
        (id.device_id >> 8) & 0xFF,
        id.device_id & 0xFF
    )
}

/// Extracts the tag from a command 20 (long tag) or command 13 (packed tag)
/// reply. An empty string means the device has no tag configured.
///
/// # Errors
///
/// Returns `HartError::InvalidResponse` for any other command, an error
/// response code or a short payload.
pub fn parse_tag(response: &HartIpResponse) -> Result<String> {
    match u16::from(response.command) {
        CMD_READ_LONG_TAG => {
            expect_command(response, CMD_READ_LONG_TAG, 1)?;
            let end = response.data.len().min(LONG_TAG_LEN);
            Ok(ascii_field(&response.data[..end]))
        }
        CMD_READ_TAG_DESCRIPTOR => {
            expect_command(response, CMD_READ_TAG_DESCRIPTOR, 6)?;
            Ok(unpack_ascii(&response.data[..6]).trim_end().to_string())
        }
        other => Err(HartError::invalid_response(format!(
            "command {} does not carry a tag",
            other
        ))),
    }
}

/// Reads the sub-device count from a command 74 or command 128 reply.
///
/// The command 74 count includes the I/O system itself and is decremented.
///
/// # Errors
///
/// Returns `HartError::InvalidResponse` for any other command, an error
/// response code or a short payload.
pub fn parse_sub_device_count(response: &HartIpResponse) -> Result<u16> {
    match u16::from(response.command) {
        CMD_READ_IO_CAPABILITIES => {
            expect_command(response, CMD_READ_IO_CAPABILITIES, 5)?;
            let count = u16::from_be_bytes([response.data[3], response.data[4]]);
            Ok(count.saturating_sub(1))
        }
        CMD_READ_SUB_DEVICE_COUNT => {
            expect_command(response, CMD_READ_SUB_DEVICE_COUNT, 10)?;
            Ok(u16::from_be_bytes([response.data[8], response.data[9]]))
        }
        other => Err(HartError::invalid_response(format!(
            "command {} does not report sub-devices",
            other
        ))),
    }
}

fn expect_command(response: &HartIpResponse, command: u16, min_data: usize) -> Result<()> {
    if u16::from(response.command) != command {
        return Err(HartError::invalid_response(format!(
            "expected command {} reply, got command {}",
            command, response.command
        )));
    }
    if response.response_code != rc::SUCCESS {
        return Err(HartError::invalid_response(format!(
            "command {} failed with response code {}",
            command, response.response_code
        )));
    }
    if response.data.len() < min_data {
        return Err(HartError::invalid_response(format!(
            "command {} reply too short: expected {} data bytes, got {}",
            command,
            min_data,
            response.data.len()
        )));
    }
    Ok(())
}

/// Devices discovered during one session.
///
/// The list only grows while connected and is cleared as a whole on
/// disconnect or reconnect. The first device pushed is the root.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<HartDevice>,
}

impl DeviceList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a device.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidParameter` if a device with the same
    /// identifier is already listed.
    pub fn push(&mut self, device: HartDevice) -> Result<()> {
        if self.find_by_id(device.id).is_some() {
            return Err(HartError::invalid_parameter(
                "device",
                format!("{} is already in the device list", device.id),
            ));
        }
        self.devices.push(device);
        Ok(())
    }

    /// Root device, the first one found by polling.
    pub fn root(&self) -> Option<&HartDevice> {
        self.devices.first()
    }

    /// Finds a device by device type and device id.
    pub fn find(&self, device_type: u16, device_id: u32) -> Option<&HartDevice> {
        self.find_by_id(DeviceId::new(device_type, device_id))
    }

    /// Finds a device by identifier.
    pub fn find_by_id(&self, id: DeviceId) -> Option<&HartDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// First bridge device in the list, the target of flush commands.
    pub fn network_device(&self) -> Option<&HartDevice> {
        self.devices.iter().find(|d| d.is_bridge())
    }

    /// Bridge a device is reached through.
    pub fn parent_of(&self, device: &HartDevice) -> Option<&HartDevice> {
        device.parent.and_then(|id| self.find_by_id(id))
    }

    /// Sub-devices of a bridge.
    pub fn children_of(&self, parent: DeviceId) -> impl Iterator<Item = &HartDevice> {
        self.devices.iter().filter(move |d| d.parent == Some(parent))
    }

    /// All devices in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &HartDevice> {
        self.devices.iter()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns whether no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Removes every device.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Copies the devices out.
    pub fn to_vec(&self) -> Vec<HartDevice> {
        self.devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_data(profile: u8, flags: u8, revision: u8) -> Vec<u8> {
        let mut data = vec![254, 0x26, 0x07, 5, revision, 1, 1, 8, flags, 0x0A, 0x0B, 0x0C];
        data.extend_from_slice(&[5, 0, 0, 0, 0, 0, 0, 0, 0, profile]);
        data
    }

    fn sub_device_data(tag: &str) -> Vec<u8> {
        let mut data = vec![0x00, 0x01, 2, 3, 0x00, 0x26, 0x1A, 0x2B, 0x00, 0x01, 0x02, 7];
        let mut tag_bytes = tag.as_bytes().to_vec();
        tag_bytes.resize(LONG_TAG_LEN, 0);
        data.extend_from_slice(&tag_bytes);
        data
    }

    #[test]
    fn test_identity_leaf_device() {
        let rsp = HartIpResponse::for_command(0, 0, &identity_data(1, 0, 7));
        let device = HartDevice::from_identity(&rsp, 3).unwrap();

        assert_eq!(device.id, DeviceId::new(0x2607, 0x0A0B0C));
        assert_eq!(device.profile, DeviceProfile::Process);
        assert_eq!(device.polling_address, 3);
        assert!(!device.is_bridge());
        assert!(device.is_root());
        assert_eq!(device.name, "Unknown (00-1B-1E-26-07-0A-0B-0C)");
    }

    #[test]
    fn test_identity_profile_ignored_before_revision_7() {
        let rsp = HartIpResponse::for_command(0, 0, &identity_data(4, 0, 6));
        let device = HartDevice::from_identity(&rsp, 0).unwrap();
        assert_eq!(device.profile, DeviceProfile::Unknown);
    }

    #[test]
    fn test_bridge_classification() {
        let io = HartIpResponse::for_command(0, 0, &identity_data(4, 0, 7));
        assert!(HartDevice::from_identity(&io, 0).unwrap().is_bridge());

        let flagged = HartIpResponse::for_command(0, 0, &identity_data(1, 0x05, 7));
        assert!(HartDevice::from_identity(&flagged, 0).unwrap().is_bridge());
    }

    #[test]
    fn test_identity_rejects_short_reply() {
        let rsp = HartIpResponse::for_command(0, 0, &[254, 0x26, 0x07]);
        assert!(HartDevice::from_identity(&rsp, 0).is_err());
    }

    #[test]
    fn test_sub_device_identity() {
        let root = HartDevice::new(DeviceId::new(0xE1F6, 1), 7, None);
        let rsp = HartIpResponse::for_command(84, 0, &sub_device_data("FT-301  "));
        let sub = HartDevice::from_sub_device_identity(&rsp, &root).unwrap();

        assert_eq!(sub.id, DeviceId::new(0x1A2B, 0x000102));
        assert_eq!(sub.io_card, 2);
        assert_eq!(sub.channel, 3);
        assert_eq!(sub.universal_revision, 7);
        assert_eq!(sub.name, "FT-301");
        assert_eq!(sub.parent, Some(root.id));
    }

    #[test]
    fn test_sub_device_without_tag_gets_default_name() {
        let root = HartDevice::new(DeviceId::new(0xE1F6, 1), 7, None);
        let rsp = HartIpResponse::for_command(84, 0, &sub_device_data(""));
        let sub = HartDevice::from_sub_device_identity(&rsp, &root).unwrap();
        assert_eq!(sub.name, "Unknown (00-1B-1E-1A-2B-00-01-02)");
    }

    #[test]
    fn test_parse_tags() {
        let mut long = b"PT-100".to_vec();
        long.resize(LONG_TAG_LEN, 0);
        let rsp = HartIpResponse::for_command(20, 0, &long);
        assert_eq!(parse_tag(&rsp).unwrap(), "PT-100");

        let mut packed = crate::utils::pack_ascii("TT-2");
        packed.extend_from_slice(&crate::utils::pack_ascii("00"));
        let rsp = HartIpResponse::for_command(13, 0, &packed);
        assert_eq!(parse_tag(&rsp).unwrap(), "TT-200");
    }

    #[test]
    fn test_sub_device_counts() {
        let cmd74 = HartIpResponse::for_command(74, 0, &[1, 1, 4, 0x00, 0x05, 0, 0, 0]);
        assert_eq!(parse_sub_device_count(&cmd74).unwrap(), 4);

        let cmd128 = HartIpResponse::for_command(128, 0, &[0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x03]);
        assert_eq!(parse_sub_device_count(&cmd128).unwrap(), 3);

        let failed = HartIpResponse::for_command(74, 64, &[]);
        assert!(parse_sub_device_count(&failed).is_err());
    }

    #[test]
    fn test_device_list_rejects_duplicates() {
        let mut list = DeviceList::new();
        let root = HartDevice::new(DeviceId::new(0xE1F6, 1), 7, None);
        list.push(root.clone()).unwrap();
        assert!(list.push(root).is_err());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_device_list_queries() {
        let mut list = DeviceList::new();
        let mut root = HartDevice::new(DeviceId::new(0xE1F6, 1), 7, None);
        root.profile = DeviceProfile::WirelessGateway;
        let sub = HartDevice::new(DeviceId::new(0x1A2B, 2), 7, Some(root.id));
        list.push(root.clone()).unwrap();
        list.push(sub.clone()).unwrap();

        assert_eq!(list.root().map(|d| d.id), Some(root.id));
        assert_eq!(list.network_device().map(|d| d.id), Some(root.id));
        assert_eq!(list.find(0x1A2B, 2).map(|d| d.id), Some(sub.id));
        assert_eq!(list.parent_of(&sub).map(|d| d.id), Some(root.id));
        assert_eq!(list.children_of(root.id).count(), 1);

        list.clear();
        assert!(list.is_empty());
    }
}
