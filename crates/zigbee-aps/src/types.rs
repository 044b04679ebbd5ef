//! Common types shared by the APS request/indication/confirm triad

use thiserror::Error;

/// Protocol errors raised while decoding boundary frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unknown address mode: {0:#04x}")]
    UnknownAddressMode(u8),

    #[error("Unsupported ZCL data type: {0:#04x}")]
    UnsupportedDataType(u8),
}

/// APS-DATA.confirm status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApsStatus {
    Success = 0x00,
    NoAck = 0xa7,
    NoShortAddress = 0xa9,
    Timeout = 0xf0,
}

/// ZCL profile IDs
pub mod profiles {
    /// ZDP runs over profile 0 on endpoint 0
    pub const ZDP: u16 = 0x0000;
    pub const HOME_AUTOMATION: u16 = 0x0104;
    /// Green power devices live on endpoint 0xf2
    pub const GREEN_POWER_ENDPOINT: u8 = 0xf2;
}

/// Address mode for APS frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AddressMode {
    Group = 0x01,
    #[default]
    Nwk = 0x02,
    Ieee = 0x03,
    NwkAndIeee = 0x04,
}

impl TryFrom<u8> for AddressMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(AddressMode::Group),
            0x02 => Ok(AddressMode::Nwk),
            0x03 => Ok(AddressMode::Ieee),
            0x04 => Ok(AddressMode::NwkAndIeee),
            _ => Err(value),
        }
    }
}

/// A node address holding short (NWK) and extended (IEEE) parts.
///
/// Either part may be unknown (zero) depending on where the address came
/// from; comparisons prefer the extended address when both sides carry one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Address {
    pub nwk: u16,
    pub ext: u64,
    pub group: u16,
}

impl Address {
    #[must_use]
    pub fn nwk(nwk: u16) -> Self {
        Self { nwk, ext: 0, group: 0 }
    }

    #[must_use]
    pub fn ext(ext: u64) -> Self {
        Self { nwk: 0, ext, group: 0 }
    }

    #[must_use]
    pub fn nwk_and_ext(nwk: u16, ext: u64) -> Self {
        Self { nwk, ext, group: 0 }
    }

    /// True when both addresses refer to the same node.
    #[must_use]
    pub fn is_same(&self, other: &Address) -> bool {
        if self.ext != 0 && other.ext != 0 {
            return self.ext == other.ext;
        }
        self.nwk == other.nwk
    }
}

/// APS-DATA.indication: a parsed incoming frame handed to the core
#[derive(Debug, Clone)]
pub struct ApsDataIndication {
    pub dst_addr_mode: AddressMode,
    pub dst_address: Address,
    pub dst_endpoint: u8,
    pub src_addr_mode: AddressMode,
    pub src_address: Address,
    pub src_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub asdu: Vec<u8>,
    pub lqi: u8,
    pub rssi: i8,
}

impl ApsDataIndication {
    /// Format an extended address the way unique ids render their MAC part.
    #[must_use]
    pub fn format_ext(ext: u64) -> String {
        let b = ext.to_be_bytes();
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// APS-DATA.request: an outgoing frame
///
/// The request id is assigned by the controller when the request is enqueued
/// and echoed back in the matching APS-DATA.confirm.
#[derive(Debug, Clone, Default)]
pub struct ApsDataRequest {
    pub dst_addr_mode: AddressMode,
    pub dst_address: Address,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub asdu: Vec<u8>,
    pub tx_options: u8,
    pub radius: u8,
}

/// APS acknowledged transmission flag for `tx_options`.
pub const APS_TX_ACKNOWLEDGED: u8 = 0x04;

impl ApsDataRequest {
    /// A unicast request to the home automation profile.
    #[must_use]
    pub fn unicast(dst: Address, dst_endpoint: u8, cluster_id: u16, asdu: Vec<u8>) -> Self {
        Self {
            dst_addr_mode: AddressMode::Nwk,
            dst_address: dst,
            dst_endpoint,
            src_endpoint: 0x01,
            profile_id: profiles::HOME_AUTOMATION,
            cluster_id,
            asdu,
            tx_options: APS_TX_ACKNOWLEDGED,
            radius: 0,
        }
    }
}
