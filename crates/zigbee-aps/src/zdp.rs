//! ZDP (Zigbee Device Profile) discovery payloads
//!
//! ZDP runs over cluster ids on endpoint 0 with profile 0. Responses echo
//! the request cluster with bit 15 set.

use crate::types::{Address, AddressMode, ApsDataRequest, ProtocolError, profiles};
use crate::zcl::Reader;

/// ZDP cluster IDs used by the discovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ZdoCluster {
    NodeDescReq = 0x0002,
    SimpleDescReq = 0x0004,
    ActiveEpReq = 0x0005,
    DeviceAnnce = 0x0013,
    MgmtBindReq = 0x0033,
    NodeDescRsp = 0x8002,
    SimpleDescRsp = 0x8004,
    ActiveEpRsp = 0x8005,
    MgmtBindRsp = 0x8033,
}

pub mod zdp_status {
    pub const SUCCESS: u8 = 0x00;
    pub const NOT_SUPPORTED: u8 = 0x84;
}

/// ZDP Node Descriptor (the parts the supervisor cares about)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub device_type: u8,
    pub mac_capabilities: u8,
    pub manufacturer_code: u16,
    pub max_buffer_size: u8,
}

impl NodeDescriptor {
    /// MAC capability bit 3: the receiver stays on while idle, i.e. the
    /// device can be reached without waiting for a MAC poll.
    #[must_use]
    pub fn receiver_on_when_idle(&self) -> bool {
        self.mac_capabilities & 0x08 != 0
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == NodeDescriptor::default()
    }

    /// Parse from a Node_Desc_rsp ASDU (after `tsn|status|nwk`).
    pub fn parse(r: &mut Reader) -> Result<Self, ProtocolError> {
        let b0 = r.u8()?;
        let _b1 = r.u8()?;
        let mac_capabilities = r.u8()?;
        let manufacturer_code = r.u16_le()?;
        let max_buffer_size = r.u8()?;
        Ok(Self {
            device_type: b0 & 0x07,
            mac_capabilities,
            manufacturer_code,
            max_buffer_size,
        })
    }
}

/// ZDP Simple Descriptor of one endpoint
#[derive(Debug, Clone, Default)]
pub struct SimpleDescriptor {
    pub endpoint: u8,
    pub profile_id: u16,
    pub device_id: u16,
    pub device_version: u8,
    pub in_clusters: Vec<u16>,
    pub out_clusters: Vec<u16>,
}

impl SimpleDescriptor {
    #[must_use]
    pub fn has_server_cluster(&self, cluster_id: u16) -> bool {
        self.in_clusters.contains(&cluster_id)
    }
}

/// Device_annce payload (cluster 0x0013)
#[derive(Debug, Clone, Copy)]
pub struct DeviceAnnouncement {
    pub tsn: u8,
    pub nwk: u16,
    pub ext: u64,
    pub mac_capabilities: u8,
}

impl DeviceAnnouncement {
    pub fn parse(asdu: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(asdu);
        let tsn = r.u8()?;
        let nwk = r.u16_le()?;
        let ext = r.u64_le()?;
        let mac_capabilities = r.u8()?;
        Ok(Self { tsn, nwk, ext, mac_capabilities })
    }

    #[must_use]
    pub fn rx_on_when_idle(&self) -> bool {
        self.mac_capabilities & 0x08 != 0
    }
}

/// Active_EP_rsp payload (cluster 0x8005)
#[derive(Debug, Clone)]
pub struct ActiveEndpointsResponse {
    pub tsn: u8,
    pub status: u8,
    pub nwk: u16,
    pub endpoints: Vec<u8>,
}

impl ActiveEndpointsResponse {
    pub fn parse(asdu: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(asdu);
        let tsn = r.u8()?;
        let status = r.u8()?;
        let nwk = r.u16_le()?;

        let mut endpoints = Vec::new();
        if status == zdp_status::SUCCESS && !r.at_end() {
            let count = r.u8()? as usize;
            for _ in 0..count {
                endpoints.push(r.u8()?);
            }
        }

        Ok(Self { tsn, status, nwk, endpoints })
    }
}

/// Simple_Desc_rsp payload (cluster 0x8004)
#[derive(Debug, Clone)]
pub struct SimpleDescriptorResponse {
    pub tsn: u8,
    pub status: u8,
    pub nwk: u16,
    pub descriptor: SimpleDescriptor,
}

impl SimpleDescriptorResponse {
    pub fn parse(asdu: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(asdu);
        let tsn = r.u8()?;
        let status = r.u8()?;
        let nwk = r.u16_le()?;

        let mut descriptor = SimpleDescriptor::default();

        if status == zdp_status::SUCCESS {
            let _len = r.u8()?;
            descriptor.endpoint = r.u8()?;
            descriptor.profile_id = r.u16_le()?;
            descriptor.device_id = r.u16_le()?;
            descriptor.device_version = r.u8()? & 0x0f;

            let in_count = r.u8()? as usize;
            for _ in 0..in_count {
                descriptor.in_clusters.push(r.u16_le()?);
            }
            let out_count = r.u8()? as usize;
            for _ in 0..out_count {
                descriptor.out_clusters.push(r.u16_le()?);
            }
        }

        Ok(Self { tsn, status, nwk, descriptor })
    }
}

fn zdp_request(dst: Address, cluster: ZdoCluster, asdu: Vec<u8>) -> ApsDataRequest {
    ApsDataRequest {
        dst_addr_mode: AddressMode::Nwk,
        dst_address: dst,
        dst_endpoint: 0x00,
        src_endpoint: 0x00,
        profile_id: profiles::ZDP,
        cluster_id: cluster as u16,
        asdu,
        tx_options: 0x00,
        radius: 0,
    }
}

/// Builds a Node_Desc_req for \p dst.
#[must_use]
pub fn node_descriptor_request(dst: Address, tsn: u8) -> ApsDataRequest {
    let mut asdu = vec![tsn];
    asdu.extend_from_slice(&dst.nwk.to_le_bytes());
    zdp_request(dst, ZdoCluster::NodeDescReq, asdu)
}

/// Builds an Active_EP_req for \p dst.
#[must_use]
pub fn active_endpoints_request(dst: Address, tsn: u8) -> ApsDataRequest {
    let mut asdu = vec![tsn];
    asdu.extend_from_slice(&dst.nwk.to_le_bytes());
    zdp_request(dst, ZdoCluster::ActiveEpReq, asdu)
}

/// Builds a Simple_Desc_req for one endpoint of \p dst.
#[must_use]
pub fn simple_descriptor_request(dst: Address, endpoint: u8, tsn: u8) -> ApsDataRequest {
    let mut asdu = vec![tsn];
    asdu.extend_from_slice(&dst.nwk.to_le_bytes());
    asdu.push(endpoint);
    zdp_request(dst, ZdoCluster::SimpleDescReq, asdu)
}

/// Builds a Mgmt_Bind_req starting at \p start_index.
#[must_use]
pub fn mgmt_bind_request(dst: Address, start_index: u8, tsn: u8) -> ApsDataRequest {
    zdp_request(dst, ZdoCluster::MgmtBindReq, vec![tsn, start_index])
}
