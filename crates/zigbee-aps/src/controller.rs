//! The `ApsController` boundary trait
//!
//! The radio-coprocessor driver lives outside this workspace; the core only
//! sees this trait plus the node view the driver maintains from ZDP traffic.

use thiserror::Error;

use crate::types::{Address, ApsDataRequest};
use crate::zdp::{NodeDescriptor, SimpleDescriptor};

/// Errors an APS-DATA.request can fail with at enqueue time
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsError {
    #[error("APS request queue full")]
    Busy,

    #[error("not connected to the network")]
    NotConnected,
}

/// Gateway-wide parameters the core may query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    MacAddress,
    NwkAddress,
    PermitJoin,
}

/// A binding table entry as reported by Mgmt_Bind_rsp
#[derive(Debug, Clone, Copy)]
pub struct NodeBinding {
    pub src_address: u64,
    pub src_endpoint: u8,
    pub cluster_id: u16,
    pub dst_address: Address,
    pub dst_endpoint: u8,
    /// Milliseconds since epoch of the last confirmation, 0 if never.
    pub confirmed_ms: i64,
}

/// The coprocessor-side view of one network node.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub address: Address,
    pub node_descriptor: Option<NodeDescriptor>,
    pub endpoints: Vec<u8>,
    pub simple_descriptors: Vec<SimpleDescriptor>,
    pub binding_table: Vec<NodeBinding>,
}

impl Node {
    #[must_use]
    pub fn simple_descriptor(&self, endpoint: u8) -> Option<&SimpleDescriptor> {
        self.simple_descriptors.iter().find(|sd| sd.endpoint == endpoint)
    }

    /// First endpoint carrying \p cluster_id as server cluster.
    #[must_use]
    pub fn endpoint_for_server_cluster(&self, cluster_id: u16) -> Option<u8> {
        self.simple_descriptors
            .iter()
            .find(|sd| sd.has_server_cluster(cluster_id))
            .map(|sd| sd.endpoint)
    }
}

/// Operations the core consumes from the radio coprocessor abstraction.
pub trait ApsController {
    /// Enqueue an APS-DATA.request. Returns the assigned 8-bit request id
    /// which is echoed in the matching APS-DATA.confirm.
    fn aps_request(&mut self, req: &ApsDataRequest) -> Result<u8, ApsError>;

    /// Enumerate the coprocessor's neighbor view.
    fn node(&self, index: usize) -> Option<&Node>;

    /// Node lookup by extended address.
    fn node_for_ext(&self, ext: u64) -> Option<&Node> {
        let mut i = 0;
        while let Some(node) = self.node(i) {
            if node.address.ext == ext {
                return Some(node);
            }
            i += 1;
        }
        None
    }

    /// Gateway parameter access (own MAC/NWK address, permit join).
    fn param(&self, param: Param) -> u64;

    /// The next ZCL transaction sequence number.
    fn next_zcl_sequence(&mut self) -> u8;
}

pub mod testing {
    //! A recording controller used by unit tests across the workspace.

    use super::*;

    #[derive(Default)]
    pub struct MockController {
        pub sent: Vec<ApsDataRequest>,
        pub nodes: Vec<Node>,
        pub next_id: u8,
        pub zcl_seq: u8,
        pub fail_with: Option<ApsError>,
    }

    impl ApsController for MockController {
        fn aps_request(&mut self, req: &ApsDataRequest) -> Result<u8, ApsError> {
            if let Some(err) = self.fail_with {
                return Err(err);
            }
            self.sent.push(req.clone());
            self.next_id = self.next_id.wrapping_add(1);
            Ok(self.next_id)
        }

        fn node(&self, index: usize) -> Option<&Node> {
            self.nodes.get(index)
        }

        fn param(&self, _param: Param) -> u64 {
            0
        }

        fn next_zcl_sequence(&mut self) -> u8 {
            self.zcl_seq = self.zcl_seq.wrapping_add(1);
            self.zcl_seq
        }
    }
}
