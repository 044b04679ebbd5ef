//! APS/ZCL/ZDP boundary types
//!
//! This crate defines the application-support-layer surface the gateway core
//! talks to: addresses, APS-DATA indications and requests, the ZCL frame and
//! attribute codec, ZDP discovery payloads and the `ApsController` trait
//! implemented by the radio-coprocessor driver.

pub mod controller;
pub mod types;
pub mod zcl;
pub mod zdp;

pub use controller::{ApsController, ApsError, Node, NodeBinding, Param};
pub use types::{
    profiles, Address, AddressMode, ApsDataIndication, ApsDataRequest, ApsStatus, ProtocolError,
};
pub use zcl::{basic_attr, clusters, data_type, zcl_command, zcl_status, ZclAttribute, ZclFrame, ZclValue};
pub use zdp::{
    ActiveEndpointsResponse, DeviceAnnouncement, NodeDescriptor, SimpleDescriptor,
    SimpleDescriptorResponse, ZdoCluster,
};
