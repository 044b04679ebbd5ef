//! Zigbee gateway control core
//!
//! Receives APS/ZCL/ZDP traffic from the radio-coprocessor abstraction and
//! drives, per physical device, a long-lived supervisor that discovers the
//! device, matches it to a device description file, keeps its resource
//! items in sync with the network and exposes them to the REST/WebSocket
//! layer.

pub mod access;
pub mod aps_wrapper;
pub mod clock;
pub mod core;
pub mod ddf;
pub mod device;
pub mod device_tick;
pub mod event;
pub mod event_bus;
pub mod js;
pub mod resource;
pub mod state_change;
pub mod uniqueid;

pub use crate::core::GatewayCore;
pub use aps_wrapper::{ApsCtrlWrapper, ApsSend};
pub use clock::{steady_now, system_now_ms, SteadyTime};
pub use event::Event;
pub use event_bus::EventBus;
pub use resource::{
    DataType, DeviceKey, ItemValue, Resource, ResourceContainer, ResourceItem, SetValueError,
    ValueSource,
};
