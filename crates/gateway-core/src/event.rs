//! In-process events
//!
//! Events are small value types. Most carry a `num` payload which is also
//! used to pack compound codes (APS confirm id+status, ZCL
//! cluster+sequence+status, ZDP sequence+status, timer id+timeout). Larger
//! payloads go through the bounded inline-data ring owned by the event bus;
//! readers verify `(index, generation)` before touching the bytes.

use crate::resource::DeviceKey;

// Stable event identifiers used across the bus.
pub const REVENT_ADDED: &str = "added";
pub const REVENT_DELETED: &str = "deleted";
pub const REVENT_POLL: &str = "poll";
pub const REVENT_POLL_DONE: &str = "poll.done";
pub const REVENT_AWAKE: &str = "awake";
pub const REVENT_APS_CONFIRM: &str = "aps.confirm";
pub const REVENT_NODE_DESCRIPTOR: &str = "node.descriptor";
pub const REVENT_ACTIVE_ENDPOINTS: &str = "active.endpoints";
pub const REVENT_SIMPLE_DESCRIPTOR: &str = "simple.descriptor";
// historical spelling, kept stable on the wire
pub const REVENT_DEVICE_ANNOUNCE: &str = "device.anounce";
pub const REVENT_PERMIT_JOIN_ENABLED: &str = "permit.join.enabled";
pub const REVENT_PERMIT_JOIN_DISABLED: &str = "permit.join.disabled";
pub const REVENT_PERMIT_JOIN_RUNNING: &str = "permit.join.running";
pub const REVENT_DDF_INIT_REQUEST: &str = "ddf.init.req";
pub const REVENT_DDF_INIT_RESPONSE: &str = "ddf.init.rsp";
pub const REVENT_DDF_RELOAD: &str = "ddf.reload";
pub const REVENT_STATE_ENTER: &str = "state.enter";
pub const REVENT_STATE_LEAVE: &str = "state.leave";
pub const REVENT_STATE_TIMEOUT: &str = "state.timeout";
pub const REVENT_TIMER_FIRED: &str = "timerfired";
pub const REVENT_DEVICE_ALARM: &str = "devicealarm";
pub const REVENT_TICK: &str = "tick";
pub const REVENT_BINDING_TABLE: &str = "binding.table";
pub const REVENT_ZCL_RESPONSE: &str = "zcl.response";
pub const REVENT_ZDP_RESPONSE: &str = "zdp.response";

/// Reference into the event-data ring: slot index, generation, byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDataRef {
    pub index: u16,
    pub generation: u16,
    pub size: u16,
}

/// A small value-typed event.
#[derive(Debug, Clone)]
pub struct Event {
    resource: &'static str,
    what: &'static str,
    id: String,
    num: i64,
    num_prev: i64,
    device_key: DeviceKey,
    data: Option<EventDataRef>,
    urgent: bool,
}

impl Event {
    #[must_use]
    pub fn new(resource: &'static str, what: &'static str, num: i64, device_key: DeviceKey) -> Self {
        Self {
            resource,
            what,
            id: String::new(),
            num,
            num_prev: 0,
            device_key,
            data: None,
            urgent: false,
        }
    }

    #[must_use]
    pub fn with_id(
        resource: &'static str,
        what: &'static str,
        id: impl Into<String>,
        num: i64,
        device_key: DeviceKey,
    ) -> Self {
        Self { id: id.into(), ..Self::new(resource, what, num, device_key) }
    }

    #[must_use]
    pub fn with_num_prev(mut self, num_prev: i64) -> Self {
        self.num_prev = num_prev;
        self
    }

    #[must_use]
    pub(crate) fn with_data(mut self, data: EventDataRef) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn resource(&self) -> &'static str {
        self.resource
    }

    #[must_use]
    pub fn what(&self) -> &'static str {
        self.what
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn num(&self) -> i64 {
        self.num
    }

    #[must_use]
    pub fn num_previous(&self) -> i64 {
        self.num_prev
    }

    #[must_use]
    pub fn device_key(&self) -> DeviceKey {
        self.device_key
    }

    pub fn set_device_key(&mut self, key: DeviceKey) {
        self.device_key = key;
    }

    #[must_use]
    pub fn data_ref(&self) -> Option<EventDataRef> {
        self.data
    }

    #[must_use]
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn set_urgent(&mut self, urgent: bool) {
        self.urgent = urgent;
    }
}

// num packing helpers

/// Packs APS request id and confirm status for `aps.confirm`.
#[must_use]
pub fn aps_confirm_pack(id: u8, status: u8) -> i64 {
    i64::from(id) << 8 | i64::from(status)
}

#[must_use]
pub fn aps_confirm_id(event: &Event) -> u8 {
    (event.num() >> 8) as u8
}

#[must_use]
pub fn aps_confirm_status(event: &Event) -> u8 {
    event.num() as u8
}

/// Packs ZDP sequence number and status for `zdp.response`.
#[must_use]
pub fn zdp_response_pack(sequence: u8, status: u8) -> i64 {
    i64::from(sequence) << 8 | i64::from(status)
}

#[must_use]
pub fn zdp_response_sequence(event: &Event) -> u8 {
    (event.num() >> 8) as u8
}

#[must_use]
pub fn zdp_response_status(event: &Event) -> u8 {
    event.num() as u8
}

/// Packs cluster id, ZCL sequence number and command status for
/// `zcl.response`.
#[must_use]
pub fn zcl_response_pack(cluster_id: u16, sequence: u8, status: u8) -> i64 {
    i64::from(cluster_id) << 16 | i64::from(sequence) << 8 | i64::from(status)
}

#[must_use]
pub fn zcl_response_cluster(event: &Event) -> u16 {
    (event.num() >> 16) as u16
}

#[must_use]
pub fn zcl_response_sequence(event: &Event) -> u8 {
    (event.num() >> 8) as u8
}

#[must_use]
pub fn zcl_response_status(event: &Event) -> u8 {
    event.num() as u8
}

/// Packs timer id and timeout (ms) for timer events.
#[must_use]
pub fn timer_pack(timer_id: u8, timeout_ms: i64) -> i64 {
    debug_assert!(timeout_ms <= 0xff_ffff);
    i64::from(timer_id) << 24 | (timeout_ms & 0xff_ffff)
}

#[must_use]
pub fn timer_id(event: &Event) -> u8 {
    (event.num() >> 24) as u8
}

#[must_use]
pub fn timer_timeout(event: &Event) -> i64 {
    event.num() & 0xff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::R_DEVICES;

    #[test]
    fn aps_confirm_roundtrip() {
        let ev = Event::new(R_DEVICES, REVENT_APS_CONFIRM, aps_confirm_pack(0x2a, 0xe1), 1);
        assert_eq!(aps_confirm_id(&ev), 0x2a);
        assert_eq!(aps_confirm_status(&ev), 0xe1);
    }

    #[test]
    fn zcl_response_roundtrip() {
        let num = zcl_response_pack(0x0402, 0x42, 0x86);
        let ev = Event::new(R_DEVICES, REVENT_ZCL_RESPONSE, num, 1);
        assert_eq!(zcl_response_cluster(&ev), 0x0402);
        assert_eq!(zcl_response_sequence(&ev), 0x42);
        assert_eq!(zcl_response_status(&ev), 0x86);
    }

    #[test]
    fn zdp_response_roundtrip() {
        let num = zdp_response_pack(0x17, 0x84);
        let ev = Event::new(R_DEVICES, REVENT_ZDP_RESPONSE, num, 1);
        assert_eq!(zdp_response_sequence(&ev), 0x17);
        assert_eq!(zdp_response_status(&ev), 0x84);
    }

    #[test]
    fn timer_roundtrip() {
        let num = timer_pack(3, 60_000);
        let ev = Event::new(R_DEVICES, REVENT_TIMER_FIRED, num, 0);
        assert_eq!(timer_id(&ev), 3);
        assert_eq!(timer_timeout(&ev), 60_000);
    }
}
