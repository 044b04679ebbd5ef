//! Radio coprocessor integration point
//!
//! The actual serial driver (ConBee/RaspBee firmware protocol) lives
//! outside this workspace and plugs in through the `ApsController` trait.
//! Until one is attached the gateway runs against this disconnected stub:
//! sends fail with `NotConnected` and the neighbor view is empty, which
//! parks device supervisors in their retry loops.

use zigbee_aps::{ApsController, ApsDataRequest, ApsError, Node, Param};

#[derive(Default)]
pub struct DisconnectedController {
    zcl_seq: u8,
}

impl ApsController for DisconnectedController {
    fn aps_request(&mut self, _req: &ApsDataRequest) -> Result<u8, ApsError> {
        Err(ApsError::NotConnected)
    }

    fn node(&self, _index: usize) -> Option<&Node> {
        None
    }

    fn param(&self, _param: Param) -> u64 {
        0
    }

    fn next_zcl_sequence(&mut self) -> u8 {
        self.zcl_seq = self.zcl_seq.wrapping_add(1);
        self.zcl_seq
    }
}
