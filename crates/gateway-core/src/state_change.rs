//! StateChange convergence
//!
//! A StateChange robustly sets and verifies a target state over
//! ResourceItems. A group cast turning on 20 lights might miss one; the
//! StateChange notices the light that did not turn on and re-issues the
//! command until every target item is observably in sync or the change
//! timeout expires.

use serde_json::Value;

use zigbee_aps::zcl::{ZCL_FC_CLUSTER_COMMAND, ZCL_FC_DISABLE_DEFAULT_RESPONSE};
use zigbee_aps::{clusters, ApsDataRequest, ZclFrame};

use crate::access::{read_item, write_item_with, AccessState, DeviceAddress, ReadResult};
use crate::aps_wrapper::ApsSend;
use crate::clock::SteadyTime;
use crate::js::DeviceJs;
use crate::resource::{Resource, ResourceItem, ValueSource};

/// On/off cluster command ids accepted by the `Set-OnOff` change function.
pub mod onoff_command {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x01;
    pub const OFF_WITH_EFFECT: u8 = 0x40;
}

const DEFAULT_STATE_TIMEOUT_MS: i64 = 5 * 1000;
const DEFAULT_CHANGE_TIMEOUT_MS: i64 = 180 * 1000;

/// At most this many unconfirmed APS requests may be in flight before
/// `tick` becomes a no-op.
const MAX_UNCONFIRMED_APS_REQUESTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScState {
    /// Calls the change function.
    CallFunction,
    /// Waits until the state is verified or a state timeout occurs.
    WaitSync,
    /// WaitSync timed out without receiving a value from the device.
    Read,
    /// The target state has been verified.
    Finished,
    /// The change failed after the change timeout.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Unknown,
    Synced,
    NotSynced,
}

/// Built-in change functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFunction {
    /// Writes each target item via its DDF write parameters.
    WriteZclAttribute,
    /// Sends an on/off cluster command selected by the `cmd` parameter.
    SetOnOff,
}

/// Target value for one item of the change.
#[derive(Debug, Clone)]
pub struct ScItem {
    pub suffix: &'static str,
    pub target_value: Value,
    pub verified: SyncResult,
}

/// Extra command parameter not available as a ResourceItem.
#[derive(Debug, Clone)]
pub struct ScParam {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    state: ScState,
    change_function: ChangeFunction,
    read_result: ReadResult,
    dst_endpoint: u8,
    state_timeout_ms: i64,
    change_timeout_ms: i64,
    state_timer: SteadyTime,
    change_timer: SteadyTime,
    items: Vec<ScItem>,
    parameters: Vec<ScParam>,
}

impl PartialEq for StateChange {
    /// Two changes are equal when they use the same function over the same
    /// item set; a newer equal change replaces the older one.
    fn eq(&self, other: &Self) -> bool {
        self.change_function == other.change_function
            && self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.suffix == b.suffix)
    }
}

impl StateChange {
    /// \p initial_state must be `CallFunction` (send in the next tick) or
    /// `WaitSync` (a command was already sent, only verify).
    #[must_use]
    pub fn new(
        initial_state: ScState,
        change_function: ChangeFunction,
        dst_endpoint: u8,
        now: SteadyTime,
    ) -> Self {
        debug_assert!(initial_state == ScState::CallFunction || initial_state == ScState::WaitSync);

        Self {
            state: initial_state,
            change_function,
            read_result: ReadResult::default(),
            dst_endpoint,
            state_timeout_ms: DEFAULT_STATE_TIMEOUT_MS,
            change_timeout_ms: DEFAULT_CHANGE_TIMEOUT_MS,
            state_timer: now,
            change_timer: now,
            items: Vec::new(),
            parameters: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ScState {
        self.state
    }

    #[must_use]
    pub fn dst_endpoint(&self) -> u8 {
        self.dst_endpoint
    }

    #[must_use]
    pub fn items(&self) -> &[ScItem] {
        &self.items
    }

    #[must_use]
    pub fn parameters(&self) -> &[ScParam] {
        &self.parameters
    }

    pub fn set_state_timeout_ms(&mut self, timeout: i64) {
        self.state_timeout_ms = timeout;
    }

    pub fn set_change_timeout_ms(&mut self, timeout: i64) {
        self.change_timeout_ms = timeout;
    }

    /// Adds a target value; invalid (null) values are rejected.
    pub fn add_target_value(&mut self, suffix: &'static str, value: Value) {
        if value.is_null() {
            tracing::error!("SC add invalid target value for: {suffix}");
            return;
        }
        self.items.push(ScItem { suffix, target_value: value, verified: SyncResult::Unknown });
    }

    /// Adds a parameter, replacing an existing one of the same name.
    pub fn add_parameter(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(param) = self.parameters.iter_mut().find(|p| p.name == name) {
            param.value = value;
        } else {
            self.parameters.push(ScParam { name, value });
        }
    }

    /// Called with items whose value came from the device (read or report).
    /// When all targets are synced the change reaches `Finished`.
    pub fn verify_item_change(&mut self, item: &ResourceItem) {
        if item.value_source() != ValueSource::Device {
            return;
        }

        let mut synced_items = 0;

        for i in &mut self.items {
            if i.suffix == item.suffix() {
                if i.target_value == item.to_variant() {
                    i.verified = SyncResult::Synced;
                    tracing::debug!("SC {}: synced", i.suffix);
                } else {
                    i.verified = SyncResult::NotSynced;
                    tracing::debug!("SC {}: not synced", i.suffix);
                }
            }

            if i.verified == SyncResult::Synced {
                synced_items += 1;
            }
        }

        if synced_items == self.items.len() && self.state != ScState::Finished {
            self.state = ScState::Finished;
            tracing::debug!("SC --> Finished");
        }
    }

    /// Drives the inner state machine. Called from the device supervisor on
    /// relevant events.
    ///
    /// Returns 1 when an APS request was enqueued, 0 otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        addr: DeviceAddress,
        r: &Resource,
        ctrl: &mut dyn ApsSend,
        js: &mut DeviceJs,
        access: &mut AccessState,
        now: SteadyTime,
    ) -> i32 {
        let mut result = 0;

        if self.state == ScState::Finished || self.state == ScState::Failed {
            return result;
        }

        if self.state == ScState::WaitSync
            && now.elapsed_since(self.state_timer) > self.state_timeout_ms
        {
            self.state = ScState::CallFunction;

            // an unknown item never produced a read or report, query it
            if self.items.iter().any(|i| i.verified == SyncResult::Unknown) {
                self.state = ScState::Read;
            }
        }

        if self.change_timeout_ms > 0
            && now.elapsed_since(self.change_timer) > self.change_timeout_ms
        {
            self.state = ScState::Failed;
            return result;
        }

        if ctrl.unconfirmed_requests() > MAX_UNCONFIRMED_APS_REQUESTS {
            return result; // wait
        }

        match self.state {
            ScState::CallFunction => {
                tracing::debug!("SC tick --> CallFunction");
                if self.call_change_function(addr, r, ctrl, js) == 0 {
                    for i in &mut self.items {
                        if i.verified == SyncResult::NotSynced {
                            i.verified = SyncResult::Unknown; // read again
                        }
                    }
                    self.state_timer = now;
                    self.state = ScState::WaitSync;
                    result = 1;
                }
            }
            ScState::Read if ctrl.unconfirmed_for_ext(addr.ext) == 0 => {
                let suffix = self
                    .items
                    .iter()
                    .find(|i| i.verified == SyncResult::Unknown)
                    .map(|i| i.suffix);

                self.state = ScState::Failed;
                self.read_result = ReadResult::default();

                if let Some(suffix) = suffix {
                    if let Some(item) = r.item(suffix) {
                        let read_params = item.read_parameters().clone();

                        self.read_result = read_item(r, addr, ctrl, &read_params, access, now);

                        if self.read_result.is_enqueued {
                            tracing::debug!("SC tick --> Read {}, {}", suffix, r.unique_id());
                            result = 1;
                        }

                        self.state_timer = now;
                        self.state = ScState::WaitSync;
                    }
                }
            }
            _ => {}
        }

        result
    }

    /// Invokes the configured change function.
    /// Returns 0 when the command was sent, a negative number on failure.
    fn call_change_function(
        &self,
        addr: DeviceAddress,
        r: &Resource,
        ctrl: &mut dyn ApsSend,
        js: &mut DeviceJs,
    ) -> i32 {
        match self.change_function {
            ChangeFunction::WriteZclAttribute => self.write_zcl_attribute(addr, r, ctrl, js),
            ChangeFunction::SetOnOff => self.set_onoff(addr, ctrl),
        }
    }

    /// Writes the target value(s) through each item's DDF write parameters.
    fn write_zcl_attribute(
        &self,
        addr: DeviceAddress,
        r: &Resource,
        ctrl: &mut dyn ApsSend,
        js: &mut DeviceJs,
    ) -> i32 {
        let mut written = 0;

        for i in &self.items {
            let Some(item) = r.item(i.suffix) else {
                return -1;
            };

            let write_params = item.write_parameters().clone();
            if write_params.is_null() {
                return -2;
            }

            // write a copy carrying the target value, the item is untouched
            let mut copy = item.clone();
            if copy.set_variant(&i.target_value, ValueSource::Api).is_err() {
                return -3;
            }

            if !write_item_with(r, &copy, addr, ctrl, &write_params, js) {
                return -4;
            }

            written += 1;
        }

        if written > 0 {
            0
        } else {
            -5
        }
    }

    /// Sends an on/off cluster command; the command id comes from the
    /// `cmd` parameter.
    fn set_onoff(&self, addr: DeviceAddress, ctrl: &mut dyn ApsSend) -> i32 {
        let cmd = self
            .parameters
            .iter()
            .find(|p| p.name == "cmd")
            .and_then(|p| p.value.as_u64())
            .filter(|&v| {
                v == u64::from(onoff_command::ON)
                    || v == u64::from(onoff_command::OFF)
                    || v == u64::from(onoff_command::OFF_WITH_EFFECT)
            });

        let Some(cmd) = cmd else {
            return -1;
        };
        let cmd = cmd as u8;

        let payload = if cmd == onoff_command::OFF_WITH_EFFECT {
            vec![0x00, 0x00] // effect id, effect variant
        } else {
            Vec::new()
        };

        let frame = ZclFrame {
            frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
            manufacturer_code: 0,
            sequence_number: ctrl.next_zcl_sequence(),
            command_id: cmd,
            payload,
        };

        let req = ApsDataRequest::unicast(
            addr.aps(),
            self.dst_endpoint,
            clusters::ON_OFF,
            frame.serialize(),
        );

        tracing::debug!("SC set_onoff({cmd:#04x})");

        if ctrl.send(&req).is_ok() {
            0
        } else {
            -2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aps_wrapper::ApsCtrlWrapper;
    use crate::resource::{ItemValue, RATTR_UNIQUEID, RSTATE_ON, R_LIGHTS};
    use serde_json::json;
    use zigbee_aps::controller::testing::MockController;
    use zigbee_aps::zcl::zcl_command;

    fn light() -> Resource {
        let mut r = Resource::new(R_LIGHTS);
        r.add_item(RATTR_UNIQUEID).unwrap();
        r.set_value(
            RATTR_UNIQUEID,
            ItemValue::Str("28:6d:97:00:01:06:41:79-01".into()),
            ValueSource::Api,
        )
        .unwrap();
        let item = r.add_item(RSTATE_ON).unwrap();
        item.set_read_parameters(json!({"fn": "zcl", "cl": "0x0006", "at": "0x0000"}));
        item.set_write_parameters(
            json!({"fn": "zcl", "cl": "0x0006", "at": "0x0000", "dt": "0x10", "eval": "Item.val"}),
        );
        r
    }

    fn addr() -> DeviceAddress {
        DeviceAddress { nwk: 0x1234, ext: 0x286d_9700_0106_4179 }
    }

    #[test]
    fn onoff_command_is_sent_and_verified() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut access = AccessState::default();
        let mut r = light();

        let mut sc = StateChange::new(ScState::CallFunction, ChangeFunction::SetOnOff, 0x01, SteadyTime(0));
        sc.add_target_value(RSTATE_ON, json!(true));
        sc.add_parameter("cmd", json!(onoff_command::ON));

        let sent = sc.tick(addr(), &r, &mut wrapper, &mut js, &mut access, SteadyTime(10));
        assert_eq!(sent, 1);
        assert_eq!(sc.state(), ScState::WaitSync);

        let frame = ZclFrame::parse(&wrapper.inner().sent[0].asdu).unwrap();
        assert!(frame.is_cluster_command());
        assert_eq!(frame.command_id, onoff_command::ON);
        assert_eq!(wrapper.inner().sent[0].cluster_id, clusters::ON_OFF);
        assert_eq!(wrapper.inner().sent[0].dst_endpoint, 0x01);

        // the device reports state/on = true
        r.set_value(RSTATE_ON, ItemValue::Bool(true), ValueSource::Device).unwrap();
        sc.verify_item_change(r.item(RSTATE_ON).unwrap());
        assert_eq!(sc.state(), ScState::Finished);
    }

    #[test]
    fn write_zcl_uses_target_value_not_current() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut access = AccessState::default();
        let mut r = light();
        r.set_value(RSTATE_ON, ItemValue::Bool(false), ValueSource::Device).unwrap();

        let mut sc = StateChange::new(
            ScState::CallFunction,
            ChangeFunction::WriteZclAttribute,
            0x01,
            SteadyTime(0),
        );
        sc.add_target_value(RSTATE_ON, json!(true));

        assert_eq!(sc.tick(addr(), &r, &mut wrapper, &mut js, &mut access, SteadyTime(1)), 1);

        let frame = ZclFrame::parse(&wrapper.inner().sent[0].asdu).unwrap();
        // attr id 0x0000 | dt 0x10 (bool) | value 1 (the target, not current)
        assert_eq!(frame.payload, vec![0x00, 0x00, 0x10, 0x01]);
    }

    #[test]
    fn wait_sync_timeout_reads_unknown_items() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut access = AccessState::default();
        let r = light();

        let mut sc = StateChange::new(ScState::WaitSync, ChangeFunction::SetOnOff, 0x01, SteadyTime(0));
        sc.add_target_value(RSTATE_ON, json!(true));
        sc.add_parameter("cmd", json!(onoff_command::ON));

        // state timeout (5 s) elapses with the item still unknown -> Read
        let sent = sc.tick(addr(), &r, &mut wrapper, &mut js, &mut access, SteadyTime(5_100));
        assert_eq!(sent, 1);
        assert_eq!(sc.state(), ScState::WaitSync); // re-armed after the read

        let frame = ZclFrame::parse(&wrapper.inner().sent[0].asdu).unwrap();
        assert_eq!(frame.command_id, zcl_command::READ_ATTRIBUTES);
    }

    #[test]
    fn not_synced_items_trigger_a_retry() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut access = AccessState::default();
        let mut r = light();

        let mut sc = StateChange::new(ScState::WaitSync, ChangeFunction::SetOnOff, 0x01, SteadyTime(0));
        sc.add_target_value(RSTATE_ON, json!(true));
        sc.add_parameter("cmd", json!(onoff_command::ON));

        // the device reports the wrong value
        r.set_value(RSTATE_ON, ItemValue::Bool(false), ValueSource::Device).unwrap();
        sc.verify_item_change(r.item(RSTATE_ON).unwrap());
        assert_eq!(sc.state(), ScState::WaitSync);

        // state timeout with a NotSynced item -> CallFunction again
        let sent = sc.tick(addr(), &r, &mut wrapper, &mut js, &mut access, SteadyTime(5_100));
        assert_eq!(sent, 1);
        let frame = ZclFrame::parse(&wrapper.inner().sent[0].asdu).unwrap();
        assert_eq!(frame.command_id, onoff_command::ON);
    }

    #[test]
    fn change_timeout_fails_the_change() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut access = AccessState::default();
        let r = light();

        let mut sc = StateChange::new(ScState::WaitSync, ChangeFunction::SetOnOff, 0x01, SteadyTime(0));
        sc.add_target_value(RSTATE_ON, json!(true));
        sc.add_parameter("cmd", json!(onoff_command::ON));

        sc.tick(addr(), &r, &mut wrapper, &mut js, &mut access, SteadyTime(180_001));
        assert_eq!(sc.state(), ScState::Failed);
    }

    #[test]
    fn api_sourced_values_do_not_verify() {
        let mut r = light();
        let mut sc = StateChange::new(ScState::WaitSync, ChangeFunction::SetOnOff, 0x01, SteadyTime(0));
        sc.add_target_value(RSTATE_ON, json!(true));

        r.set_value(RSTATE_ON, ItemValue::Bool(true), ValueSource::Api).unwrap();
        sc.verify_item_change(r.item(RSTATE_ON).unwrap());
        assert_eq!(sc.state(), ScState::WaitSync);
    }

    #[test]
    fn equal_changes_replace_each_other() {
        let mut r = light();
        let mk = |now| {
            let mut sc =
                StateChange::new(ScState::CallFunction, ChangeFunction::SetOnOff, 1, SteadyTime(now));
            sc.add_target_value(RSTATE_ON, json!(true));
            sc
        };
        r.add_state_change(mk(0));
        r.add_state_change(mk(5));
        assert_eq!(r.state_changes().len(), 1);
    }
}
