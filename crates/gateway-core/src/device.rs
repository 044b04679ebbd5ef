//! Per-device supervisor state machine
//!
//! A `Device` is a generic supervisor for routers and end-devices. It must
//! not know anything product specific; those details come from device
//! description files. Starting from nothing but the MAC address the event
//! driven state machine queries ZDP descriptors and basic cluster
//! attributes until a DDF can be matched, then settles in `Idle` where two
//! parallel sub-state machines verify bindings and poll items. Missing
//! pieces are re-queried automatically, so the machine is self healing.

use zigbee_aps::zdp::zdp_status;
use zigbee_aps::{basic_attr, clusters, zdp, Node};

use crate::access::{read_item, AccessState, DeviceAddress, ReadResult};
use crate::aps_wrapper::ApsSend;
use crate::clock::SteadyTime;
use crate::ddf::DdfStore;
use crate::event::{
    aps_confirm_id, aps_confirm_status, Event, REVENT_APS_CONFIRM, REVENT_AWAKE,
    REVENT_ACTIVE_ENDPOINTS, REVENT_BINDING_TABLE, REVENT_DDF_INIT_REQUEST,
    REVENT_DDF_INIT_RESPONSE, REVENT_DDF_RELOAD, REVENT_NODE_DESCRIPTOR, REVENT_POLL,
    REVENT_POLL_DONE, REVENT_SIMPLE_DESCRIPTOR, REVENT_STATE_ENTER, REVENT_STATE_LEAVE,
    REVENT_STATE_TIMEOUT, REVENT_TICK,
};
use crate::event_bus::EventBus;
use crate::js::DeviceJs;
use crate::resource::{
    DeviceKey, ItemValue, Resource, ResourceContainer, ValueSource, RATTR_EXT_ADDRESS,
    RATTR_MANUFACTURER_NAME, RATTR_MODELID, RATTR_NWK_ADDRESS, RATTR_UNIQUEID, RCONFIG_REACHABLE,
    RSTATE_LAST_UPDATED, RSTATE_REACHABLE, R_DEVICES,
};
use crate::uniqueid::generate_unique_id;

/// One MAC poll cycle for rx-off-when-idle end devices plus headroom.
pub const MIN_MAC_POLL_RX_ON_MS: i64 = 8000;

const BINDING_VERIFY_INTERVAL_MS: i64 = 1000 * 60 * 5;
const POLL_BUSY_TIMEOUT_MS: i64 = 10_000;

/// Indexes into the state array. Level 0 is the top level state, levels
/// above it run in parallel inside a compound level 0 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StateLevel {
    Level0 = 0,
    Level1 = 1,
    Level2 = 2,
}

pub const STATE_LEVEL_MAX: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// No handler bound (parallel slots outside Idle).
    #[default]
    None,
    Init,
    NodeDescriptor,
    ActiveEndpoints,
    SimpleDescriptors,
    BasicCluster,
    GetDdf,
    Idle,
    Dead,
    // level 1
    Binding,
    BindingTableVerify,
    // level 2
    PollIdle,
    PollBusy,
}

/// Keeps track of a running ZDP request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZdpResult {
    pub is_enqueued: bool,
    pub aps_req_id: u8,
    pub sequence: u8,
}

/// Everything a state handler needs besides the device itself.
pub struct DeviceContext<'a> {
    pub ctrl: &'a mut dyn ApsSend,
    pub resources: &'a mut ResourceContainer,
    pub ddf: &'a DdfStore,
    pub js: &'a mut DeviceJs,
    pub access: &'a mut AccessState,
    pub bus: &'a mut EventBus,
    pub now: SteadyTime,
}

pub struct Device {
    res: Resource,
    key: DeviceKey,
    node: Option<Node>,
    states: [DeviceState; STATE_LEVEL_MAX],
    state_timer: Option<SteadyTime>,
    awake: Option<SteadyTime>,
    binding_verify: Option<SteadyTime>,
    poll_timeout: Option<SteadyTime>,
    poll_item_iter: usize,
    binding_iter: usize,
    mgmt_bind_supported: bool,
    managed: bool,
    zdp_result: ZdpResult,
    read_result: ReadResult,
    /// Sub-devices as (unique id, resource kind); resolved on demand since
    /// resource storage may reallocate.
    sub_devices: Vec<(String, &'static str)>,
}

impl Device {
    /// Creates a supervisor for \p key. The initial state timer is
    /// staggered by \p index so a large network does not start all
    /// discovery rounds in the same tick.
    #[must_use]
    pub fn new(key: DeviceKey, index: usize, now: SteadyTime) -> Self {
        let mut res = Resource::new(R_DEVICES);
        res.add_item(RSTATE_REACHABLE);
        res.add_item(RATTR_EXT_ADDRESS);
        res.add_item(RATTR_NWK_ADDRESS);
        if let Some(item) = res.add_item(RATTR_UNIQUEID) {
            let _ = item.set_value(
                ItemValue::Str(generate_unique_id(key, 0, 0)),
                ValueSource::Api,
            );
        }
        res.add_item(RATTR_MANUFACTURER_NAME);
        res.add_item(RATTR_MODELID);

        Self {
            res,
            key,
            node: None,
            states: [DeviceState::Init, DeviceState::None, DeviceState::None],
            state_timer: Some(now + 1000 + (index as i64) * 300),
            awake: None,
            binding_verify: None,
            poll_timeout: None,
            poll_item_iter: 0,
            binding_iter: 0,
            mgmt_bind_supported: false,
            managed: true,
            zdp_result: ZdpResult::default(),
            read_result: ReadResult::default(),
            sub_devices: Vec::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> DeviceKey {
        self.key
    }

    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.res
    }

    pub fn resource_mut(&mut self) -> &mut Resource {
        &mut self.res
    }

    #[must_use]
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    #[must_use]
    pub fn managed(&self) -> bool {
        self.managed
    }

    pub fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    #[must_use]
    pub fn current_state(&self, level: StateLevel) -> DeviceState {
        self.states[level as usize]
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: DeviceState, level: StateLevel) {
        self.states[level as usize] = state;
    }

    #[must_use]
    pub fn mgmt_bind_supported(&self) -> bool {
        self.mgmt_bind_supported
    }

    #[must_use]
    pub fn sub_device_keys(&self) -> &[(String, &'static str)] {
        &self.sub_devices
    }

    pub fn add_sub_device(&mut self, unique_id: impl Into<String>, prefix: &'static str) {
        let unique_id = unique_id.into();
        if self.sub_devices.iter().any(|(id, _)| *id == unique_id) {
            return; // already registered
        }
        self.sub_devices.push((unique_id, prefix));
    }

    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress {
            nwk: self.res.to_number(RATTR_NWK_ADDRESS) as u16,
            ext: self.res.to_number(RATTR_EXT_ADDRESS) as u64,
        }
    }

    /// Milliseconds since the device was last known awake.
    #[must_use]
    pub fn last_awake_ms(&self, now: SteadyTime) -> i64 {
        self.awake.map_or(8_640_000, |t| now.elapsed_since(t))
    }

    /// A device is reachable while a MAC poll was seen within the poll
    /// window, or when its receiver stays on while idle and the reachable
    /// item says so.
    #[must_use]
    pub fn reachable(&self, now: SteadyTime) -> bool {
        if self.last_awake_ms(now) < MIN_MAC_POLL_RX_ON_MS {
            return true;
        }

        if let Some(nd) = self.node.as_ref().and_then(|n| n.node_descriptor) {
            if nd.receiver_on_when_idle() {
                return self.res.to_bool(RSTATE_REACHABLE);
            }
        }

        false
    }

    /// Fires the single-shot state timer when expired, synthesizing the
    /// `state.timeout` event for the level 0 handler.
    pub fn check_state_timer(&mut self, now: SteadyTime) -> Option<Event> {
        let deadline = self.state_timer?;
        if now >= deadline {
            self.state_timer = None;
            return Some(Event::new(R_DEVICES, REVENT_STATE_TIMEOUT, 0, self.key));
        }
        None
    }

    fn start_state_timer(&mut self, interval_ms: i64, now: SteadyTime) {
        self.state_timer = Some(now + interval_ms);
    }

    fn stop_state_timer(&mut self) {
        self.state_timer = None;
    }

    /// Main event entry. Level 1/2 handlers are invoked synchronously from
    /// the level 0 handler after it processed the event.
    pub fn handle_event(&mut self, event: &Event, ctx: &mut DeviceContext, level: StateLevel) {
        if event.what() == REVENT_AWAKE && level == StateLevel::Level0 {
            self.awake = Some(ctx.now);
        }

        match self.states[level as usize] {
            DeviceState::None => {}
            DeviceState::Init => self.init_handler(event, ctx),
            DeviceState::NodeDescriptor => self.node_descriptor_handler(event, ctx),
            DeviceState::ActiveEndpoints => self.active_endpoints_handler(event, ctx),
            DeviceState::SimpleDescriptors => self.simple_descriptors_handler(event, ctx),
            DeviceState::BasicCluster => self.basic_cluster_handler(event, ctx),
            DeviceState::GetDdf => self.get_ddf_handler(event, ctx),
            DeviceState::Idle => self.idle_handler(event, ctx),
            DeviceState::Dead => self.dead_handler(event, ctx),
            DeviceState::Binding => self.binding_handler(event, ctx),
            DeviceState::BindingTableVerify => self.binding_table_verify_handler(event, ctx),
            DeviceState::PollIdle => self.poll_idle_handler(event, ctx),
            DeviceState::PollBusy => self.poll_busy_handler(event, ctx),
        }
    }

    /// Switches the state at \p level, running leave/enter semantics. The
    /// level 0 enter event goes through the bus so the handler runs in the
    /// next drain; sub-state enters are invoked directly.
    fn set_state(&mut self, new_state: DeviceState, level: StateLevel, ctx: &mut DeviceContext) {
        let idx = level as usize;
        if self.states[idx] == new_state {
            return;
        }

        if self.states[idx] != DeviceState::None {
            let leave = Event::new(R_DEVICES, REVENT_STATE_LEAVE, idx as i64, self.key);
            self.handle_event(&leave, ctx, level);
        }

        self.states[idx] = new_state;

        if new_state != DeviceState::None {
            if level == StateLevel::Level0 {
                ctx.bus
                    .enqueue(Event::new(R_DEVICES, REVENT_STATE_ENTER, idx as i64, self.key));
            } else {
                let enter = Event::new(R_DEVICES, REVENT_STATE_ENTER, idx as i64, self.key);
                self.handle_event(&enter, ctx, level);
            }
        }
    }

    fn enqueue_event(&self, what: &'static str, ctx: &mut DeviceContext) {
        ctx.bus.enqueue(Event::new(R_DEVICES, what, 0, self.key));
    }

    /// #1 Waits until the coprocessor knows the node, then jumps into the
    /// verification chain.
    fn init_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        if event.what() == REVENT_STATE_ENTER {
            self.zdp_result = ZdpResult::default();
        }

        if event.what() == REVENT_POLL
            || event.what() == REVENT_AWAKE
            || event.what() == RCONFIG_REACHABLE
            || event.what() == REVENT_STATE_TIMEOUT
            || event.what() == RSTATE_LAST_UPDATED
        {
            // lazy reference to the coprocessor node view
            if self.node.is_none() {
                self.node = ctx.ctrl.node_for_ext(self.key);
            }

            let Some(node) = self.node.clone() else {
                tracing::debug!("DEV Init no node found: {:#018x}", self.key);

                if self.key & 0xffff_ffff_0000_0000 == 0 {
                    // ignore green power devices for now
                    self.set_state(DeviceState::Dead, StateLevel::Level0, ctx);
                }
                return;
            };

            let _ = self.res.set_value(
                RATTR_EXT_ADDRESS,
                ItemValue::Num(node.address.ext as i64),
                ValueSource::Api,
            );
            let _ = self.res.set_value(
                RATTR_NWK_ADDRESS,
                ItemValue::Num(i64::from(node.address.nwk)),
                ValueSource::Api,
            );

            if node.address.nwk == 0x0000 {
                // ignore the coordinator for now
                self.set_state(DeviceState::Dead, StateLevel::Level0, ctx);
                return;
            }

            if node.node_descriptor.is_some() || self.reachable(ctx.now) {
                self.set_state(DeviceState::NodeDescriptor, StateLevel::Level0, ctx);
            }
        }
    }

    /// #2 Checks that a valid node descriptor is available.
    fn node_descriptor_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                let has_nd = self.node.as_ref().is_some_and(|n| n.node_descriptor.is_some());

                if has_nd {
                    tracing::debug!("ZDP node descriptor verified: {:#018x}", self.key);
                    self.set_state(DeviceState::ActiveEndpoints, StateLevel::Level0, ctx);
                } else if !self.reachable(ctx.now) {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                } else {
                    let req = zdp::node_descriptor_request(self.address().aps(), 0);
                    self.send_zdp_query(req, ctx);
                }
            }
            REVENT_APS_CONFIRM => {
                debug_assert_eq!(event.device_key(), self.key);
                if self.zdp_result.aps_req_id == aps_confirm_id(event)
                    && aps_confirm_status(event) != 0x00
                {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                }
            }
            REVENT_NODE_DESCRIPTOR => {
                self.node = ctx.ctrl.node_for_ext(self.key);
                self.stop_state_timer();
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                self.enqueue_event(REVENT_AWAKE, ctx);
            }
            REVENT_STATE_TIMEOUT => {
                tracing::debug!("read ZDP node descriptor timeout: {:#018x}", self.key);
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
            _ => {}
        }
    }

    /// #3 Checks that active endpoints are known.
    fn active_endpoints_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                let has_endpoints = self.node.as_ref().is_some_and(|n| !n.endpoints.is_empty());

                if has_endpoints {
                    tracing::debug!("ZDP active endpoints verified: {:#018x}", self.key);
                    self.set_state(DeviceState::SimpleDescriptors, StateLevel::Level0, ctx);
                } else if !self.reachable(ctx.now) {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                } else {
                    let req = zdp::active_endpoints_request(self.address().aps(), 0);
                    self.send_zdp_query(req, ctx);
                }
            }
            REVENT_APS_CONFIRM => {
                if self.zdp_result.aps_req_id == aps_confirm_id(event)
                    && aps_confirm_status(event) != 0x00
                {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                }
            }
            REVENT_ACTIVE_ENDPOINTS => {
                self.node = ctx.ctrl.node_for_ext(self.key);
                self.stop_state_timer();
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                self.enqueue_event(REVENT_AWAKE, ctx);
            }
            REVENT_STATE_TIMEOUT => {
                tracing::debug!("read ZDP active endpoints timeout: {:#018x}", self.key);
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
            _ => {}
        }
    }

    /// #4 Checks that all active endpoints have a simple descriptor.
    fn simple_descriptors_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                let need_fetch_ep = self.node.as_ref().and_then(|n| {
                    n.endpoints
                        .iter()
                        .copied()
                        .find(|ep| {
                            n.simple_descriptor(*ep)
                                .map_or(true, |sd| sd.device_id == 0xffff)
                        })
                });

                match need_fetch_ep {
                    None => {
                        tracing::debug!("ZDP simple descriptors verified: {:#018x}", self.key);
                        self.set_state(DeviceState::BasicCluster, StateLevel::Level0, ctx);
                    }
                    Some(ep) => {
                        if !self.reachable(ctx.now) {
                            self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                        } else {
                            let req = zdp::simple_descriptor_request(self.address().aps(), ep, 0);
                            self.send_zdp_query(req, ctx);
                        }
                    }
                }
            }
            REVENT_APS_CONFIRM => {
                if self.zdp_result.aps_req_id == aps_confirm_id(event)
                    && aps_confirm_status(event) != 0x00
                {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                }
            }
            REVENT_SIMPLE_DESCRIPTOR => {
                self.node = ctx.ctrl.node_for_ext(self.key);
                self.stop_state_timer();
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                self.enqueue_event(REVENT_AWAKE, ctx);
            }
            REVENT_STATE_TIMEOUT => {
                tracing::debug!("read ZDP simple descriptor timeout: {:#018x}", self.key);
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
            _ => {}
        }
    }

    /// #5 Reads the basic cluster attributes needed to match a DDF.
    fn basic_cluster_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        const ITEMS: [(&str, u16); 2] = [
            (RATTR_MANUFACTURER_NAME, basic_attr::MANUFACTURER_NAME),
            (RATTR_MODELID, basic_attr::MODEL_IDENTIFIER),
        ];

        match event.what() {
            REVENT_STATE_ENTER => {
                let mut ok_count = 0;

                for (suffix, attr_id) in ITEMS {
                    if self.fill_item_from_sub_devices(suffix, ctx) {
                        ok_count += 1;
                        continue;
                    }

                    if self.zcl_read(suffix, clusters::BASIC, attr_id, ctx) {
                        self.start_state_timer(MIN_MAC_POLL_RX_ON_MS, ctx.now);
                        return; // wait for the response or the timeout
                    }

                    tracing::debug!("failed to read {suffix}: {:#018x}", self.key);
                    break;
                }

                if ok_count != ITEMS.len() {
                    self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                } else {
                    tracing::debug!(
                        "DEV modelid: {}, {:#018x}",
                        self.res.to_str(RATTR_MODELID),
                        self.key
                    );
                    self.set_state(DeviceState::GetDdf, StateLevel::Level0, ctx);
                }
            }
            RATTR_MANUFACTURER_NAME | RATTR_MODELID => {
                tracing::debug!("DEV received {}: {:#018x}", event.what(), self.key);
                self.stop_state_timer();
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx); // re-evaluate
                self.enqueue_event(REVENT_AWAKE, ctx);
            }
            REVENT_STATE_TIMEOUT => {
                tracing::debug!("DEV read basic cluster timeout: {:#018x}", self.key);
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
            _ => {}
        }
    }

    /// #6 Asks the DDF layer whether a description for this device exists.
    fn get_ddf_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                self.enqueue_event(REVENT_DDF_INIT_REQUEST, ctx);
            }
            REVENT_DDF_INIT_RESPONSE => {
                if event.num() == 1 {
                    self.set_state(DeviceState::Idle, StateLevel::Level0, ctx);
                } else {
                    self.set_state(DeviceState::Dead, StateLevel::Level0, ctx);
                }
            }
            _ => {}
        }
    }

    /// #7 Operational state; runs Bindings and Poll in parallel and drives
    /// attached StateChanges.
    fn idle_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            RSTATE_LAST_UPDATED | REVENT_POLL => {
                // too noisy to log
            }
            REVENT_STATE_ENTER => {
                self.set_state(DeviceState::Binding, StateLevel::Level1, ctx);
                self.set_state(DeviceState::PollIdle, StateLevel::Level2, ctx);
            }
            REVENT_STATE_LEAVE => {
                self.set_state(DeviceState::None, StateLevel::Level1, ctx);
                self.set_state(DeviceState::None, StateLevel::Level2, ctx);
                return;
            }
            REVENT_DDF_RELOAD => {
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
                return;
            }
            what => {
                tracing::trace!("DEV Idle event {}/{:#018x}/{}", event.resource(), self.key, what);
            }
        }

        self.check_item_changes(event, ctx);

        // process parallel states
        if event.what() != REVENT_STATE_ENTER && event.what() != REVENT_STATE_LEAVE {
            self.handle_event(event, ctx, StateLevel::Level1);
            self.handle_event(event, ctx, StateLevel::Level2);
        }
    }

    /// Walks the StateChanges of the affected sub-devices: verify the item
    /// the event refers to, then drive convergence.
    fn check_item_changes(&mut self, event: &Event, ctx: &mut DeviceContext) {
        let subs: Vec<(String, &'static str)> =
            if event.what() == REVENT_AWAKE || event.what() == REVENT_POLL {
                self.sub_devices.clone()
            } else {
                self.sub_devices
                    .iter()
                    .filter(|(_, prefix)| *prefix == event.resource())
                    .cloned()
                    .collect()
            };

        let addr = self.address();

        for (unique_id, prefix) in subs {
            let Some(sub) = ctx.resources.get_mut(prefix, &unique_id) else {
                continue;
            };

            if sub.state_changes().is_empty() {
                continue;
            }

            // detach the changes so the resource can be borrowed for reads
            let mut changes = std::mem::take(sub.state_changes_mut());

            for change in &mut changes {
                if let Some(item) = sub.item(event.what()) {
                    change.verify_item_change(item);
                }
                change.tick(addr, sub, ctx.ctrl, ctx.js, ctx.access, ctx.now);
            }

            *sub.state_changes_mut() = changes;
            sub.cleanup_state_changes();
        }
    }

    /// Level 1: re-verify the binding table every five minutes.
    fn binding_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                tracing::debug!("DEV Binding enter {:#018x}", self.key);
                return;
            }
            REVENT_POLL | REVENT_AWAKE => {
                let due = self
                    .binding_verify
                    .map_or(true, |t| ctx.now.elapsed_since(t) > BINDING_VERIFY_INTERVAL_MS);

                if !due {
                    return;
                }
                tracing::debug!("DEV Binding verify bindings {:#018x}", self.key);
            }
            REVENT_BINDING_TABLE => {
                if event.num() == i64::from(zdp_status::SUCCESS) {
                    self.mgmt_bind_supported = true;
                } else if event.num() == i64::from(zdp_status::NOT_SUPPORTED) {
                    self.mgmt_bind_supported = false;
                }
            }
            _ => return,
        }

        self.binding_iter = 0;
        self.set_state(DeviceState::BindingTableVerify, StateLevel::Level1, ctx);
        self.enqueue_event(REVENT_TICK, ctx);
    }

    /// Level 1 child: enumerate binding table entries.
    ///
    /// Reconciliation with DDF declared bindings (AddBinding,
    /// ReadReportConfig, ConfigReporting) is reserved and not wired yet.
    fn binding_table_verify_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        if event.what() != REVENT_TICK {
            return;
        }

        let table_len = self.node.as_ref().map_or(0, |n| n.binding_table.len());

        if self.binding_iter >= table_len {
            self.binding_verify = Some(ctx.now);
            self.set_state(DeviceState::Binding, StateLevel::Level1, ctx);
            return;
        }

        if let Some(node) = &self.node {
            let bnd = &node.binding_table[self.binding_iter];
            let dt = if bnd.confirmed_ms > 0 {
                (crate::clock::system_now_ms() - bnd.confirmed_ms) / 1000
            } else {
                -1
            };
            tracing::debug!(
                "BND {:#018x} cl: {:#06x}, dst: {:#018x}, dstEp: {:#04x}, dt: {dt} seconds",
                bnd.src_address,
                bnd.cluster_id,
                bnd.dst_address.ext,
                bnd.dst_endpoint
            );
        }

        self.binding_iter += 1;
        self.enqueue_event(REVENT_TICK, ctx);
    }

    /// Level 2: pick the next item of the first sub-device and read it.
    fn poll_idle_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                tracing::debug!("DEV Poll Idle enter {:#018x}", self.key);
            }
            REVENT_POLL => {
                let addr = self.address();
                let Some((unique_id, prefix)) = self.sub_devices.first().cloned() else {
                    self.enqueue_event(REVENT_POLL_DONE, ctx);
                    return;
                };
                let Some(sub) = ctx.resources.get(prefix, &unique_id) else {
                    self.enqueue_event(REVENT_POLL_DONE, ctx);
                    return;
                };

                if sub.item_count() == 0 {
                    self.enqueue_event(REVENT_POLL_DONE, ctx);
                    return;
                }

                self.poll_item_iter %= sub.item_count();
                let item = sub.item_for_index(self.poll_item_iter);
                self.poll_item_iter += 1;

                let read_params = match item {
                    Some(item) if !item.zcl_unsupported() => item.read_parameters().clone(),
                    _ => serde_json::Value::Null,
                };

                self.read_result =
                    read_item(sub, addr, ctx.ctrl, &read_params, ctx.access, ctx.now);

                if self.read_result.is_enqueued {
                    self.poll_timeout = Some(ctx.now);
                    self.set_state(DeviceState::PollBusy, StateLevel::Level2, ctx);
                } else {
                    self.enqueue_event(REVENT_POLL_DONE, ctx);
                }
            }
            _ => {}
        }
    }

    /// Level 2: wait for the APS confirm of the running read.
    fn poll_busy_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                tracing::debug!("DEV Poll Busy enter {:#018x}", self.key);
            }
            REVENT_APS_CONFIRM if aps_confirm_id(event) == self.read_result.aps_req_id => {
                tracing::debug!(
                    "DEV Poll Busy {:#018x} APS confirm status: {:#04x}",
                    self.key,
                    aps_confirm_status(event)
                );
                self.set_state(DeviceState::PollIdle, StateLevel::Level2, ctx);
                self.enqueue_event(REVENT_POLL_DONE, ctx);
            }
            REVENT_POLL => {
                let timed_out = self
                    .poll_timeout
                    .is_some_and(|t| ctx.now.elapsed_since(t) > POLL_BUSY_TIMEOUT_MS);
                if timed_out {
                    self.set_state(DeviceState::PollIdle, StateLevel::Level2, ctx);
                    self.enqueue_event(REVENT_POLL_DONE, ctx);
                }
            }
            _ => {}
        }
    }

    /// Terminal state; only a DDF reload reanimates the device.
    fn dead_handler(&mut self, event: &Event, ctx: &mut DeviceContext) {
        match event.what() {
            REVENT_STATE_ENTER => {
                tracing::debug!("DEV enter dead state {:#018x}", self.key);
            }
            REVENT_DDF_RELOAD => {
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
            _ => {}
        }
    }

    /// Sends a ZDP query and arms the state timer; errors loop via Init.
    fn send_zdp_query(&mut self, mut req: zigbee_aps::ApsDataRequest, ctx: &mut DeviceContext) {
        let tsn = ctx.ctrl.next_zcl_sequence();
        if let Some(first) = req.asdu.first_mut() {
            *first = tsn;
        }

        match ctx.ctrl.send(&req) {
            Ok(id) => {
                self.zdp_result = ZdpResult { is_enqueued: true, aps_req_id: id, sequence: tsn };
                self.start_state_timer(MIN_MAC_POLL_RX_ON_MS, ctx.now);
            }
            Err(_) => {
                self.set_state(DeviceState::Init, StateLevel::Level0, ctx);
            }
        }
    }

    /// Copies \p suffix from a sub-device into the device resource when the
    /// device item has never been set.
    fn fill_item_from_sub_devices(&mut self, suffix: &str, ctx: &mut DeviceContext) -> bool {
        if self.res.item(suffix).is_some_and(|i| i.last_set().is_some()) {
            return true;
        }

        for (unique_id, prefix) in &self.sub_devices {
            let Some(sub) = ctx.resources.get(prefix, unique_id) else {
                continue;
            };
            let Some(sitem) = sub.item(suffix) else {
                continue;
            };
            if sitem.last_set().is_none() {
                continue;
            }

            let value = sitem.value().clone();
            if let Some(ditem) = self.res.item_mut(suffix) {
                if ditem.set_value(value, ValueSource::Api).is_ok() {
                    return true;
                }
            }
        }

        false
    }

    /// Issues a ZCL read for a device-level item, installing generic read
    /// and parse parameters when the item has none yet.
    fn zcl_read(&mut self, suffix: &str, cluster_id: u16, attr_id: u16, ctx: &mut DeviceContext) -> bool {
        if !self.reachable(ctx.now) {
            tracing::debug!("DEV not reachable, skip read {suffix}: {:#018x}", self.key);
            return false;
        }

        let Some(endpoint) = self
            .node
            .as_ref()
            .and_then(|n| n.endpoint_for_server_cluster(cluster_id))
        else {
            tracing::debug!("cluster {cluster_id:#06x} not found: {:#018x}", self.key);
            return false;
        };

        let attr_hex = format!("{attr_id:#06x}");
        let cl_hex = format!("{cluster_id:#06x}");

        if let Some(item) = self.res.item_mut(suffix) {
            if item.read_parameters().is_null() {
                item.set_read_parameters(serde_json::json!({
                    "fn": "zcl", "ep": endpoint, "cl": cl_hex, "at": attr_hex, "mf": "0x0000",
                }));
            }
            if item.parse_parameters().is_null() {
                item.set_parse_parameters(serde_json::json!({
                    "fn": "zcl", "ep": endpoint, "cl": cl_hex, "at": attr_hex,
                    "eval": "Item.val = Attr.val",
                }));
            }
        }

        let addr = self.address();
        let read_params = self
            .res
            .item(suffix)
            .map(|i| i.read_parameters().clone())
            .unwrap_or_default();

        self.read_result = read_item(&self.res, addr, ctx.ctrl, &read_params, ctx.access, ctx.now);
        self.read_result.is_enqueued
    }
}

/// Container of all devices, keyed by device key.
pub type DeviceContainer = Vec<Device>;

/// Returns the device for \p key.
pub fn get_device(devices: &mut DeviceContainer, key: DeviceKey) -> Option<&mut Device> {
    devices.iter_mut().find(|d| d.key() == key)
}

/// Returns the device for \p key, creating it when missing.
pub fn get_or_create_device(
    devices: &mut DeviceContainer,
    key: DeviceKey,
    now: SteadyTime,
) -> &mut Device {
    debug_assert!(key != 0);

    if let Some(pos) = devices.iter().position(|d| d.key() == key) {
        return &mut devices[pos];
    }

    let index = devices.len();
    devices.push(Device::new(key, index, now));
    &mut devices[index]
}

/// Removes the device with \p key.
pub fn remove_device(devices: &mut DeviceContainer, key: DeviceKey) -> bool {
    let before = devices.len();
    devices.retain(|d| d.key() != key);
    devices.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aps_wrapper::ApsCtrlWrapper;
    use zigbee_aps::controller::testing::MockController;
    use zigbee_aps::zdp::{NodeDescriptor, SimpleDescriptor, ZdoCluster};
    use zigbee_aps::Address;

    const KEY: DeviceKey = 0x286d_9700_0106_4179;

    struct Harness {
        ctrl: ApsCtrlWrapper<MockController>,
        resources: ResourceContainer,
        ddf: crate::ddf::DdfStore,
        js: DeviceJs,
        access: AccessState,
        bus: EventBus,
        now: SteadyTime,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ctrl: ApsCtrlWrapper::new(MockController::default()),
                resources: ResourceContainer::default(),
                ddf: crate::ddf::DdfStore::new(),
                js: DeviceJs::new(),
                access: AccessState::default(),
                bus: EventBus::new(),
                now: SteadyTime(10_000),
            }
        }

        fn with_node(mut self) -> Self {
            self.ctrl.inner_mut().nodes.push(Node {
                address: Address::nwk_and_ext(0x1234, KEY),
                node_descriptor: None,
                endpoints: Vec::new(),
                simple_descriptors: Vec::new(),
                binding_table: Vec::new(),
            });
            self
        }

        fn node_mut(&mut self) -> &mut Node {
            &mut self.ctrl.inner_mut().nodes[0]
        }

        fn handle(&mut self, device: &mut Device, event: &Event) {
            let mut ctx = DeviceContext {
                ctrl: &mut self.ctrl,
                resources: &mut self.resources,
                ddf: &self.ddf,
                js: &mut self.js,
                access: &mut self.access,
                bus: &mut self.bus,
                now: self.now,
            };
            device.handle_event(event, &mut ctx, StateLevel::Level0);
        }

        /// Routes queued events back into the device until the bus drains.
        /// Returns the processed event names.
        fn drain(&mut self, device: &mut Device) -> Vec<&'static str> {
            let mut seen = Vec::new();
            for _ in 0..64 {
                let Some(event) = self.bus.pop() else { break };
                seen.push(event.what());
                self.handle(device, &event);
            }
            seen
        }

        fn awake(&mut self, device: &mut Device) {
            let event = Event::new(R_DEVICES, REVENT_AWAKE, 0, KEY);
            self.handle(device, &event);
            self.drain(device);
        }

        fn sent_zdp_clusters(&self) -> Vec<u16> {
            self.ctrl
                .inner()
                .sent
                .iter()
                .filter(|req| req.profile_id == zigbee_aps::profiles::ZDP)
                .map(|req| req.cluster_id)
                .collect()
        }
    }

    #[test]
    fn discovery_walks_zdp_chain() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        // awake in Init: node found, no descriptor yet, but reachable ->
        // NodeDescriptor issues ZDP 0x0002
        h.awake(&mut device);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::NodeDescriptor);
        assert_eq!(h.sent_zdp_clusters(), vec![ZdoCluster::NodeDescReq as u16]);

        // the driver learned the node descriptor
        h.node_mut().node_descriptor = Some(NodeDescriptor {
            device_type: 2,
            mac_capabilities: 0x80, // rx off when idle
            manufacturer_code: 0x115f,
            max_buffer_size: 82,
        });
        let event = Event::new(R_DEVICES, REVENT_NODE_DESCRIPTOR, 0, KEY);
        h.handle(&mut device, &event);
        h.drain(&mut device);

        // re-evaluated through Init into ActiveEndpoints, ZDP 0x0005 sent
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::ActiveEndpoints);
        assert_eq!(
            h.sent_zdp_clusters(),
            vec![ZdoCluster::NodeDescReq as u16, ZdoCluster::ActiveEpReq as u16]
        );

        // endpoints arrive
        h.node_mut().endpoints = vec![0x01];
        let event = Event::new(R_DEVICES, REVENT_ACTIVE_ENDPOINTS, 0, KEY);
        h.handle(&mut device, &event);
        h.drain(&mut device);

        // simple descriptor for endpoint 1 is missing -> ZDP 0x0004
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::SimpleDescriptors);
        assert_eq!(h.sent_zdp_clusters().last(), Some(&(ZdoCluster::SimpleDescReq as u16)));

        // descriptor arrives with a real device id
        h.node_mut().simple_descriptors = vec![SimpleDescriptor {
            endpoint: 0x01,
            profile_id: 0x0104,
            device_id: 0x0402,
            device_version: 1,
            in_clusters: vec![0x0000, 0x0500],
            out_clusters: vec![],
        }];
        let event = Event::new(R_DEVICES, REVENT_SIMPLE_DESCRIPTOR, 0, KEY);
        h.handle(&mut device, &event);
        h.drain(&mut device);

        // BasicCluster reads manufacturer name on cluster 0x0000
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::BasicCluster);
        let last = h.ctrl.inner().sent.last().cloned().unwrap();
        assert_eq!(last.cluster_id, 0x0000);
        assert_eq!(last.dst_endpoint, 0x01);

        // both attributes land (the parse pipeline would set them)
        device
            .resource_mut()
            .set_value(RATTR_MANUFACTURER_NAME, ItemValue::Str("LUMI".into()), ValueSource::Device)
            .unwrap();
        device
            .resource_mut()
            .set_value(RATTR_MODELID, ItemValue::Str("lumi.sensor_magnet.aq2".into()), ValueSource::Device)
            .unwrap();

        let event = Event::with_id(R_DEVICES, RATTR_MANUFACTURER_NAME, "", 0, KEY);
        h.handle(&mut device, &event);
        let seen = h.drain(&mut device);

        // with everything known the device asks for its DDF
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::GetDdf);
        assert!(seen.contains(&REVENT_DDF_INIT_REQUEST));

        // a positive response settles the device in Idle with both
        // parallel sub-state machines running
        let event = Event::new(R_DEVICES, REVENT_DDF_INIT_RESPONSE, 1, KEY);
        h.handle(&mut device, &event);
        h.drain(&mut device);

        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Idle);
        assert_eq!(device.current_state(StateLevel::Level1), DeviceState::Binding);
        assert_eq!(device.current_state(StateLevel::Level2), DeviceState::PollIdle);
    }

    #[test]
    fn no_ddf_match_leads_to_dead_and_reload_revives() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        device.states[0] = DeviceState::GetDdf;
        let event = Event::new(R_DEVICES, REVENT_DDF_INIT_RESPONSE, 0, KEY);
        h.handle(&mut device, &event);
        h.drain(&mut device);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Dead);

        // a DDF reload reanimates the device
        let event = Event::new(R_DEVICES, REVENT_DDF_RELOAD, 0, KEY);
        h.handle(&mut device, &event);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Init);
    }

    #[test]
    fn zdp_timeout_loops_back_to_init() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        h.awake(&mut device);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::NodeDescriptor);

        // no response within the MAC poll window
        let timeout = device.check_state_timer(h.now + MIN_MAC_POLL_RX_ON_MS + 1).unwrap();
        assert_eq!(timeout.what(), REVENT_STATE_TIMEOUT);
        h.handle(&mut device, &timeout);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Init);
    }

    #[test]
    fn aps_confirm_error_aborts_query() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        h.awake(&mut device);
        let req_id = device.zdp_result.aps_req_id;
        assert!(device.zdp_result.is_enqueued);

        let event = Event::new(
            R_DEVICES,
            REVENT_APS_CONFIRM,
            crate::event::aps_confirm_pack(req_id, 0xe1),
            KEY,
        );
        h.handle(&mut device, &event);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Init);
    }

    #[test]
    fn coordinator_is_parked_in_dead() {
        let mut h = Harness::new().with_node();
        h.node_mut().address = Address::nwk_and_ext(0x0000, KEY);
        let mut device = Device::new(KEY, 0, h.now);

        h.awake(&mut device);
        assert_eq!(device.current_state(StateLevel::Level0), DeviceState::Dead);
    }

    #[test]
    fn reachability_rules() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        // never awake, no node descriptor: unreachable
        assert!(!device.reachable(h.now));

        // a recent awake makes it reachable within the MAC poll window
        h.awake(&mut device);
        assert!(device.reachable(h.now));
        assert!(!device.reachable(h.now + MIN_MAC_POLL_RX_ON_MS + 1));

        // rx-on-when-idle devices follow state/reachable
        device.node = Some(Node {
            address: Address::nwk_and_ext(0x1234, KEY),
            node_descriptor: Some(NodeDescriptor {
                device_type: 1,
                mac_capabilities: 0x08, // receiver on when idle
                manufacturer_code: 0,
                max_buffer_size: 82,
            }),
            endpoints: vec![1],
            simple_descriptors: Vec::new(),
            binding_table: Vec::new(),
        });
        let late = h.now + MIN_MAC_POLL_RX_ON_MS + 1;
        assert!(!device.reachable(late));
        device
            .resource_mut()
            .set_value(RSTATE_REACHABLE, ItemValue::Bool(true), ValueSource::Device)
            .unwrap();
        assert!(device.reachable(late));
    }

    #[test]
    fn fill_item_from_sub_devices_copies_up() {
        let mut h = Harness::new().with_node();
        let mut device = Device::new(KEY, 0, h.now);

        let mut sub = Resource::new(crate::resource::R_SENSORS);
        sub.add_item(RATTR_UNIQUEID);
        sub.set_value(
            RATTR_UNIQUEID,
            ItemValue::Str(generate_unique_id(KEY, 1, 0x0500)),
            ValueSource::Api,
        )
        .unwrap();
        sub.add_item(RATTR_MODELID);
        sub.set_value(RATTR_MODELID, ItemValue::Str("lumi.magnet".into()), ValueSource::Device)
            .unwrap();
        let uid = sub.unique_id().to_string();
        h.resources.add(sub);
        device.add_sub_device(uid, crate::resource::R_SENSORS);

        let mut ctx = DeviceContext {
            ctrl: &mut h.ctrl,
            resources: &mut h.resources,
            ddf: &h.ddf,
            js: &mut h.js,
            access: &mut h.access,
            bus: &mut h.bus,
            now: h.now,
        };
        assert!(device.fill_item_from_sub_devices(RATTR_MODELID, &mut ctx));
        assert_eq!(device.resource().to_str(RATTR_MODELID), "lumi.magnet");
    }
}
