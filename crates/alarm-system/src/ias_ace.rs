//! IAS ACE cluster adapter
//!
//! Translates IAS ACE commands from keypads and keyfobs into alarm system
//! requests and answers with the matching response frames.

use gateway_core::resource::{
    RATTR_ID, RCONFIG_DURATION, RSTATE_ACTION, RSTATE_PRESENCE, R_SENSORS,
};
use gateway_core::uniqueid::parse_unique_id;
use gateway_core::{ApsSend, Event, EventBus, ItemValue, ResourceContainer, ValueSource};
use zigbee_aps::zcl::{
    ZCL_FC_CLUSTER_COMMAND, ZCL_FC_DIRECTION_SERVER_TO_CLIENT, ZCL_FC_DISABLE_DEFAULT_RESPONSE,
};
use zigbee_aps::{ApsDataIndication, ApsDataRequest, ZclFrame};

use crate::alarm::AlarmSystems;
use crate::device_table::DeviceTable;
use crate::persistence::AlarmStore;

// client -> server commands
pub const IAS_ACE_CMD_ARM: u8 = 0x00;
pub const IAS_ACE_CMD_EMERGENCY: u8 = 0x02;
pub const IAS_ACE_CMD_FIRE: u8 = 0x03;
pub const IAS_ACE_CMD_PANIC: u8 = 0x04;
pub const IAS_ACE_CMD_GET_PANEL_STATUS: u8 = 0x07;

// server -> client commands
pub const IAS_ACE_CMD_ARM_RESPONSE: u8 = 0x00;
pub const IAS_ACE_CMD_PANEL_STATUS_CHANGED: u8 = 0x04;
pub const IAS_ACE_CMD_GET_PANEL_STATUS_RESPONSE: u8 = 0x05;

/// Handles an IAS ACE cluster indication.
#[allow(clippy::too_many_arguments)]
pub fn handle_ias_ace_indication(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    alarm_systems: &mut AlarmSystems,
    dev_table: &DeviceTable,
    resources: &mut ResourceContainer,
    store: &dyn AlarmStore,
    ctrl: &mut dyn ApsSend,
    bus: &mut EventBus,
) {
    if frame.is_default_response() {
        return;
    }

    if frame.frame_control & ZCL_FC_DIRECTION_SERVER_TO_CLIENT != 0 {
        return;
    }

    if !frame.is_cluster_command() {
        return;
    }

    let src_ext = ind.src_address.ext;

    tracing::debug!(
        "[IAS ACE] {:#018x} command {:#04x}, {} payload bytes",
        src_ext,
        frame.command_id,
        frame.payload.len()
    );

    match frame.command_id {
        IAS_ACE_CMD_ARM => handle_arm_command(ind, frame, alarm_systems, dev_table, store, ctrl, bus),
        IAS_ACE_CMD_GET_PANEL_STATUS => {
            handle_get_panel_status(ind, frame, alarm_systems, dev_table, resources, ctrl, bus);
        }
        IAS_ACE_CMD_EMERGENCY | IAS_ACE_CMD_FIRE | IAS_ACE_CMD_PANIC => {
            // surface as a sensor action for downstream rules and alarms
            emit_action_event(ind, frame.command_id, resources, bus);
        }
        _ => {}
    }
}

/// Arm command payload:
/// `[0] enum8 arm mode | [1..] arm/disarm code bytes | [last] u8 zone id`
fn handle_arm_command(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    alarm_systems: &mut AlarmSystems,
    dev_table: &DeviceTable,
    store: &dyn AlarmStore,
    ctrl: &mut dyn ApsSend,
    bus: &mut EventBus,
) {
    if frame.payload.len() < 2 {
        return;
    }

    let arm_mode = frame.payload[0];
    if arm_mode > 0x03 {
        tracing::debug!("[IAS ACE] {:#018x} invalid arm mode {arm_mode}, skip", ind.src_address.ext);
        return;
    }

    let zone_id = *frame.payload.last().unwrap_or(&0);

    // the code is everything between the arm mode and the zone id; keyfobs
    // are allowed to send it empty
    let code = if frame.payload.len() > 2 {
        String::from_utf8_lossy(&frame.payload[1..frame.payload.len() - 1]).into_owned()
    } else {
        String::new()
    };

    tracing::debug!(
        "[IAS ACE] {:#018x} arm command, mode {:#04x}, zone {zone_id}",
        ind.src_address.ext,
        arm_mode
    );

    let src_ext = ind.src_address.ext;

    let system = match alarm_systems.get_for_device_mut(src_ext, dev_table) {
        Some(system) => system,
        None => match alarm_systems.get_mut(1) {
            Some(system) => system,
            None => return,
        },
    };

    let status = system.handle_arm(arm_mode, &code, src_ext, dev_table, bus, store);

    send_arm_response(ind, frame, status, ctrl);
}

fn handle_get_panel_status(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    alarm_systems: &mut AlarmSystems,
    dev_table: &DeviceTable,
    resources: &mut ResourceContainer,
    ctrl: &mut dyn ApsSend,
    bus: &mut EventBus,
) {
    let src_ext = ind.src_address.ext;

    let (panel_status, seconds) = {
        let system = match alarm_systems.get_for_device_mut(src_ext, dev_table) {
            Some(system) => system,
            None => match alarm_systems.get_mut(1) {
                Some(system) => system,
                None => return,
            },
        };
        (system.ias_ace_panel_status(), system.seconds_remaining())
    };

    send_get_panel_status_response(ind, frame, panel_status, seconds, ctrl);

    // some panels double as presence sensors; a status request implies
    // someone stood in front of the device
    refresh_presence_sensor(src_ext, resources, bus);
}

fn emit_action_event(
    ind: &ApsDataIndication,
    command: u8,
    resources: &mut ResourceContainer,
    bus: &mut EventBus,
) {
    let Some(r) = find_sensor_for_ext_mut(ind.src_address.ext, resources) else {
        return;
    };

    let id = r.to_str(RATTR_ID).to_string();
    let Some(item) = r.item_mut(RSTATE_ACTION) else {
        return;
    };

    if item.set_value(ItemValue::Num(i64::from(command)), ValueSource::Device).is_ok() {
        bus.enqueue(Event::with_id(
            R_SENSORS,
            RSTATE_ACTION,
            id,
            i64::from(command),
            ind.src_address.ext,
        ));
    }
}

fn refresh_presence_sensor(ext: u64, resources: &mut ResourceContainer, bus: &mut EventBus) {
    let mut target: Option<usize> = None;

    for (i, r) in resources.sensors.iter().enumerate() {
        let Some(parts) = parse_unique_id(r.unique_id()) else {
            continue;
        };
        if parts.ext_address == ext && r.item(RSTATE_PRESENCE).is_some() {
            target = Some(i);
            break;
        }
    }

    let Some(i) = target else {
        return;
    };

    let r = &mut resources.sensors[i];
    let id = r.to_str(RATTR_ID).to_string();
    let duration = r.to_number(RCONFIG_DURATION);

    if let Some(item) = r.item_mut(RSTATE_PRESENCE) {
        if item.set_value(ItemValue::Bool(true), ValueSource::Device).is_ok() {
            let _ = duration; // presence timeout handling lives in the rules engine
            bus.enqueue(Event::with_id(R_SENSORS, RSTATE_PRESENCE, id, 1, ext));
        }
    }
}

fn find_sensor_for_ext_mut<'a>(
    ext: u64,
    resources: &'a mut ResourceContainer,
) -> Option<&'a mut gateway_core::Resource> {
    resources.sensors.iter_mut().find(|r| {
        parse_unique_id(r.unique_id()).is_some_and(|p| p.ext_address == ext)
    })
}

fn response_request(ind: &ApsDataIndication, out_frame: &ZclFrame) -> ApsDataRequest {
    ApsDataRequest {
        dst_addr_mode: ind.src_addr_mode,
        dst_address: ind.src_address,
        dst_endpoint: ind.src_endpoint,
        src_endpoint: ind.dst_endpoint,
        profile_id: ind.profile_id,
        cluster_id: ind.cluster_id,
        asdu: out_frame.serialize(),
        tx_options: 0,
        radius: 0,
    }
}

fn send_arm_response(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    arm_notification: u8,
    ctrl: &mut dyn ApsSend,
) {
    debug_assert!(arm_notification <= 0x06);
    if arm_notification > 0x06 {
        return;
    }

    let out = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND
            | ZCL_FC_DIRECTION_SERVER_TO_CLIENT
            | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
        manufacturer_code: 0,
        sequence_number: frame.sequence_number,
        command_id: IAS_ACE_CMD_ARM_RESPONSE,
        payload: vec![arm_notification],
    };

    if ctrl.send(&response_request(ind, &out)).is_err() {
        tracing::warn!("[IAS ACE] failed to send arm response");
    }
}

fn send_get_panel_status_response(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    panel_status: u8,
    seconds_remaining: u8,
    ctrl: &mut dyn ApsSend,
) {
    // seconds remaining only applies to exit delay (0x04) and entry
    // delay (0x05)
    let seconds = match panel_status {
        0x04 | 0x05 => seconds_remaining,
        _ => 0,
    };

    let out = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DIRECTION_SERVER_TO_CLIENT,
        manufacturer_code: 0,
        sequence_number: frame.sequence_number,
        command_id: IAS_ACE_CMD_GET_PANEL_STATUS_RESPONSE,
        payload: vec![
            panel_status,
            seconds,
            0x01, // audible notification: default sound
            0x00, // alarm status: no alarm
        ],
    };

    if ctrl.send(&response_request(ind, &out)).is_err() {
        tracing::warn!("[IAS ACE] failed to send get panel status response");
    }
}

/// Broadcast helper used when the panel status changes: keypads bound to
/// the ACE cluster get a Panel Status Changed command.
pub fn build_panel_status_changed(
    dst: zigbee_aps::Address,
    dst_endpoint: u8,
    panel_status: u8,
    seconds_remaining: u8,
    sequence_number: u8,
) -> ApsDataRequest {
    let seconds = match panel_status {
        0x04 | 0x05 => seconds_remaining,
        _ => 0,
    };

    let out = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DIRECTION_SERVER_TO_CLIENT,
        manufacturer_code: 0,
        sequence_number,
        command_id: IAS_ACE_CMD_PANEL_STATUS_CHANGED,
        payload: vec![
            panel_status,
            seconds,
            0x01, // audible notification
            0x00, // alarm status
        ],
    };

    ApsDataRequest::unicast(dst, dst_endpoint, zigbee_aps::clusters::IAS_ACE, out.serialize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{panel_status, AlarmSystem, ArmMode};
    use crate::device_table::entry_flags;
    use crate::persistence::MemoryStore;
    use gateway_core::resource::{RATTR_ID, RATTR_UNIQUEID};
    use gateway_core::uniqueid::ext_address_from_unique_id;
    use gateway_core::{ApsCtrlWrapper, Resource, SteadyTime};
    use zigbee_aps::controller::testing::MockController;
    use zigbee_aps::{clusters, profiles, Address, AddressMode};

    const KEYPAD_UID: &str = "28:6d:97:00:01:06:41:79-01-0501";

    struct Fixture {
        alarm_systems: AlarmSystems,
        dev_table: DeviceTable,
        resources: ResourceContainer,
        store: MemoryStore,
        ctrl: ApsCtrlWrapper<MockController>,
        bus: EventBus,
        now: SteadyTime,
    }

    impl Fixture {
        /// One alarm system (id 1, PIN "1234") with the keypad registered
        /// as an IAS ACE member of the partition.
        fn new() -> Self {
            let now = SteadyTime(0);
            let store = MemoryStore::new();
            let mut bus = EventBus::new();

            let mut system = AlarmSystem::new(1, now);
            system.start(&store, &mut bus);
            assert!(system.set_code(0, "1234", &mut bus, &store));

            let mut alarm_systems = AlarmSystems::new();
            alarm_systems.systems.push(system);

            let mut dev_table = DeviceTable::new();
            dev_table.put(KEYPAD_UID, entry_flags::IAS_ACE, 1, &store);

            let mut fx = Self {
                alarm_systems,
                dev_table,
                resources: ResourceContainer::default(),
                store,
                ctrl: ApsCtrlWrapper::new(MockController::default()),
                bus,
                now,
            };
            fx.drain();
            fx
        }

        fn keypad_ext(&self) -> u64 {
            ext_address_from_unique_id(KEYPAD_UID)
        }

        fn indication(&self, command_id: u8, payload: Vec<u8>) -> (ApsDataIndication, ZclFrame) {
            let frame = ZclFrame {
                frame_control: ZCL_FC_CLUSTER_COMMAND,
                manufacturer_code: 0,
                sequence_number: 0x21,
                command_id,
                payload,
            };
            let ind = ApsDataIndication {
                dst_addr_mode: AddressMode::Nwk,
                dst_address: Address::nwk(0x0000),
                dst_endpoint: 0x01,
                src_addr_mode: AddressMode::Nwk,
                src_address: Address::nwk_and_ext(0x1234, self.keypad_ext()),
                src_endpoint: 0x01,
                profile_id: profiles::HOME_AUTOMATION,
                cluster_id: clusters::IAS_ACE,
                asdu: frame.serialize(),
                lqi: 255,
                rssi: -40,
            };
            (ind, frame)
        }

        fn handle(&mut self, ind: &ApsDataIndication, frame: &ZclFrame) {
            handle_ias_ace_indication(
                ind,
                frame,
                &mut self.alarm_systems,
                &self.dev_table,
                &mut self.resources,
                &self.store,
                &mut self.ctrl,
                &mut self.bus,
            );
            self.drain();
        }

        /// Routes pending bus events back into the alarm systems, as the
        /// global event handler does.
        fn drain(&mut self) {
            while let Some(event) = self.bus.pop() {
                for system in &mut self.alarm_systems.systems {
                    system.handle_event(&event, &mut self.bus, self.now);
                }
            }
        }

        fn sent_frames(&self) -> Vec<ZclFrame> {
            self.ctrl
                .inner()
                .sent
                .iter()
                .map(|req| ZclFrame::parse(&req.asdu).unwrap())
                .collect()
        }

        fn keypad_sensor(&mut self) -> &mut Resource {
            let mut r = Resource::new(R_SENSORS);
            r.add_item(RATTR_ID);
            r.add_item(RATTR_UNIQUEID);
            r.set_value(RATTR_ID, ItemValue::Str("7".into()), ValueSource::Api).unwrap();
            r.set_value(RATTR_UNIQUEID, ItemValue::Str(KEYPAD_UID.into()), ValueSource::Api)
                .unwrap();
            self.resources.add(r).unwrap()
        }
    }

    #[test]
    fn arm_command_with_code_arms_the_system() {
        let mut fx = Fixture::new();

        // arm mode 0x03 (all zones) | code "1234" | zone id, no length byte
        let mut payload = vec![0x03];
        payload.extend_from_slice(b"1234");
        payload.push(0x05);
        let (ind, frame) = fx.indication(IAS_ACE_CMD_ARM, payload);
        fx.handle(&ind, &frame);

        assert_eq!(fx.alarm_systems.get(1).unwrap().target_arm_mode(), ArmMode::ArmedAway);

        // arm response: all zones armed, sequence number echoed
        let sent = fx.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_id, IAS_ACE_CMD_ARM_RESPONSE);
        assert_eq!(sent[0].sequence_number, 0x21);
        assert_eq!(sent[0].payload, vec![0x03]);
        assert_eq!(fx.ctrl.inner().sent[0].cluster_id, clusters::IAS_ACE);
        assert_eq!(fx.ctrl.inner().sent[0].dst_address.nwk, 0x1234);
    }

    #[test]
    fn arm_with_wrong_code_is_rejected() {
        let mut fx = Fixture::new();

        let mut payload = vec![0x03];
        payload.extend_from_slice(b"9999");
        payload.push(0x05);
        let (ind, frame) = fx.indication(IAS_ACE_CMD_ARM, payload);
        fx.handle(&ind, &frame);

        assert_eq!(fx.alarm_systems.get(1).unwrap().target_arm_mode(), ArmMode::Disarmed);

        let sent = fx.sent_frames();
        assert_eq!(sent.len(), 1);
        // 0x04: invalid arm/disarm code
        assert_eq!(sent[0].payload, vec![0x04]);
    }

    #[test]
    fn keyfob_disarms_without_a_code() {
        let mut fx = Fixture::new();

        {
            let store = &fx.store;
            let system = fx.alarm_systems.get_mut(1).unwrap();
            system.set_target_arm_mode(ArmMode::ArmedAway, &mut fx.bus, store);
        }
        fx.drain();

        // disarm | no code | zone id
        let (ind, frame) = fx.indication(IAS_ACE_CMD_ARM, vec![0x00, 0x05]);
        fx.handle(&ind, &frame);

        assert_eq!(fx.alarm_systems.get(1).unwrap().target_arm_mode(), ArmMode::Disarmed);

        let sent = fx.sent_frames();
        // 0x00: all zones disarmed
        assert_eq!(sent[0].payload, vec![0x00]);
    }

    #[test]
    fn arm_from_unregistered_keyfob_is_rejected() {
        let mut fx = Fixture::new();
        fx.dev_table = DeviceTable::new(); // the keypad is unknown now

        let (ind, frame) = fx.indication(IAS_ACE_CMD_ARM, vec![0x03, 0x05]);
        fx.handle(&ind, &frame);

        assert_eq!(fx.alarm_systems.get(1).unwrap().target_arm_mode(), ArmMode::Disarmed);
        assert_eq!(fx.sent_frames()[0].payload, vec![0x04]);
    }

    #[test]
    fn invalid_arm_mode_is_dropped() {
        let mut fx = Fixture::new();

        let (ind, frame) = fx.indication(IAS_ACE_CMD_ARM, vec![0x07, 0x05]);
        fx.handle(&ind, &frame);
        assert!(fx.ctrl.inner().sent.is_empty());
    }

    #[test]
    fn get_panel_status_response_fields() {
        let mut fx = Fixture::new();

        let (ind, frame) = fx.indication(IAS_ACE_CMD_GET_PANEL_STATUS, vec![]);
        fx.handle(&ind, &frame);

        let sent = fx.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_id, IAS_ACE_CMD_GET_PANEL_STATUS_RESPONSE);
        assert_eq!(sent[0].sequence_number, 0x21);
        // disarmed panel, no seconds remaining, audible 0x01, alarm 0x00
        assert_eq!(sent[0].payload, vec![panel_status::DISARMED, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn get_panel_status_refreshes_colocated_presence() {
        let mut fx = Fixture::new();
        fx.keypad_sensor().add_item(RSTATE_PRESENCE).unwrap();

        let (ind, frame) = fx.indication(IAS_ACE_CMD_GET_PANEL_STATUS, vec![]);
        fx.handle(&ind, &frame);

        let r = fx.resources.get(R_SENSORS, KEYPAD_UID).unwrap();
        assert!(r.to_bool(RSTATE_PRESENCE));
    }

    #[test]
    fn emergency_command_raises_sensor_action() {
        let mut fx = Fixture::new();
        fx.keypad_sensor().add_item(RSTATE_ACTION).unwrap();

        let (ind, frame) = fx.indication(IAS_ACE_CMD_EMERGENCY, vec![]);

        // capture the fan-in event before drain consumes it
        handle_ias_ace_indication(
            &ind,
            &frame,
            &mut fx.alarm_systems,
            &fx.dev_table,
            &mut fx.resources,
            &fx.store,
            &mut fx.ctrl,
            &mut fx.bus,
        );

        let event = fx.bus.pop().unwrap();
        assert_eq!(event.resource(), R_SENSORS);
        assert_eq!(event.what(), RSTATE_ACTION);
        assert_eq!(event.num(), i64::from(IAS_ACE_CMD_EMERGENCY));

        let r = fx.resources.get(R_SENSORS, KEYPAD_UID).unwrap();
        assert_eq!(r.to_number(RSTATE_ACTION), i64::from(IAS_ACE_CMD_EMERGENCY));
    }

    #[test]
    fn server_to_client_frames_are_ignored() {
        let mut fx = Fixture::new();

        let (ind, mut frame) = fx.indication(IAS_ACE_CMD_ARM, vec![0x00, 0x05]);
        frame.frame_control |= ZCL_FC_DIRECTION_SERVER_TO_CLIENT;
        fx.handle(&ind, &frame);

        assert!(fx.ctrl.inner().sent.is_empty());
    }
}
