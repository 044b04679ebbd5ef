//! Alarm system event fan-in
//!
//! Routes bus events into the alarm state machines, mirrors panel state to
//! IAS ACE keypads and transforms matching device events into
//! `devicealarm` events carrying partition id and arm mask.

use gateway_core::event::REVENT_DEVICE_ALARM;
use gateway_core::resource::{
    RATTR_ID, RATTR_UNIQUEID, RSTATE_ACTION, RSTATE_ARM_STATE, RSTATE_BUTTON_EVENT, RSTATE_ON,
    RSTATE_OPEN, RSTATE_PANEL, RSTATE_PRESENCE, RSTATE_SECONDS_REMAINING, RSTATE_VIBRATION,
    R_ALARMSYSTEMS, R_LIGHTS, R_SENSORS,
};
use gateway_core::{Event, EventBus, ItemValue, ResourceContainer, SteadyTime, ValueSource};

use crate::alarm::AlarmSystems;
use crate::device_table::{entry_flags, DeviceTable};
use crate::ias_ace::{IAS_ACE_CMD_EMERGENCY, IAS_ACE_CMD_PANIC};

/// Forwards \p event to every alarm system and keeps keypads in sync.
pub fn handle_alarm_system_event(
    event: &Event,
    alarm_systems: &mut AlarmSystems,
    dev_table: &DeviceTable,
    resources: &mut ResourceContainer,
    bus: &mut EventBus,
    now: SteadyTime,
) {
    for system in &mut alarm_systems.systems {
        system.handle_event(event, bus, now);

        if event.what() == RSTATE_ARM_STATE || event.what() == RSTATE_SECONDS_REMAINING {
            mirror_keypad_state(system, dev_table, resources, bus);
        }
    }
}

/// For keypads (entries flagged IAS_ACE) mirror panel state and remaining
/// seconds into their sensor resources.
fn mirror_keypad_state(
    system: &crate::alarm::AlarmSystem,
    dev_table: &DeviceTable,
    resources: &mut ResourceContainer,
    bus: &mut EventBus,
) {
    for i in 0..dev_table.size() {
        let entry = dev_table.at(i);
        if !entry.is_valid() || entry.flags & entry_flags::IAS_ACE == 0 {
            continue;
        }
        if u32::from(entry.alarm_system_id) != system.id() {
            continue;
        }

        let Some(r) = resources.get_mut(R_SENSORS, entry.unique_id()) else {
            continue;
        };

        let id = r.to_str(RATTR_ID).to_string();
        let seconds = i64::from(system.seconds_remaining());
        let panel = system.arm_state_string().to_string();

        if let Some(item) = r.item_mut(RSTATE_SECONDS_REMAINING) {
            let _ = item.set_value(ItemValue::Num(seconds), ValueSource::Api);
            if item.need_push_change() {
                bus.enqueue(Event::with_id(
                    R_SENSORS,
                    RSTATE_SECONDS_REMAINING,
                    id.clone(),
                    seconds,
                    entry.ext_address,
                ));
            }
        }

        if let Some(item) = r.item_mut(RSTATE_PANEL) {
            let _ = item.set_value(ItemValue::Str(panel), ValueSource::Api);
            if item.need_push_change() {
                bus.enqueue(Event::with_id(R_SENSORS, RSTATE_PANEL, id, 0, entry.ext_address));
            }
        }
    }
}

/// Filter for events which are interesting for the alarm system.
fn is_alarm_system_device_event(event: &Event) -> bool {
    if !event.what().starts_with("state/") {
        return false;
    }

    if event.resource() == R_SENSORS {
        return match event.what() {
            RSTATE_PRESENCE | RSTATE_OPEN | RSTATE_VIBRATION => event.num() > 0,
            RSTATE_BUTTON_EVENT => true,
            RSTATE_ACTION => {
                event.num() >= i64::from(IAS_ACE_CMD_EMERGENCY)
                    && event.num() <= i64::from(IAS_ACE_CMD_PANIC)
            }
            _ => false,
        };
    }

    if event.resource() == R_LIGHTS {
        return event.what() == RSTATE_ON && event.num() > 0;
    }

    false
}

/// For devices registered in an alarm system, transform matching events
/// into `devicealarm` events. An armed system reacts by entering the entry
/// delay.
pub fn handle_alarm_system_device_event(
    event: &Event,
    dev_table: &DeviceTable,
    resources: &ResourceContainer,
    bus: &mut EventBus,
) {
    if !is_alarm_system_device_event(event) {
        return;
    }

    let Some(r) = resources.get(event.resource(), event.id()) else {
        return;
    };

    let unique_id = r.to_str(RATTR_UNIQUEID);
    if unique_id.is_empty() {
        return;
    }

    let entry = dev_table.get(unique_id);
    if !entry.is_valid() {
        return;
    }

    let mut event_data = i64::from(entry.alarm_system_id);
    event_data |= i64::from(entry.flags & entry_flags::ARM_MASK);

    bus.enqueue(Event::new(R_ALARMSYSTEMS, REVENT_DEVICE_ALARM, event_data, 0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use gateway_core::Resource;

    const UID: &str = "28:6d:97:00:01:06:41:79-01-0500";

    fn sensor(id: &str, unique_id: &str) -> Resource {
        let mut r = Resource::new(R_SENSORS);
        r.add_item(RATTR_ID);
        r.add_item(RATTR_UNIQUEID);
        r.set_value(RATTR_ID, ItemValue::Str(id.into()), ValueSource::Api).unwrap();
        r.set_value(RATTR_UNIQUEID, ItemValue::Str(unique_id.into()), ValueSource::Api).unwrap();
        r
    }

    #[test]
    fn presence_event_fans_into_devicealarm() {
        let store = MemoryStore::new();
        let mut dev_table = DeviceTable::new();
        dev_table.put(UID, entry_flags::ARMED_AWAY | entry_flags::ARMED_NIGHT, 1, &store);

        let mut resources = ResourceContainer::default();
        let mut s = sensor("5", UID);
        s.add_item(RSTATE_PRESENCE);
        resources.add(s);

        let mut bus = EventBus::new();
        let event = Event::with_id(R_SENSORS, RSTATE_PRESENCE, "5", 1, 0);
        handle_alarm_system_device_event(&event, &dev_table, &resources, &mut bus);

        let out = bus.pop().unwrap();
        assert_eq!(out.what(), REVENT_DEVICE_ALARM);
        assert_eq!(out.num() & 0xff, 1); // partition id
        assert_eq!(
            out.num() & i64::from(entry_flags::ARM_MASK),
            i64::from(entry_flags::ARMED_AWAY | entry_flags::ARMED_NIGHT)
        );
    }

    #[test]
    fn falling_edges_do_not_trigger() {
        let store = MemoryStore::new();
        let mut dev_table = DeviceTable::new();
        dev_table.put(UID, entry_flags::ARMED_AWAY, 1, &store);

        let mut resources = ResourceContainer::default();
        resources.add(sensor("5", UID));

        let mut bus = EventBus::new();
        // presence -> false is not a trigger
        let event = Event::with_id(R_SENSORS, RSTATE_PRESENCE, "5", 0, 0);
        handle_alarm_system_device_event(&event, &dev_table, &resources, &mut bus);
        assert!(bus.is_empty());

        // config events never trigger
        let event = Event::with_id(R_SENSORS, "config/battery", "5", 10, 0);
        handle_alarm_system_device_event(&event, &dev_table, &resources, &mut bus);
        assert!(bus.is_empty());
    }

    #[test]
    fn unregistered_devices_are_ignored() {
        let dev_table = DeviceTable::new();
        let mut resources = ResourceContainer::default();
        resources.add(sensor("5", UID));

        let mut bus = EventBus::new();
        let event = Event::with_id(R_SENSORS, RSTATE_PRESENCE, "5", 1, 0);
        handle_alarm_system_device_event(&event, &dev_table, &resources, &mut bus);
        assert!(bus.is_empty());
    }
}
