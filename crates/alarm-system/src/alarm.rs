//! Alarm system state machine
//!
//! A stateful alarm panel controlled by events from physical devices and
//! the REST API. There are four target states (disarmed, armed_stay,
//! armed_night, armed_away); transitions run through exit delay, arming,
//! entry delay and in-alarm states on a one second tick.
//!
//! Event payload layout for `devicealarm`:
//! `0000 0000 0000 0000 MMMM MMMM AAAA AAAA`
//! where `A` is the alarm system id and `M` the arm mask bits.

use gateway_core::event::{REVENT_DEVICE_ALARM, REVENT_TIMER_FIRED};
use gateway_core::resource::{
    DataType, RATTR_ID, RATTR_NAME, RCONFIG_ALARM_SYSTEM_ID, RCONFIG_ARMED_AWAY_ENTRY_DELAY,
    RCONFIG_ARMED_AWAY_EXIT_DELAY, RCONFIG_ARMED_AWAY_TRIGGER_DURATION,
    RCONFIG_ARMED_NIGHT_ENTRY_DELAY, RCONFIG_ARMED_NIGHT_EXIT_DELAY,
    RCONFIG_ARMED_NIGHT_TRIGGER_DURATION, RCONFIG_ARMED_STAY_ENTRY_DELAY,
    RCONFIG_ARMED_STAY_EXIT_DELAY, RCONFIG_ARMED_STAY_TRIGGER_DURATION, RCONFIG_ARM_MODE,
    RCONFIG_CONFIGURED, RCONFIG_DISARMED_ENTRY_DELAY, RCONFIG_DISARMED_EXIT_DELAY,
    RSTATE_ARM_STATE, RSTATE_SECONDS_REMAINING, R_ALARMSYSTEMS,
};
use gateway_core::{system_now_ms, Event, EventBus, ItemValue, Resource, SteadyTime, ValueSource};

use crate::crypto;
use crate::device_table::{entry_flags, DeviceTable};
use crate::persistence::{AlarmStore, ResourceItemRecord, SecretRecord};

pub type AlarmSystemId = u32;

const AS_ID_MASK: i64 = 0xff;

/// IAS ACE panel status values; `state/armstate` maps onto these directly.
pub mod panel_status {
    pub const DISARMED: u8 = 0x00;
    pub const ARMED_STAY: u8 = 0x01;
    pub const ARMED_NIGHT: u8 = 0x02;
    pub const ARMED_AWAY: u8 = 0x03;
    pub const EXIT_DELAY: u8 = 0x04;
    pub const ENTRY_DELAY: u8 = 0x05;
    pub const NOT_READY_TO_ARM: u8 = 0x06;
    pub const IN_ALARM: u8 = 0x07;
    pub const ARMING_STAY: u8 = 0x08;
    pub const ARMING_NIGHT: u8 = 0x09;
    pub const ARMING_AWAY: u8 = 0x0a;
}

const PANEL_STATUS_STRINGS: [&str; 11] = [
    "disarmed",
    "armed_stay",
    "armed_night",
    "armed_away",
    "exit_delay",
    "entry_delay",
    "not_ready_to_arm",
    "in_alarm",
    "arming_stay",
    "arming_night",
    "arming_away",
];

/// Renders an IAS ACE panel status as its REST string.
#[must_use]
pub fn panel_status_to_string(status: u8) -> &'static str {
    PANEL_STATUS_STRINGS
        .get(usize::from(status))
        .copied()
        .unwrap_or("not_ready_to_arm")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ArmMode {
    Disarmed = 0,
    ArmedStay = 1,
    ArmedNight = 2,
    ArmedAway = 3,
}

const ARM_MODE_STRINGS: [&str; 4] = ["disarmed", "armed_stay", "armed_night", "armed_away"];

// event arm mask for each target state, used to filter device alarms
const TARGET_ARM_MASK: [u32; 4] = [
    0,
    entry_flags::ARMED_STAY,
    entry_flags::ARMED_NIGHT,
    entry_flags::ARMED_AWAY,
];

impl ArmMode {
    #[must_use]
    pub fn to_str(self) -> &'static str {
        ARM_MODE_STRINGS[self as usize]
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "disarmed" => Some(ArmMode::Disarmed),
            "armed_stay" => Some(ArmMode::ArmedStay),
            "armed_night" => Some(ArmMode::ArmedNight),
            "armed_away" => Some(ArmMode::ArmedAway),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsState {
    Disarmed,
    ExitDelay,
    Arming,
    Armed,
    EntryDelay,
    InAlarm,
}

/// Suffixes persisted through `did_set_value`.
const STORE_SUFFIXES: [&str; 13] = [
    RATTR_NAME,
    RCONFIG_ARM_MODE,
    RCONFIG_DISARMED_ENTRY_DELAY,
    RCONFIG_DISARMED_EXIT_DELAY,
    RCONFIG_ARMED_AWAY_ENTRY_DELAY,
    RCONFIG_ARMED_AWAY_EXIT_DELAY,
    RCONFIG_ARMED_AWAY_TRIGGER_DURATION,
    RCONFIG_ARMED_STAY_ENTRY_DELAY,
    RCONFIG_ARMED_STAY_EXIT_DELAY,
    RCONFIG_ARMED_STAY_TRIGGER_DURATION,
    RCONFIG_ARMED_NIGHT_ENTRY_DELAY,
    RCONFIG_ARMED_NIGHT_EXIT_DELAY,
    RCONFIG_ARMED_NIGHT_TRIGGER_DURATION,
];

pub struct AlarmSystem {
    res: Resource,
    state: AsState,
    target_state: ArmMode,
    // target state parameters, refreshed when the target changes (seconds)
    exit_delay: i64,
    entry_delay: i64,
    trigger_duration: i64,
    arm_mask: u32,
    /// 1 Hz tick deadline while a timed state runs.
    timer: Option<SteadyTime>,
    /// When the current timed state was entered.
    t_state: SteadyTime,
}

impl AlarmSystem {
    #[must_use]
    pub fn new(id: AlarmSystemId, now: SteadyTime) -> Self {
        let mut res = Resource::new(R_ALARMSYSTEMS);

        if let Some(item) = res.add_item(RCONFIG_ALARM_SYSTEM_ID) {
            item.set_is_public(false);
            let _ = item.set_value(ItemValue::Num(i64::from(id)), ValueSource::Api);
        }
        if let Some(item) = res.add_item(RSTATE_ARM_STATE) {
            let _ = item.set_value(
                ItemValue::Num(i64::from(panel_status::NOT_READY_TO_ARM)),
                ValueSource::Api,
            );
        }
        if let Some(item) = res.add_item(RCONFIG_CONFIGURED) {
            let _ = item.set_value(ItemValue::Bool(false), ValueSource::Api);
        }
        if let Some(item) = res.add_item(RCONFIG_ARM_MODE) {
            let _ = item.set_value(
                ItemValue::Str(ArmMode::Disarmed.to_str().into()),
                ValueSource::Api,
            );
        }
        if let Some(item) = res.add_item(RATTR_ID) {
            let _ = item.set_value(ItemValue::Str(id.to_string()), ValueSource::Api);
        }
        res.add_item(RATTR_NAME);

        if let Some(item) = res.add_item(RSTATE_SECONDS_REMAINING) {
            let _ = item.set_value(ItemValue::Num(0), ValueSource::Api);
        }

        let defaults: [(&str, i64); 11] = [
            (RCONFIG_DISARMED_ENTRY_DELAY, 0),
            (RCONFIG_DISARMED_EXIT_DELAY, 0),
            (RCONFIG_ARMED_STAY_ENTRY_DELAY, 120),
            (RCONFIG_ARMED_STAY_EXIT_DELAY, 120),
            (RCONFIG_ARMED_STAY_TRIGGER_DURATION, 120),
            (RCONFIG_ARMED_NIGHT_ENTRY_DELAY, 120),
            (RCONFIG_ARMED_NIGHT_EXIT_DELAY, 120),
            (RCONFIG_ARMED_NIGHT_TRIGGER_DURATION, 120),
            (RCONFIG_ARMED_AWAY_ENTRY_DELAY, 120),
            (RCONFIG_ARMED_AWAY_EXIT_DELAY, 120),
            (RCONFIG_ARMED_AWAY_TRIGGER_DURATION, 120),
        ];
        for (suffix, value) in defaults {
            if let Some(item) = res.add_item(suffix) {
                let _ = item.set_value(ItemValue::Num(value), ValueSource::Api);
            }
        }

        let mut alarm = Self {
            res,
            state: AsState::Disarmed,
            target_state: ArmMode::Disarmed,
            exit_delay: 0,
            entry_delay: 0,
            trigger_duration: 0,
            arm_mask: 0,
            timer: None,
            t_state: now,
        };
        alarm.update_target_state_values();
        alarm
    }

    #[must_use]
    pub fn id(&self) -> AlarmSystemId {
        self.res.to_number(RCONFIG_ALARM_SYSTEM_ID) as AlarmSystemId
    }

    #[must_use]
    pub fn id_string(&self) -> &str {
        self.res.to_str(RATTR_ID)
    }

    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.res
    }

    pub fn resource_mut(&mut self) -> &mut Resource {
        &mut self.res
    }

    /// The response status for an IAS ACE panel status request.
    #[must_use]
    pub fn ias_ace_panel_status(&self) -> u8 {
        (self.res.to_number(RSTATE_ARM_STATE) & 0xff) as u8
    }

    /// Remaining seconds, meaningful for entry and exit states only.
    #[must_use]
    pub fn seconds_remaining(&self) -> u8 {
        if self.state == AsState::EntryDelay || self.state == AsState::ExitDelay {
            return self.res.to_number(RSTATE_SECONDS_REMAINING) as u8;
        }
        0
    }

    /// `state/armstate` rendered as its panel status string.
    #[must_use]
    pub fn arm_state_string(&self) -> &'static str {
        panel_status_to_string(self.ias_ace_panel_status())
    }

    #[must_use]
    pub fn target_arm_mode(&self) -> ArmMode {
        self.target_state
    }

    /// Sets the target arm mode; the state machine picks the change up via
    /// the emitted `config/armmode` event.
    pub fn set_target_arm_mode(
        &mut self,
        mode: ArmMode,
        bus: &mut EventBus,
        store: &dyn AlarmStore,
    ) -> bool {
        if mode == self.target_state {
            return true;
        }
        self.set_value(RCONFIG_ARM_MODE, ItemValue::Str(mode.to_str().into()), bus, store)
    }

    /// Sets an item value with `did_set_value` semantics: the change is
    /// published on the bus and `attr/*`/`config/*` items from the store
    /// list are persisted.
    pub fn set_value(
        &mut self,
        suffix: &str,
        value: ItemValue,
        bus: &mut EventBus,
        store: &dyn AlarmStore,
    ) -> bool {
        let id = self.id();
        let id_string = self.id_string().to_string();

        let Some(item) = self.res.item_mut(suffix) else {
            return false;
        };

        let num_prev = item.to_number();
        if item.set_value(value, ValueSource::Api).is_err() {
            return false;
        }

        let descriptor = item.descriptor();
        let num = item.to_number();
        let value_string = match descriptor.data_type {
            DataType::String => item.to_str().to_string(),
            _ => num.to_string(),
        };

        bus.enqueue(
            Event::with_id(R_ALARMSYSTEMS, descriptor.suffix, id_string, num, 0)
                .with_num_prev(num_prev),
        );

        if STORE_SUFFIXES.contains(&descriptor.suffix) {
            store.store_alarm_system_resource_item(&ResourceItemRecord {
                alarm_system_id: id,
                suffix: descriptor.suffix.to_string(),
                value: value_string,
                timestamp: system_now_ms(),
            });
        }

        true
    }

    /// Verifies a PIN. When \p src_ext_address is set, the sending device
    /// must be a member of this partition.
    #[must_use]
    pub fn is_valid_code(
        &self,
        code: &str,
        src_ext_address: u64,
        dev_table: &DeviceTable,
        store: &dyn AlarmStore,
    ) -> bool {
        if src_ext_address != 0 {
            let entry = dev_table.get_by_ext(src_ext_address);
            if !entry.is_valid() || AlarmSystemId::from(entry.alarm_system_id) != self.id() {
                return false;
            }
        }

        let key = format!("as_{}_code0", self.id());
        match store.load_secret(&key) {
            Some(secret) => crypto::scrypt_verify(&secret.secret, code),
            None => false,
        }
    }

    /// Stores the PIN for \p index encrypted (scrypt PHC).
    pub fn set_code(
        &mut self,
        index: u32,
        code: &str,
        bus: &mut EventBus,
        store: &dyn AlarmStore,
    ) -> bool {
        if code.len() < 4 || code.len() > 16 {
            return false;
        }

        let secret = crypto::scrypt_password(code, &crypto::generate_salt());
        if secret.is_empty() {
            return false;
        }

        let record = SecretRecord {
            unique_id: format!("as_{}_code{}", self.id(), index),
            secret,
            state: 1,
        };

        if store.store_secret(&record) {
            self.set_value(RCONFIG_CONFIGURED, ItemValue::Bool(true), bus, store);
            return true;
        }

        false
    }

    /// Handles an IAS ACE style arm request.
    ///
    /// Returns the arm response notification code (0x00..0x06).
    pub fn handle_arm(
        &mut self,
        arm_mode: u8,
        code: &str,
        src_ext_address: u64,
        dev_table: &DeviceTable,
        bus: &mut EventBus,
        store: &dyn AlarmStore,
    ) -> u8 {
        const NOTF_ALL_ZONES_DISARMED: u8 = 0x00;
        const NOTF_INVALID_CODE: u8 = 0x04;
        const NOTF_NOT_READY: u8 = 0x05;
        const NOTF_ALREADY_DISARMED: u8 = 0x06;

        let mode = match arm_mode {
            0x00 => ArmMode::Disarmed,
            0x01 => ArmMode::ArmedStay,
            0x02 => ArmMode::ArmedNight,
            0x03 => ArmMode::ArmedAway,
            _ => return NOTF_NOT_READY,
        };

        if !code.is_empty() && !self.is_valid_code(code, src_ext_address, dev_table, store) {
            return NOTF_INVALID_CODE;
        }

        if code.is_empty() {
            // keyfobs may arm without a code only from their own partition
            let entry = dev_table.get_by_ext(src_ext_address);
            if !entry.is_valid() || AlarmSystemId::from(entry.alarm_system_id) != self.id() {
                return NOTF_INVALID_CODE;
            }
        }

        if mode == ArmMode::Disarmed && self.target_state == ArmMode::Disarmed {
            return NOTF_ALREADY_DISARMED;
        }

        self.set_target_arm_mode(mode, bus, store);

        match mode {
            ArmMode::Disarmed => NOTF_ALL_ZONES_DISARMED,
            ArmMode::ArmedStay => 0x01,
            ArmMode::ArmedNight => 0x02,
            ArmMode::ArmedAway => 0x03,
        }
    }

    /// Brings the machine into operation after database hydration: the
    /// persisted arm mode becomes the initial state, and a stored secret
    /// marks the system configured.
    pub fn start(&mut self, store: &dyn AlarmStore, bus: &mut EventBus) {
        let mode = ArmMode::from_str(self.res.to_str(RCONFIG_ARM_MODE)).unwrap_or(ArmMode::Disarmed);
        self.target_state = mode;
        self.state = match mode {
            ArmMode::Disarmed => AsState::Disarmed,
            _ => AsState::Armed,
        };

        self.update_arm_state_and_panel_status(bus);
        self.update_target_state_values();

        let key = format!("as_{}_code0", self.id());
        let configured = store.load_secret(&key).is_some();
        if let Some(item) = self.res.item_mut(RCONFIG_CONFIGURED) {
            let _ = item.set_value(ItemValue::Bool(configured), ValueSource::Api);
        }
    }

    /// Main entry for internal and external events.
    pub fn handle_event(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        if event.resource() == R_ALARMSYSTEMS
            && event.what() == RCONFIG_ARM_MODE
            && event.id() == self.id_string()
        {
            // target state changed?
            let Some(mode) = ArmMode::from_str(self.res.to_str(RCONFIG_ARM_MODE)) else {
                return; // invalid target arm mode request, should not happen
            };

            let old_target = self.target_state;
            self.target_state = mode;
            self.update_target_state_values();

            if old_target == self.target_state {
                return;
            }

            // set early so state and panel events carry correct numbers
            self.set_seconds_remaining(self.exit_delay, bus);
            self.set_state(AsState::ExitDelay, bus);
            self.start_state_timer(now);
        } else {
            self.dispatch_state(event, bus, now);
        }
    }

    /// Fires the 1 Hz tick while a timed state runs.
    pub fn advance(&mut self, now: SteadyTime, bus: &mut EventBus) {
        let Some(deadline) = self.timer else {
            return;
        };
        if now < deadline {
            return;
        }
        self.timer = Some(deadline + 1000);

        let tick = Event::with_id(
            R_ALARMSYSTEMS,
            REVENT_TIMER_FIRED,
            self.id_string().to_string(),
            0,
            0,
        );
        self.dispatch_state(&tick, bus, now);
    }

    fn dispatch_state(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        match self.state {
            AsState::Disarmed => {}
            AsState::ExitDelay => self.state_exit_delay(event, bus, now),
            AsState::Arming => self.state_arming(event, bus),
            AsState::Armed => self.state_armed(event, bus, now),
            AsState::EntryDelay => self.state_entry_delay(event, bus, now),
            AsState::InAlarm => self.state_in_alarm(event, bus, now),
        }
    }

    fn state_exit_delay(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        if event.what() != REVENT_TIMER_FIRED {
            return;
        }

        let dt = now.elapsed_since(self.t_state);

        if self.exit_delay * 1000 < dt {
            self.set_seconds_remaining(0, bus);
            self.stop_timer();

            if self.target_state == ArmMode::Disarmed {
                self.set_state(AsState::Disarmed, bus);
            } else {
                self.start_state_timer(now);
                self.set_state(AsState::Arming, bus);
            }
        } else {
            self.set_seconds_remaining((self.exit_delay * 1000 - dt) / 1000, bus);
        }
    }

    fn state_arming(&mut self, event: &Event, bus: &mut EventBus) {
        if event.what() == REVENT_TIMER_FIRED {
            self.stop_timer();
            self.set_state(AsState::Armed, bus);
        }
    }

    fn state_armed(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        if event.what() == REVENT_DEVICE_ALARM {
            tracing::debug!("[AS] received device alarm, data: {:#010x}", event.num());

            if event.num() & i64::from(self.arm_mask) == 0 {
                // the triggering device is not armed in this mode
            } else if event.num() & AS_ID_MASK == i64::from(self.id()) {
                self.set_seconds_remaining(self.entry_delay, bus);
                self.set_state(AsState::EntryDelay, bus);
                self.start_state_timer(now);
            }
        }
    }

    fn state_entry_delay(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        if event.what() != REVENT_TIMER_FIRED {
            return;
        }

        let dt = now.elapsed_since(self.t_state);

        if self.entry_delay * 1000 < dt {
            self.set_seconds_remaining(0, bus);
            self.start_state_timer(now);
            self.set_state(AsState::InAlarm, bus);
        } else {
            self.set_seconds_remaining((self.entry_delay * 1000 - dt) / 1000, bus);
        }
    }

    fn state_in_alarm(&mut self, event: &Event, bus: &mut EventBus, now: SteadyTime) {
        if event.what() != REVENT_TIMER_FIRED {
            return;
        }

        if self.trigger_duration * 1000 < now.elapsed_since(self.t_state) {
            self.stop_timer();
            self.set_state(AsState::Armed, bus);
        } else {
            tracing::debug!("[AS] {} in alarm", self.id_string());
        }
    }

    fn set_state(&mut self, state: AsState, bus: &mut EventBus) {
        if self.state != state {
            self.state = state;
        }
        self.update_arm_state_and_panel_status(bus);
    }

    fn start_state_timer(&mut self, now: SteadyTime) {
        self.t_state = now;
        self.timer = Some(now + 1000);
    }

    fn stop_timer(&mut self) {
        self.timer = None;
    }

    /// Updates `state/armstate`, which maps directly onto the IAS ACE
    /// panel status values.
    fn update_arm_state_and_panel_status(&mut self, bus: &mut EventBus) {
        let current = self.ias_ace_panel_status();

        let status = match self.state {
            AsState::Disarmed => panel_status::DISARMED,
            AsState::Armed => match self.target_state {
                ArmMode::ArmedAway => panel_status::ARMED_AWAY,
                ArmMode::ArmedStay => panel_status::ARMED_STAY,
                ArmMode::ArmedNight => panel_status::ARMED_NIGHT,
                ArmMode::Disarmed => current,
            },
            AsState::Arming => match self.target_state {
                ArmMode::ArmedAway => panel_status::ARMING_AWAY,
                ArmMode::ArmedStay => panel_status::ARMING_STAY,
                ArmMode::ArmedNight => panel_status::ARMING_NIGHT,
                ArmMode::Disarmed => current,
            },
            AsState::InAlarm => panel_status::IN_ALARM,
            AsState::EntryDelay => panel_status::ENTRY_DELAY,
            AsState::ExitDelay => panel_status::EXIT_DELAY,
        };

        if status != current {
            let id = self.id_string().to_string();
            if let Some(item) = self.res.item_mut(RSTATE_ARM_STATE) {
                let num_prev = item.to_number();
                if item
                    .set_value(ItemValue::Num(i64::from(status)), ValueSource::Api)
                    .is_ok()
                {
                    bus.enqueue(
                        Event::with_id(R_ALARMSYSTEMS, RSTATE_ARM_STATE, id, i64::from(status), 0)
                            .with_num_prev(num_prev),
                    );
                }
            }
        }
    }

    /// Each arm mode has its own delays; refresh the cached values and the
    /// device alarm filter mask for the current target state.
    fn update_target_state_values(&mut self) {
        let exit_suffix = [
            RCONFIG_DISARMED_EXIT_DELAY,
            RCONFIG_ARMED_STAY_EXIT_DELAY,
            RCONFIG_ARMED_NIGHT_EXIT_DELAY,
            RCONFIG_ARMED_AWAY_EXIT_DELAY,
        ];
        let entry_suffix = [
            RCONFIG_DISARMED_ENTRY_DELAY,
            RCONFIG_ARMED_STAY_ENTRY_DELAY,
            RCONFIG_ARMED_NIGHT_ENTRY_DELAY,
            RCONFIG_ARMED_AWAY_ENTRY_DELAY,
        ];
        // the trigger duration is mode specific; disarmed has none
        let trigger_suffix = [
            "",
            RCONFIG_ARMED_STAY_TRIGGER_DURATION,
            RCONFIG_ARMED_NIGHT_TRIGGER_DURATION,
            RCONFIG_ARMED_AWAY_TRIGGER_DURATION,
        ];

        let idx = self.target_state as usize;
        self.exit_delay = self.res.to_number(exit_suffix[idx]);
        self.entry_delay = self.res.to_number(entry_suffix[idx]);
        self.trigger_duration = if idx > 0 { self.res.to_number(trigger_suffix[idx]) } else { 0 };
        self.arm_mask = TARGET_ARM_MASK[idx];
    }

    /// Publishes the countdown for states which have a duration.
    fn set_seconds_remaining(&mut self, secs: i64, bus: &mut EventBus) {
        debug_assert!(secs <= i64::from(u8::MAX));
        if secs > i64::from(u8::MAX) {
            return;
        }

        let id = self.id_string().to_string();
        let Some(item) = self.res.item_mut(RSTATE_SECONDS_REMAINING) else {
            return;
        };

        if item.to_number() != secs {
            let num_prev = item.to_number();
            if item.set_value(ItemValue::Num(secs), ValueSource::Api).is_ok() {
                bus.enqueue(
                    Event::with_id(R_ALARMSYSTEMS, RSTATE_SECONDS_REMAINING, id, secs, 0)
                        .with_num_prev(num_prev),
                );
            }
        }
    }
}

/// Owner of all alarm system partitions (ids 1..4).
#[derive(Default)]
pub struct AlarmSystems {
    pub systems: Vec<AlarmSystem>,
}

impl AlarmSystems {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: AlarmSystemId) -> Option<&AlarmSystem> {
        self.systems.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: AlarmSystemId) -> Option<&mut AlarmSystem> {
        self.systems.iter_mut().find(|s| s.id() == id)
    }

    /// The alarm system the device with \p ext_address belongs to.
    pub fn get_for_device_mut(
        &mut self,
        ext_address: u64,
        dev_table: &DeviceTable,
    ) -> Option<&mut AlarmSystem> {
        let entry = dev_table.get_by_ext(ext_address);
        if !entry.is_valid() {
            return None;
        }
        self.get_mut(AlarmSystemId::from(entry.alarm_system_id))
    }

    /// Drives the 1 Hz timers of all systems.
    pub fn advance(&mut self, now: SteadyTime, bus: &mut EventBus) {
        for system in &mut self.systems {
            system.advance(now, bus);
        }
    }
}

/// Hydrates alarm systems from the store; persisted resource items are
/// replayed before the machine starts.
pub fn load_alarm_systems(
    alarm_systems: &mut AlarmSystems,
    store: &dyn AlarmStore,
    bus: &mut EventBus,
    now: SteadyTime,
) {
    for id in 1..=4u32 {
        let items = store.load_alarm_system_resource_items(id);
        if items.is_empty() {
            continue;
        }

        let mut system = AlarmSystem::new(id, now);

        for record in items {
            if record.value.is_empty() {
                continue;
            }

            let Some(item) = system.resource_mut().item_mut(&record.suffix) else {
                continue;
            };

            let result = match item.descriptor().data_type {
                DataType::String => {
                    item.set_value(ItemValue::Str(record.value.clone()), ValueSource::Api)
                }
                _ => match record.value.parse::<i64>() {
                    Ok(num) => item.set_value(ItemValue::Num(num), ValueSource::Api),
                    Err(_) => continue,
                },
            };

            if result.is_err() {
                tracing::debug!("[AS] database load item {} failed", record.suffix);
            }
        }

        system.start(store, bus);
        alarm_systems.systems.push(system);
    }
}

/// Creates the "default" alarm system with id 1, which is always present.
pub fn init_default_alarm_system(
    alarm_systems: &mut AlarmSystems,
    store: &dyn AlarmStore,
    bus: &mut EventBus,
    now: SteadyTime,
) {
    if alarm_systems.get(1).is_some() {
        return;
    }

    let mut system = AlarmSystem::new(1, now);

    store.store_alarm_system(&crate::persistence::AlarmSystemRecord {
        id: 1,
        timestamp: system_now_ms(),
    });

    system.set_value(RATTR_NAME, ItemValue::Str("default".into()), bus, store);
    alarm_systems.systems.push(system);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    const UID: &str = "28:6d:97:00:01:06:41:79-01-0500";

    struct Fixture {
        system: AlarmSystem,
        bus: EventBus,
        store: MemoryStore,
        dev_table: DeviceTable,
        now: SteadyTime,
    }

    impl Fixture {
        fn new() -> Self {
            let now = SteadyTime(0);
            let mut fx = Self {
                system: AlarmSystem::new(1, now),
                bus: EventBus::new(),
                store: MemoryStore::new(),
                dev_table: DeviceTable::new(),
                now,
            };
            fx.system.start(&fx.store, &mut fx.bus);
            fx
        }

        fn configure_delays(&mut self, exit: i64, entry: i64, trigger: i64) {
            for suffix in [
                RCONFIG_ARMED_AWAY_EXIT_DELAY,
                RCONFIG_ARMED_STAY_EXIT_DELAY,
                RCONFIG_ARMED_NIGHT_EXIT_DELAY,
            ] {
                self.system.set_value(suffix, ItemValue::Num(exit), &mut self.bus, &self.store);
            }
            for suffix in [
                RCONFIG_ARMED_AWAY_ENTRY_DELAY,
                RCONFIG_ARMED_STAY_ENTRY_DELAY,
                RCONFIG_ARMED_NIGHT_ENTRY_DELAY,
            ] {
                self.system.set_value(suffix, ItemValue::Num(entry), &mut self.bus, &self.store);
            }
            for suffix in [
                RCONFIG_ARMED_AWAY_TRIGGER_DURATION,
                RCONFIG_ARMED_STAY_TRIGGER_DURATION,
                RCONFIG_ARMED_NIGHT_TRIGGER_DURATION,
            ] {
                self.system.set_value(suffix, ItemValue::Num(trigger), &mut self.bus, &self.store);
            }
            self.drain();
        }

        /// Routes pending bus events back into the system (as the global
        /// event handler does) and returns them.
        fn drain(&mut self) -> Vec<Event> {
            let mut seen = Vec::new();
            while let Some(event) = self.bus.pop() {
                self.system.handle_event(&event, &mut self.bus, self.now);
                seen.push(event);
            }
            seen
        }

        /// Advances the clock second by second, firing timers and routing
        /// events.
        fn run_seconds(&mut self, secs: i64) -> Vec<Event> {
            let mut seen = Vec::new();
            for _ in 0..secs {
                self.now = self.now + 1000;
                self.system.advance(self.now, &mut self.bus);
                seen.extend(self.drain());
            }
            seen
        }

        fn arm_away(&mut self) {
            self.system
                .set_target_arm_mode(ArmMode::ArmedAway, &mut self.bus, &self.store);
            self.drain();
        }
    }

    #[test]
    fn full_arm_away_alarm_cycle() {
        let mut fx = Fixture::new();
        fx.configure_delays(3, 2, 4);

        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::DISARMED);

        // arm away -> exit delay with the countdown published
        fx.arm_away();
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::EXIT_DELAY);
        assert_eq!(fx.system.seconds_remaining(), 3);

        // countdown decreases monotonically within the exit delay
        let events = fx.run_seconds(3);
        let countdown: Vec<i64> = events
            .iter()
            .filter(|e| e.what() == RSTATE_SECONDS_REMAINING)
            .map(Event::num)
            .collect();
        assert!(countdown.windows(2).all(|w| w[0] > w[1]), "countdown {countdown:?}");

        // exit delay elapsed -> arming -> armed
        fx.run_seconds(2);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ARMED_AWAY);

        // matching device alarm: partition 1, armed away bit
        let data = 1i64 | i64::from(entry_flags::ARMED_AWAY);
        let alarm = Event::new(R_ALARMSYSTEMS, REVENT_DEVICE_ALARM, data, 0);
        fx.system.handle_event(&alarm, &mut fx.bus, fx.now);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ENTRY_DELAY);
        assert_eq!(fx.system.seconds_remaining(), 2);

        // entry delay elapses into the alarm state
        fx.run_seconds(3);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::IN_ALARM);

        // after the trigger duration the panel returns to armed
        fx.run_seconds(5);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ARMED_AWAY);
    }

    #[test]
    fn disarm_during_exit_delay_returns_to_disarmed() {
        let mut fx = Fixture::new();
        fx.configure_delays(3, 2, 4);

        fx.arm_away();
        fx.run_seconds(1);

        fx.system
            .set_target_arm_mode(ArmMode::Disarmed, &mut fx.bus, &fx.store);
        fx.drain();
        // target change re-enters exit delay with the disarmed target
        fx.run_seconds(2);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::DISARMED);
    }

    #[test]
    fn mismatched_arm_mask_does_not_trigger() {
        let mut fx = Fixture::new();
        fx.configure_delays(1, 1, 1);
        fx.arm_away();
        fx.run_seconds(3);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ARMED_AWAY);

        // device armed only for night does not trigger away mode
        let data = 1i64 | i64::from(entry_flags::ARMED_NIGHT);
        let alarm = Event::new(R_ALARMSYSTEMS, REVENT_DEVICE_ALARM, data, 0);
        fx.system.handle_event(&alarm, &mut fx.bus, fx.now);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ARMED_AWAY);

        // wrong partition does not trigger either
        let data = 2i64 | i64::from(entry_flags::ARMED_AWAY);
        let alarm = Event::new(R_ALARMSYSTEMS, REVENT_DEVICE_ALARM, data, 0);
        fx.system.handle_event(&alarm, &mut fx.bus, fx.now);
        assert_eq!(fx.system.ias_ace_panel_status(), panel_status::ARMED_AWAY);
    }

    #[test]
    fn pin_code_lifecycle() {
        let mut fx = Fixture::new();

        // too short / too long is refused
        assert!(!fx.system.set_code(0, "123", &mut fx.bus, &fx.store));
        assert!(!fx.system.set_code(0, "01234567890123456", &mut fx.bus, &fx.store));

        assert!(fx.system.set_code(0, "12345", &mut fx.bus, &fx.store));
        assert!(fx.system.resource().to_bool(RCONFIG_CONFIGURED));

        let secret = fx.store.load_secret("as_1_code0").unwrap();
        assert!(secret.secret.starts_with("$scrypt$N=1024$r=8$p=16$"));

        assert!(fx.system.is_valid_code("12345", 0, &fx.dev_table, &fx.store));
        assert!(!fx.system.is_valid_code("54321", 0, &fx.dev_table, &fx.store));
    }

    #[test]
    fn code_from_foreign_partition_device_is_rejected() {
        let mut fx = Fixture::new();
        fx.system.set_code(0, "1234", &mut fx.bus, &fx.store);

        // the keypad is registered in partition 2
        fx.dev_table.put(UID, entry_flags::IAS_ACE, 2, &fx.store);
        let ext = gateway_core::uniqueid::ext_address_from_unique_id(UID);

        assert!(!fx.system.is_valid_code("1234", ext, &fx.dev_table, &fx.store));
        // without a source address the PIN itself decides
        assert!(fx.system.is_valid_code("1234", 0, &fx.dev_table, &fx.store));
    }

    #[test]
    fn handle_arm_maps_modes_and_errors() {
        let mut fx = Fixture::new();
        fx.system.set_code(0, "1234", &mut fx.bus, &fx.store);

        // disarming a disarmed system
        assert_eq!(
            fx.system.handle_arm(0x00, "1234", 0, &fx.dev_table, &mut fx.bus, &fx.store),
            0x06
        );

        // wrong code
        assert_eq!(
            fx.system.handle_arm(0x03, "9999", 0, &fx.dev_table, &mut fx.bus, &fx.store),
            0x04
        );

        // arm all zones
        assert_eq!(
            fx.system.handle_arm(0x03, "1234", 0, &fx.dev_table, &mut fx.bus, &fx.store),
            0x03
        );
        fx.drain();
        assert_eq!(fx.system.target_arm_mode(), ArmMode::ArmedAway);

        // invalid mode
        assert_eq!(
            fx.system.handle_arm(0x07, "1234", 0, &fx.dev_table, &mut fx.bus, &fx.store),
            0x05
        );
    }

    #[test]
    fn hydration_restores_armed_state() {
        let store = MemoryStore::new();
        let mut bus = EventBus::new();

        store.store_alarm_system_resource_item(&ResourceItemRecord {
            alarm_system_id: 2,
            suffix: RCONFIG_ARM_MODE.into(),
            value: "armed_night".into(),
            timestamp: 0,
        });
        store.store_alarm_system_resource_item(&ResourceItemRecord {
            alarm_system_id: 2,
            suffix: RCONFIG_ARMED_NIGHT_EXIT_DELAY.into(),
            value: "45".into(),
            timestamp: 0,
        });

        let mut systems = AlarmSystems::new();
        load_alarm_systems(&mut systems, &store, &mut bus, SteadyTime(0));

        let system = systems.get(2).unwrap();
        assert_eq!(system.target_arm_mode(), ArmMode::ArmedNight);
        assert_eq!(system.ias_ace_panel_status(), panel_status::ARMED_NIGHT);
        assert_eq!(system.resource().to_number(RCONFIG_ARMED_NIGHT_EXIT_DELAY), 45);
    }

    #[test]
    fn default_alarm_system_is_created_once() {
        let store = MemoryStore::new();
        let mut bus = EventBus::new();
        let mut systems = AlarmSystems::new();

        init_default_alarm_system(&mut systems, &store, &mut bus, SteadyTime(0));
        init_default_alarm_system(&mut systems, &store, &mut bus, SteadyTime(0));

        assert_eq!(systems.systems.len(), 1);
        assert_eq!(systems.get(1).unwrap().resource().to_str(RATTR_NAME), "default");
    }
}
