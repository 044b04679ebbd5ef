//! Device tick scheduler
//!
//! Paces `poll` and `awake` events across devices. During normal idle
//! operation every second one reachable device is polled, round robin.
//! While permit join is enabled freshly announced devices are serviced
//! exclusively and quickly so interviews finish fast; after permit join is
//! disabled the fast path lingers for a grace period to let running
//! interviews complete.

use crate::clock::SteadyTime;
use crate::device::DeviceContainer;
use crate::event::{
    Event, REVENT_AWAKE, REVENT_DEVICE_ANNOUNCE, REVENT_PERMIT_JOIN_DISABLED,
    REVENT_PERMIT_JOIN_ENABLED, REVENT_POLL, REVENT_POLL_DONE,
};
use crate::event_bus::EventBus;
use crate::resource::{DeviceKey, R_DEVICES};

const BOOT_TIME_MS: i64 = 8000;
const TICK_INTERVAL_JOIN_MS: i64 = 500;
const TICK_INTERVAL_IDLE_MS: i64 = 1000;
const TICK_INTERVAL_IDLE_OTAU_MS: i64 = 6000;
const TICK_INTERVAL_POLL_TIMEOUT_MS: i64 = 10_000;
const JOIN_GRACE_MS: i64 = 20_000;

/// Unconfirmed APS requests above this suppress polling.
const MAX_POLL_APS_REQUESTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickState {
    Init,
    Idle,
    Poll,
    Join,
}

#[derive(Debug, Clone, Copy)]
struct JoinDevice {
    device_key: DeviceKey,
    mac_capabilities: u8,
}

pub struct DeviceTick {
    state: TickState,
    join_devices: Vec<JoinDevice>,
    join_disabled_time: Option<SteadyTime>,
    dev_iter: usize,
    timer: Option<SteadyTime>,
    cur_device_key: DeviceKey,
    otau_busy: bool,
}

impl DeviceTick {
    #[must_use]
    pub fn new(now: SteadyTime) -> Self {
        Self {
            state: TickState::Init,
            join_devices: Vec::new(),
            join_disabled_time: None,
            dev_iter: 0,
            timer: Some(now + BOOT_TIME_MS),
            cur_device_key: 0,
            otau_busy: false,
        }
    }

    /// Slows idle polling down while an OTA update runs.
    pub fn set_otau_busy(&mut self, busy: bool) {
        self.otau_busy = busy;
    }

    /// Handles bus events relevant for the scheduler.
    pub fn handle_event(
        &mut self,
        event: &Event,
        devices: &DeviceContainer,
        bus: &mut EventBus,
        aps_unconfirmed: usize,
        now: SteadyTime,
    ) {
        match self.state {
            TickState::Init => {}
            TickState::Idle | TickState::Poll => {
                if event.what() == REVENT_PERMIT_JOIN_ENABLED {
                    self.set_state(TickState::Join, now);
                } else if self.state == TickState::Poll
                    && event.resource() == R_DEVICES
                    && event.what() == REVENT_POLL_DONE
                {
                    tracing::trace!("DEV Tick: poll done {:#018x}", self.cur_device_key);
                    self.set_state(TickState::Idle, now);
                }
            }
            TickState::Join => {
                if event.what() == REVENT_PERMIT_JOIN_DISABLED {
                    self.join_disabled_time = Some(now);
                } else if event.what() == REVENT_DEVICE_ANNOUNCE {
                    self.register_joining_device(event.device_key(), event.num() as u8);
                }
            }
        }

        let _ = (devices, bus, aps_unconfirmed);
    }

    /// Advances the internal timer; emits poll/awake events when due.
    pub fn advance(
        &mut self,
        devices: &DeviceContainer,
        bus: &mut EventBus,
        aps_unconfirmed: usize,
        now: SteadyTime,
    ) {
        let Some(deadline) = self.timer else {
            return;
        };
        if now < deadline {
            return;
        }
        self.timer = None;

        match self.state {
            TickState::Init => {
                tracing::debug!("DEV Tick.Init: booted");
                self.set_state(TickState::Idle, now);
            }
            TickState::Idle => {
                let timeout = if self.otau_busy {
                    TICK_INTERVAL_IDLE_OTAU_MS
                } else {
                    TICK_INTERVAL_IDLE_MS
                };

                if aps_unconfirmed < MAX_POLL_APS_REQUESTS
                    && self.poll_next_idle_device(devices, bus, now)
                {
                    self.set_state(TickState::Poll, now);
                    return;
                }
                self.timer = Some(now + timeout);
            }
            TickState::Poll => {
                // poll timeout, return to idle pacing
                self.set_state(TickState::Idle, now);
            }
            TickState::Join => {
                if let Some(disabled) = self.join_disabled_time {
                    if now.elapsed_since(disabled) > JOIN_GRACE_MS {
                        // leave after the grace delay so fast polling can
                        // finish even when permit join toggled off early
                        self.set_state(TickState::Idle, now);
                        return;
                    }
                }

                self.poll_next_joining_device(bus);
                self.timer = Some(now + TICK_INTERVAL_JOIN_MS);
            }
        }
    }

    fn set_state(&mut self, state: TickState, now: SteadyTime) {
        if self.state == state {
            return;
        }

        // leave
        match self.state {
            TickState::Join => {
                self.timer = None;
                self.join_devices.clear();
            }
            _ => {
                self.timer = None;
            }
        }

        self.state = state;

        // enter
        match self.state {
            TickState::Init => {}
            TickState::Idle => {
                self.timer = Some(now + TICK_INTERVAL_IDLE_MS);
            }
            TickState::Poll => {
                tracing::trace!("DEV Tick: poll enter {:#018x}", self.cur_device_key);
                self.timer = Some(now + TICK_INTERVAL_POLL_TIMEOUT_MS);
            }
            TickState::Join => {
                self.join_disabled_time = None;
                self.timer = Some(now + TICK_INTERVAL_JOIN_MS);
            }
        }
    }

    /// Emits `poll` to the next reachable device. Unreachable devices are
    /// skipped without burning the tick window, which naturally biases
    /// bandwidth to responsive devices.
    fn poll_next_idle_device(
        &mut self,
        devices: &DeviceContainer,
        bus: &mut EventBus,
        now: SteadyTime,
    ) -> bool {
        let count = devices.len();
        if count == 0 {
            return false;
        }

        for _ in 0..count {
            self.dev_iter %= count;
            let device = &devices[self.dev_iter];
            self.dev_iter += 1;

            if device.reachable(now) {
                self.cur_device_key = device.key();
                bus.enqueue(Event::new(R_DEVICES, REVENT_POLL, 0, device.key()));
                return true;
            }
        }

        false
    }

    fn register_joining_device(&mut self, device_key: DeviceKey, mac_capabilities: u8) {
        debug_assert!(device_key != 0);

        if self.join_devices.iter().any(|d| d.device_key == device_key) {
            return;
        }

        self.join_devices.push(JoinDevice { device_key, mac_capabilities });
        tracing::debug!(
            "DEV Tick: fast poll {:#018x}, mac capabilities: {:#04x}",
            device_key,
            mac_capabilities
        );
    }

    fn poll_next_joining_device(&mut self, bus: &mut EventBus) {
        if self.join_devices.is_empty() {
            return;
        }

        self.dev_iter %= self.join_devices.len();
        let device = self.join_devices[self.dev_iter];
        bus.enqueue(Event::new(R_DEVICES, REVENT_AWAKE, 0, device.device_key));
        self.dev_iter += 1;
    }
}
