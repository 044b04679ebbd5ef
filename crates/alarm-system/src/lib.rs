//! Alarm system subsystem
//!
//! A per-partition IAS ACE style alarm panel: arm/disarm with entry and
//! exit delays, scrypt encrypted PIN codes, a fixed-size device membership
//! table and trigger fan-in from sensor events.

pub mod alarm;
pub mod crypto;
pub mod device_table;
pub mod error;
pub mod event_handler;
pub mod ias_ace;
pub mod persistence;

pub use alarm::{
    init_default_alarm_system, load_alarm_systems, panel_status, panel_status_to_string, AlarmSystem,
    AlarmSystemId, AlarmSystems, ArmMode,
};
pub use device_table::{entry_flags, DeviceEntry, DeviceTable, AS_MAX_UNIQUEID_LENGTH};
pub use error::AlarmError;
pub use persistence::{AlarmStore, MemoryStore};
