//! Persistence boundary
//!
//! The database itself is an external collaborator; the alarm system only
//! sees this narrow record-oriented trait. A memory-backed implementation
//! is provided for tests and as a building block for file stores.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSystemRecord {
    pub id: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDeviceRecord {
    pub unique_id: String,
    pub alarm_system_id: u8,
    pub flags: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub unique_id: String,
    pub secret: String,
    pub state: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceItemRecord {
    pub alarm_system_id: u32,
    pub suffix: String,
    pub value: String,
    pub timestamp: i64,
}

/// Storage operations the alarm system depends on.
pub trait AlarmStore: Send {
    fn store_alarm_system(&self, record: &AlarmSystemRecord) -> bool;
    fn store_alarm_system_device(&self, record: &AlarmDeviceRecord) -> bool;
    fn delete_alarm_system_device(&self, unique_id: &str) -> bool;
    fn load_alarm_system_devices(&self) -> Vec<AlarmDeviceRecord>;
    fn store_secret(&self, record: &SecretRecord) -> bool;
    fn load_secret(&self, unique_id: &str) -> Option<SecretRecord>;
    fn store_alarm_system_resource_item(&self, record: &ResourceItemRecord) -> bool;
    fn load_alarm_system_resource_items(&self, alarm_system_id: u32) -> Vec<ResourceItemRecord>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    alarm_systems: HashMap<u32, AlarmSystemRecord>,
    devices: HashMap<String, AlarmDeviceRecord>,
    secrets: HashMap<String, SecretRecord>,
    items: HashMap<(u32, String), ResourceItemRecord>,
}

/// In-memory store; interior mutability so it can be shared read-mostly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmStore for MemoryStore {
    fn store_alarm_system(&self, record: &AlarmSystemRecord) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.alarm_systems.insert(record.id, record.clone());
        true
    }

    fn store_alarm_system_device(&self, record: &AlarmDeviceRecord) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.devices.insert(record.unique_id.clone(), record.clone());
        true
    }

    fn delete_alarm_system_device(&self, unique_id: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.devices.remove(unique_id).is_some()
    }

    fn load_alarm_system_devices(&self) -> Vec<AlarmDeviceRecord> {
        self.inner
            .lock()
            .map(|inner| inner.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    fn store_secret(&self, record: &SecretRecord) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.secrets.insert(record.unique_id.clone(), record.clone());
        true
    }

    fn load_secret(&self, unique_id: &str) -> Option<SecretRecord> {
        self.inner.lock().ok()?.secrets.get(unique_id).cloned()
    }

    fn store_alarm_system_resource_item(&self, record: &ResourceItemRecord) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner
            .items
            .insert((record.alarm_system_id, record.suffix.clone()), record.clone());
        true
    }

    fn load_alarm_system_resource_items(&self, alarm_system_id: u32) -> Vec<ResourceItemRecord> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .items
                    .values()
                    .filter(|r| r.alarm_system_id == alarm_system_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
