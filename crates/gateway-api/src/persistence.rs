//! JSON file backed alarm store
//!
//! A small single-file database for alarm system records. Every mutation
//! rewrites the file; the data set is tiny (a handful of partitions and
//! device memberships).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use alarm_system::persistence::{
    AlarmDeviceRecord, AlarmStore, AlarmSystemRecord, ResourceItemRecord, SecretRecord,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    alarm_systems: Vec<AlarmSystemRecord>,
    #[serde(default)]
    devices: Vec<AlarmDeviceRecord>,
    #[serde(default)]
    secrets: Vec<SecretRecord>,
    #[serde(default)]
    items: Vec<ResourceItemRecord>,
}

pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Opens the store, loading existing records if the file exists.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                tracing::warn!("alarm store {} unreadable: {err}", path.display());
                StoreData::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(err) => return Err(err),
        };

        Ok(Self { path, data: Mutex::new(data) })
    }

    fn save(&self, data: &StoreData) -> bool {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match serde_json::to_vec_pretty(data) {
            Ok(bytes) => match std::fs::write(&self.path, bytes) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("failed to write {}: {err}", self.path.display());
                    false
                }
            },
            Err(err) => {
                tracing::warn!("failed to serialize alarm store: {err}");
                false
            }
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreData)) -> bool {
        let Ok(mut data) = self.data.lock() else {
            return false;
        };
        f(&mut data);
        self.save(&data)
    }
}

impl AlarmStore for FileStore {
    fn store_alarm_system(&self, record: &AlarmSystemRecord) -> bool {
        self.mutate(|data| {
            data.alarm_systems.retain(|r| r.id != record.id);
            data.alarm_systems.push(record.clone());
        })
    }

    fn store_alarm_system_device(&self, record: &AlarmDeviceRecord) -> bool {
        self.mutate(|data| {
            data.devices.retain(|r| r.unique_id != record.unique_id);
            data.devices.push(record.clone());
        })
    }

    fn delete_alarm_system_device(&self, unique_id: &str) -> bool {
        let mut removed = false;
        let ok = self.mutate(|data| {
            let before = data.devices.len();
            data.devices.retain(|r| r.unique_id != unique_id);
            removed = data.devices.len() != before;
        });
        ok && removed
    }

    fn load_alarm_system_devices(&self) -> Vec<AlarmDeviceRecord> {
        self.data.lock().map(|data| data.devices.clone()).unwrap_or_default()
    }

    fn store_secret(&self, record: &SecretRecord) -> bool {
        self.mutate(|data| {
            data.secrets.retain(|r| r.unique_id != record.unique_id);
            data.secrets.push(record.clone());
        })
    }

    fn load_secret(&self, unique_id: &str) -> Option<SecretRecord> {
        self.data
            .lock()
            .ok()?
            .secrets
            .iter()
            .find(|r| r.unique_id == unique_id)
            .cloned()
    }

    fn store_alarm_system_resource_item(&self, record: &ResourceItemRecord) -> bool {
        self.mutate(|data| {
            data.items
                .retain(|r| !(r.alarm_system_id == record.alarm_system_id && r.suffix == record.suffix));
            data.items.push(record.clone());
        })
    }

    fn load_alarm_system_resource_items(&self, alarm_system_id: u32) -> Vec<ResourceItemRecord> {
        self.data
            .lock()
            .map(|data| {
                data.items
                    .iter()
                    .filter(|r| r.alarm_system_id == alarm_system_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
