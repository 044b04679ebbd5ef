//! Alarm system device table
//!
//! Fixed-size entries mapping a device unique id onto a partition and an
//! arm mask. The entry is deliberately 64 bytes so a scan touches one
//! cache line per device; the table is a contiguous vector.

use gateway_core::uniqueid::ext_address_from_unique_id;
use gateway_core::system_now_ms;

use crate::persistence::{AlarmDeviceRecord, AlarmStore};

/// `28:6d:97:00:01:06:41:79-01-0500` is 31 characters.
pub const AS_MAX_UNIQUEID_LENGTH: usize = 31;

pub mod entry_flags {
    pub const ARMED_AWAY: u32 = 0x0000_0100;
    pub const ARMED_STAY: u32 = 0x0000_0200;
    pub const ARMED_NIGHT: u32 = 0x0000_0400;
    /// The device is an IAS ACE keypad/keyfob which may arm and disarm.
    pub const IAS_ACE: u32 = 0x0000_0008;

    pub const ARM_MASK: u32 = ARMED_AWAY | ARMED_STAY | ARMED_NIGHT;
}

/// One device membership record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DeviceEntry {
    unique_id: [u8; AS_MAX_UNIQUEID_LENGTH + 1],
    pub ext_address: u64,
    pub flags: u32,
    unique_id_size: u8,
    pub alarm_system_id: u8,
    arm_mask: [u8; 4],
    padding: [u8; 14],
}

const _: () = assert!(std::mem::size_of::<DeviceEntry>() == 64);

impl Default for DeviceEntry {
    fn default() -> Self {
        Self {
            unique_id: [0; AS_MAX_UNIQUEID_LENGTH + 1],
            ext_address: 0,
            flags: 0,
            unique_id_size: 0,
            alarm_system_id: 0,
            arm_mask: [0; 4],
            padding: [0; 14],
        }
    }
}

impl DeviceEntry {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.unique_id[0] != 0
            && self.unique_id_size > 0
            && self.alarm_system_id > 0
            && self.ext_address != 0
    }

    #[must_use]
    pub fn unique_id(&self) -> &str {
        std::str::from_utf8(&self.unique_id[..usize::from(self.unique_id_size)]).unwrap_or("")
    }

    /// Human readable arm mask, a combination of "A", "S" and "N".
    #[must_use]
    pub fn arm_mask_string(&self) -> &str {
        let len = self.arm_mask.iter().position(|b| *b == 0).unwrap_or(self.arm_mask.len());
        std::str::from_utf8(&self.arm_mask[..len]).unwrap_or("")
    }

    fn init_arm_mask(&mut self) {
        self.arm_mask = [0; 4];
        let mut i = 0;
        if self.flags & entry_flags::ARMED_AWAY != 0 {
            self.arm_mask[i] = b'A';
            i += 1;
        }
        if self.flags & entry_flags::ARMED_STAY != 0 {
            self.arm_mask[i] = b'S';
            i += 1;
        }
        if self.flags & entry_flags::ARMED_NIGHT != 0 {
            self.arm_mask[i] = b'N';
        }
    }
}

/// The table of all alarm system device memberships.
#[derive(Debug, Default)]
pub struct DeviceTable {
    invalid: DeviceEntry,
    table: Vec<DeviceEntry>,
}

impl DeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, unique_id: &str) -> &DeviceEntry {
        self.get_by_ext(ext_address_from_unique_id(unique_id))
    }

    #[must_use]
    pub fn get_by_ext(&self, ext_address: u64) -> &DeviceEntry {
        if ext_address == 0 {
            return &self.invalid;
        }
        self.table
            .iter()
            .find(|e| e.ext_address == ext_address)
            .unwrap_or(&self.invalid)
    }

    #[must_use]
    pub fn at(&self, index: usize) -> &DeviceEntry {
        self.table.get(index).unwrap_or(&self.invalid)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Creates or updates the entry for \p unique_id and persists it.
    pub fn put(
        &mut self,
        unique_id: &str,
        flags: u32,
        alarm_system_id: u8,
        store: &dyn AlarmStore,
    ) -> bool {
        let ext_address = ext_address_from_unique_id(unique_id);
        if ext_address == 0 {
            return false;
        }

        if let Some(entry) = self.table.iter_mut().find(|e| e.ext_address == ext_address) {
            if entry.flags != flags || entry.alarm_system_id != alarm_system_id {
                entry.flags = flags;
                entry.alarm_system_id = alarm_system_id;
                entry.init_arm_mask();
                store_device_entry(entry, store);
            }
            return true;
        }

        if unique_id.len() > AS_MAX_UNIQUEID_LENGTH {
            return false;
        }

        let mut entry = DeviceEntry::default();
        entry.unique_id_size = unique_id.len() as u8;
        entry.unique_id[..unique_id.len()].copy_from_slice(unique_id.as_bytes());
        entry.ext_address = ext_address;
        entry.alarm_system_id = alarm_system_id;
        entry.flags = flags;
        entry.init_arm_mask();

        store_device_entry(&entry, store);
        self.table.push(entry);
        true
    }

    /// Removes the entry for \p unique_id: the store delete must succeed
    /// first, then the entry is swap-removed.
    pub fn erase(&mut self, unique_id: &str, store: &dyn AlarmStore) -> bool {
        let ext_address = ext_address_from_unique_id(unique_id);
        let Some(pos) = self.table.iter().position(|e| e.ext_address == ext_address) else {
            return false;
        };

        if !store.delete_alarm_system_device(self.table[pos].unique_id()) {
            return false;
        }

        self.table.swap_remove(pos);
        true
    }

    /// Replaces the whole table (database hydration).
    pub fn reset(&mut self, table: Vec<DeviceEntry>) {
        self.table = table;
    }
}

fn store_device_entry(entry: &DeviceEntry, store: &dyn AlarmStore) -> bool {
    debug_assert!(!entry.unique_id().is_empty());
    if entry.unique_id().is_empty() {
        return false;
    }

    store.store_alarm_system_device(&AlarmDeviceRecord {
        unique_id: entry.unique_id().to_string(),
        alarm_system_id: entry.alarm_system_id,
        flags: entry.flags,
        timestamp: system_now_ms(),
    })
}

/// Hydrates \p table from the store.
pub fn load_device_table(table: &mut DeviceTable, store: &dyn AlarmStore) {
    let records = store.load_alarm_system_devices();
    if records.is_empty() {
        return;
    }

    let mut entries = Vec::with_capacity(records.len());

    for record in records {
        if record.unique_id.len() > AS_MAX_UNIQUEID_LENGTH {
            continue;
        }

        let mut entry = DeviceEntry::default();
        entry.ext_address = ext_address_from_unique_id(&record.unique_id);
        entry.alarm_system_id = record.alarm_system_id;
        entry.unique_id_size = record.unique_id.len() as u8;
        entry.unique_id[..record.unique_id.len()].copy_from_slice(record.unique_id.as_bytes());
        entry.flags = record.flags;
        entry.init_arm_mask();
        entries.push(entry);
    }

    table.reset(entries);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    const UID: &str = "28:6d:97:00:01:06:41:79-01-0500";

    #[test]
    fn entry_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<DeviceEntry>(), 64);
    }

    #[test]
    fn put_get_erase_roundtrip() {
        let store = MemoryStore::new();
        let mut table = DeviceTable::new();

        assert!(table.put(UID, entry_flags::ARMED_AWAY | entry_flags::ARMED_STAY, 1, &store));
        assert_eq!(table.size(), 1);

        let entry = table.get(UID);
        assert!(entry.is_valid());
        assert_eq!(entry.unique_id(), UID);
        assert_eq!(entry.alarm_system_id, 1);
        assert_eq!(entry.arm_mask_string(), "AS");
        assert_eq!(entry.ext_address, 0x286d_9700_0106_4179);

        // lookup by extended address works too
        assert!(table.get_by_ext(0x286d_9700_0106_4179).is_valid());

        assert!(table.erase(UID, &store));
        assert_eq!(table.size(), 0);
        assert!(!table.get(UID).is_valid());
        assert!(store.load_alarm_system_devices().is_empty());
    }

    #[test]
    fn put_updates_existing_entry() {
        let store = MemoryStore::new();
        let mut table = DeviceTable::new();

        table.put(UID, entry_flags::ARMED_AWAY, 1, &store);
        table.put(UID, entry_flags::ARMED_NIGHT, 2, &store);

        assert_eq!(table.size(), 1);
        let entry = table.get(UID);
        assert_eq!(entry.alarm_system_id, 2);
        assert_eq!(entry.arm_mask_string(), "N");
    }

    #[test]
    fn invalid_unique_id_is_rejected() {
        let store = MemoryStore::new();
        let mut table = DeviceTable::new();
        assert!(!table.put("not-a-mac", 0, 1, &store));
        assert!(!table.put("", 0, 1, &store));
    }

    #[test]
    fn hydrate_from_store() {
        let store = MemoryStore::new();
        let mut table = DeviceTable::new();
        table.put(UID, entry_flags::ARMED_AWAY | entry_flags::IAS_ACE, 1, &store);

        let mut fresh = DeviceTable::new();
        load_device_table(&mut fresh, &store);
        assert_eq!(fresh.size(), 1);
        assert_eq!(fresh.get(UID).flags, entry_flags::ARMED_AWAY | entry_flags::IAS_ACE);
    }
}
