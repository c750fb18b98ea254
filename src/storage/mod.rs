//! Persistence surface for adapter settings and per-device records.
//!
//! Records are keyed by (adapter address, device address). Writes replace the
//! whole record, so replaying them after a crash is harmless.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::Mode,
   address::{Address, AddressType},
   backend::{LinkKey, LongTermKey, PrimaryService, SdpRecord},
   error::Result,
};

pub mod lmdb;

pub use lmdb::LmdbStore;

/// Stored adapter properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
   pub name: Option<SmolStr>,
   pub class: Option<u32>,
   pub mode: Option<Mode>,
   pub discoverable_timeout: Option<u32>,
   pub pairable_timeout: Option<u32>,
   pub pairable: Option<bool>,
}

/// Stored state of a non-temporary remote device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
   pub address_type: AddressType,
   pub name: Option<SmolStr>,
   pub alias: Option<SmolStr>,
   pub class: u32,
   pub trusted: bool,
   pub blocked: bool,
   pub link_key: Option<LinkKey>,
   pub long_term_key: Option<LongTermKey>,
   pub uuids: Vec<Uuid>,
   pub primaries: Vec<PrimaryService>,
   pub sdp_records: Vec<SdpRecord>,
}

pub trait Store: Send + Sync {
   fn adapter_settings(&self, adapter: Address) -> Result<Option<AdapterSettings>>;

   fn store_adapter_settings(&self, adapter: Address, settings: &AdapterSettings) -> Result<()>;

   fn devices(&self, adapter: Address) -> Result<Vec<(Address, DeviceRecord)>>;

   fn device(&self, adapter: Address, device: Address) -> Result<Option<DeviceRecord>>;

   fn store_device(&self, adapter: Address, device: Address, record: &DeviceRecord) -> Result<()>;

   fn remove_device(&self, adapter: Address, device: Address) -> Result<()>;
}

/// Type alias for a shared store.
pub type StoreRef = Arc<dyn Store>;

/// Volatile store, used when nothing should survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
   adapters: Mutex<HashMap<Address, AdapterSettings>>,
   devices: Mutex<HashMap<(Address, Address), DeviceRecord>>,
}

impl MemoryStore {
   pub fn new() -> Self {
      Self::default()
   }
}

impl Store for MemoryStore {
   fn adapter_settings(&self, adapter: Address) -> Result<Option<AdapterSettings>> {
      Ok(self.adapters.lock().get(&adapter).cloned())
   }

   fn store_adapter_settings(&self, adapter: Address, settings: &AdapterSettings) -> Result<()> {
      self.adapters.lock().insert(adapter, settings.clone());
      Ok(())
   }

   fn devices(&self, adapter: Address) -> Result<Vec<(Address, DeviceRecord)>> {
      let mut devices: Vec<_> = self
         .devices
         .lock()
         .iter()
         .filter(|((a, _), _)| *a == adapter)
         .map(|((_, d), record)| (*d, record.clone()))
         .collect();
      devices.sort_by_key(|(addr, _)| *addr);
      Ok(devices)
   }

   fn device(&self, adapter: Address, device: Address) -> Result<Option<DeviceRecord>> {
      Ok(self.devices.lock().get(&(adapter, device)).cloned())
   }

   fn store_device(&self, adapter: Address, device: Address, record: &DeviceRecord) -> Result<()> {
      self.devices.lock().insert((adapter, device), record.clone());
      Ok(())
   }

   fn remove_device(&self, adapter: Address, device: Address) -> Result<()> {
      self.devices.lock().remove(&(adapter, device));
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const OTHER_ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);
   const DEVICE: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   #[test]
   fn test_memory_store_scopes_by_adapter() -> Result<()> {
      let store = MemoryStore::new();
      let record = DeviceRecord {
         name: Some(SmolStr::new_static("Headset")),
         trusted: true,
         ..Default::default()
      };
      store.store_device(ADAPTER, DEVICE, &record)?;

      assert_eq!(store.devices(ADAPTER)?, vec![(DEVICE, record.clone())]);
      assert!(store.devices(OTHER_ADAPTER)?.is_empty());
      assert_eq!(store.device(ADAPTER, DEVICE)?, Some(record));

      store.remove_device(ADAPTER, DEVICE)?;
      assert_eq!(store.device(ADAPTER, DEVICE)?, None);
      Ok(())
   }
}
