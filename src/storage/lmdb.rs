//! Persistent store using heed (LMDB).

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::debug;

use super::{AdapterSettings, DeviceRecord, Store};
use crate::{
   address::Address,
   error::{Error, Result},
};

fn invalid_key(what: &'static str) -> heed::BoxedError {
   heed::BoxedError::from(std::io::Error::new(std::io::ErrorKind::InvalidData, what))
}

struct AdapterKeyCodec;

impl<'a> heed::BytesEncode<'a> for AdapterKeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for AdapterKeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(invalid_key("Invalid adapter address"));
      };
      Ok(Address(s))
   }
}

/// (adapter, device) packed as 12 bytes, adapter first.
struct DeviceKeyCodec;

impl<'a> heed::BytesEncode<'a> for DeviceKeyCodec {
   type EItem = (Address, Address);
   fn bytes_encode((adapter, device): &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      let mut key = Vec::with_capacity(12);
      key.extend_from_slice(&adapter.0);
      key.extend_from_slice(&device.0);
      Ok(Cow::Owned(key))
   }
}

impl<'a> heed::BytesDecode<'a> for DeviceKeyCodec {
   type DItem = (Address, Address);
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      if bytes.len() != 12 {
         return Err(invalid_key("Invalid device key"));
      }
      let (adapter, device) = bytes.split_at(6);
      let (Ok(adapter), Ok(device)) = (adapter.try_into(), device.try_into()) else {
         return Err(invalid_key("Invalid device key"));
      };
      Ok((Address(adapter), Address(device)))
   }
}

/// Database layout
#[derive(Debug)]
struct Db {
   env: Env,
   /// adapter address -> settings
   adapters: Database<AdapterKeyCodec, SerdeBincode<AdapterSettings>>,
   /// (adapter, device) -> record
   devices: Database<DeviceKeyCodec, SerdeBincode<DeviceRecord>>,
}

/// Thread-safe LMDB-backed [`Store`].
#[derive(Clone, Debug)]
pub struct LmdbStore {
   db: Arc<Db>,
}

impl LmdbStore {
   /// Opens or creates the store under the user data directory.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(16 * 1024 * 1024)
            .max_dbs(2)
            .open(path)?
      };

      let mut wtxn = env.write_txn()?;
      let adapters = env.create_database(&mut wtxn, Some("adapters"))?;
      let devices = env.create_database(&mut wtxn, Some("devices"))?;
      wtxn.commit()?;

      debug!("Opened device store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db {
            env,
            adapters,
            devices,
         }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BLUECORE_STORE_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/bluecore/store
      let base = dirs::data_local_dir().ok_or(Error::DataDirNotFound)?;
      Ok(base.join("bluecore").join("store"))
   }
}

impl Store for LmdbStore {
   fn adapter_settings(&self, adapter: Address) -> Result<Option<AdapterSettings>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self.db.adapters.get(&rtxn, &adapter)?)
   }

   fn store_adapter_settings(&self, adapter: Address, settings: &AdapterSettings) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.adapters.put(&mut wtxn, &adapter, settings)?;
      wtxn.commit()?;
      Ok(())
   }

   fn devices(&self, adapter: Address) -> Result<Vec<(Address, DeviceRecord)>> {
      let rtxn = self.db.env.read_txn()?;
      let mut devices = Vec::new();
      for entry in self.db.devices.iter(&rtxn)? {
         let ((owner, device), record) = entry?;
         if owner == adapter {
            devices.push((device, record));
         }
      }
      Ok(devices)
   }

   fn device(&self, adapter: Address, device: Address) -> Result<Option<DeviceRecord>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self.db.devices.get(&rtxn, &(adapter, device))?)
   }

   fn store_device(&self, adapter: Address, device: Address, record: &DeviceRecord) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.devices.put(&mut wtxn, &(adapter, device), record)?;
      wtxn.commit()?;
      Ok(())
   }

   fn remove_device(&self, adapter: Address, device: Address) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.devices.delete(&mut wtxn, &(adapter, device))?;
      wtxn.commit()?;
      Ok(())
   }
}
