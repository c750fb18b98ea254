//! Profile drivers bound to remote devices by service UUID.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
   address::{AdapterId, Address},
   error::Result,
};

/// A profile implementation that attaches to devices advertising one of its
/// UUIDs.
pub trait ProfileDriver: Send + Sync {
   fn name(&self) -> &str;

   /// Remote service UUIDs this driver handles.
   fn remote_uuids(&self) -> &[Uuid];

   /// Service UUIDs the driver publishes in the local service database.
   fn local_uuids(&self) -> &[Uuid] {
      &[]
   }

   /// Binds to `device`; `uuids` are the matching UUIDs it advertises.
   fn probe(&self, adapter: AdapterId, device: Address, uuids: &[Uuid]) -> Result<()>;

   fn remove(&self, adapter: AdapterId, device: Address);

   /// Whether the profile is carrying live traffic for `device`.
   fn is_active(&self, _adapter: AdapterId, _device: Address) -> bool {
      false
   }

   /// The device is about to be disconnected (and removed if `removal`).
   fn disconnect_requested(&self, _adapter: AdapterId, _device: Address, _removal: bool) {}

   /// The persistent LE link of `device` came up.
   fn attio_connected(&self, _adapter: AdapterId, _device: Address) {}

   fn attio_disconnected(&self, _adapter: AdapterId, _device: Address) {}
}

pub type DriverRef = Arc<dyn ProfileDriver>;

/// UUIDs in `uuids` that `driver` handles.
pub(crate) fn matching_uuids<'a>(
   driver: &dyn ProfileDriver,
   uuids: impl IntoIterator<Item = &'a Uuid>,
) -> Vec<Uuid> {
   let handled = driver.remote_uuids();
   uuids
      .into_iter()
      .filter(|uuid| handled.contains(uuid))
      .copied()
      .collect()
}

pub(crate) fn same_driver(a: &DriverRef, b: &DriverRef) -> bool {
   Arc::ptr_eq(a, b)
}
