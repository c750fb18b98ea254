//! Control-plane notifications.
//!
//! The manager describes every externally visible change as an [`Event`] and
//! hands it to an [`EventBus`]; the bus decides how (and whether) to forward it.

use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::FoundDevice,
   address::{AdapterId, Address},
};

/// The object a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
   Adapter(AdapterId),
   Device(AdapterId, Address),
}

/// Names of published properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Property {
   Powered,
   Discoverable,
   Pairable,
   DiscoverableTimeout,
   PairableTimeout,
   Discovering,
   Name,
   Class,
   Alias,
   Paired,
   Trusted,
   Blocked,
   Connected,
   #[strum(serialize = "UUIDs")]
   Uuids,
   Services,
   #[strum(serialize = "RSSI")]
   Rssi,
   AddressType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
   Bool(bool),
   U32(u32),
   I32(i32),
   Str(SmolStr),
   Uuids(Vec<Uuid>),
}

/// Events that can be emitted by the manager.
#[derive(Debug, Clone)]
pub enum Event {
   AdapterAdded(AdapterId),
   AdapterRemoved(AdapterId),
   PropertyChanged {
      object: ObjectRef,
      property: Property,
      value: Value,
   },
   DeviceFound {
      adapter: AdapterId,
      device: FoundDevice,
   },
   DeviceDisappeared {
      adapter: AdapterId,
      device: Address,
   },
   DeviceCreated {
      adapter: AdapterId,
      device: Address,
   },
   DeviceRemoved {
      adapter: AdapterId,
      device: Address,
   },
   DisconnectRequested {
      adapter: AdapterId,
      device: Address,
      removal: bool,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: Event);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
