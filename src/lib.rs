//! Bluetooth host adapter and device lifecycle manager.
//!
//! A [`Manager`] owns every local controller reported by a [`Backend`] and
//! the remote devices known to it: power and visibility sessions, discovery,
//! bonding with agent-driven authentication, service browsing, profile driver
//! binding and LE link supervision. Controller events enter through a
//! [`Dispatcher`]; externally visible changes leave through an [`EventBus`].
//! The [`dbus`] module serves the whole thing on the system bus.

pub mod address;
pub mod adapter;
pub mod agent;
pub mod auth;
pub mod backend;
mod bonding;
mod browse;
pub mod config;
pub mod dbus;
pub mod device;
pub mod dispatcher;
pub mod eir;
pub mod error;
pub mod event;
pub mod manager;
pub mod profile;
pub mod session;
pub mod storage;
mod supervisor;
mod timer;
pub mod uuids;

#[cfg(test)]
mod testutil;

pub use crate::{
   adapter::{AdapterInfo, FoundDevice, Mode, PowerState},
   address::{AdapterId, Address, AddressType},
   agent::{Agent, AgentRef},
   auth::{AgentAnswer, AuthKind},
   backend::{Backend, BackendEvent, IoCapability, Transport},
   bonding::BondingPhase,
   config::Config,
   device::DeviceInfo,
   dispatcher::Dispatcher,
   error::{Error, Result},
   event::{Event, EventBus, EventSender, ObjectRef, Property, Value},
   manager::{AdapterHandle, DeviceHandle, Manager, Services},
   profile::{DriverRef, ProfileDriver},
   session::CallerId,
   storage::{LmdbStore, MemoryStore, Store, StoreRef},
};
