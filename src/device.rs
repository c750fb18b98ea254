//! Remote devices.
//!
//! A [`Device`] lives in its adapter's registry and holds at most one bonding,
//! browse and authentication request at a time. Operations that need the
//! adapter (discovery suspension, deferred removal) are implemented on
//! [`Adapter`] and look the device up by address.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::Adapter,
   address::{AdapterId, Address, AddressType},
   auth::AuthRequest,
   backend::{AttLink, LinkKey, LongTermKey, PrimaryService, SdpRecord},
   bonding::{BondingPhase, BondingRequest},
   browse::{BrowseOrigin, BrowseRequest},
   error::{Error, Result},
   event::{Event, Property, Value},
   manager::{Context, DeviceRequest, Reply, answer},
   profile::{DriverRef, matching_uuids, same_driver},
   session::CallerId,
   storage::DeviceRecord,
   supervisor::LinkSupervisor,
   timer::{Timer, TimerTarget, take_fired},
};

/// Snapshot of device properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
   pub address: Address,
   pub address_type: AddressType,
   pub name: Option<SmolStr>,
   /// Alias, falling back to the name and then the address.
   pub alias: SmolStr,
   pub class: u32,
   pub paired: bool,
   pub trusted: bool,
   pub blocked: bool,
   pub connected: bool,
   pub temporary: bool,
   pub rssi: Option<i8>,
   pub uuids: Vec<Uuid>,
   pub primaries: Vec<PrimaryService>,
   pub bonding: Option<BondingPhase>,
   pub browsing: bool,
   pub auto_connect: bool,
   pub reconnect_attempts: u32,
}

impl DeviceInfo {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.to_string(),
         "address_type": self.address_type.to_string(),
         "name": self.name.as_deref(),
         "alias": self.alias.as_str(),
         "class": self.class,
         "paired": self.paired,
         "trusted": self.trusted,
         "blocked": self.blocked,
         "connected": self.connected,
         "rssi": self.rssi,
         "uuids": self.uuids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
      })
   }
}

/// Disconnect waiting out its grace period, or for the link to drop.
pub(crate) struct PendingDisconnect {
   timer: Option<Timer>,
   waiters: Vec<Reply<()>>,
   /// The device goes away once the link is down.
   removal: bool,
}

pub(crate) struct Device {
   pub(crate) address: Address,
   pub(crate) address_type: AddressType,
   pub(crate) name: Option<SmolStr>,
   pub(crate) alias: Option<SmolStr>,
   pub(crate) class: u32,
   pub(crate) paired: bool,
   pub(crate) bonded: bool,
   pub(crate) trusted: bool,
   pub(crate) blocked: bool,
   /// Not persisted; removed once unused.
   pub(crate) temporary: bool,
   pub(crate) connected: bool,
   pub(crate) rssi: Option<i8>,
   pub(crate) uuids: BTreeSet<Uuid>,
   pub(crate) primaries: Vec<PrimaryService>,
   pub(crate) sdp_records: Vec<SdpRecord>,
   pub(crate) link_key: Option<LinkKey>,
   pub(crate) long_term_key: Option<LongTermKey>,
   pub(crate) bonding: Option<BondingRequest>,
   pub(crate) browse: Option<BrowseRequest>,
   pub(crate) auth: Option<AuthRequest>,
   pub(crate) att: Option<AttLink>,
   pub(crate) supervisor: LinkSupervisor,
   pub(crate) drivers: Vec<DriverRef>,
   pub(crate) disconnect: Option<PendingDisconnect>,
   pub(crate) reverse_discovery: Option<Timer>,
}

impl Device {
   pub(crate) fn new(address: Address, address_type: AddressType) -> Self {
      Self {
         address,
         address_type,
         name: None,
         alias: None,
         class: 0,
         paired: false,
         bonded: false,
         trusted: false,
         blocked: false,
         temporary: true,
         connected: false,
         rssi: None,
         uuids: BTreeSet::new(),
         primaries: Vec::new(),
         sdp_records: Vec::new(),
         link_key: None,
         long_term_key: None,
         bonding: None,
         browse: None,
         auth: None,
         att: None,
         supervisor: LinkSupervisor::default(),
         drivers: Vec::new(),
         disconnect: None,
         reverse_discovery: None,
      }
   }

   pub(crate) fn from_record(address: Address, record: DeviceRecord) -> Self {
      let bonded = record.link_key.is_some() || record.long_term_key.is_some();
      Self {
         name: record.name,
         alias: record.alias,
         class: record.class,
         paired: bonded,
         bonded,
         trusted: record.trusted,
         blocked: record.blocked,
         temporary: false,
         uuids: record.uuids.into_iter().collect(),
         primaries: record.primaries,
         sdp_records: record.sdp_records,
         link_key: record.link_key,
         long_term_key: record.long_term_key,
         ..Self::new(address, record.address_type)
      }
   }

   pub(crate) fn to_record(&self) -> DeviceRecord {
      DeviceRecord {
         address_type: self.address_type,
         name: self.name.clone(),
         alias: self.alias.clone(),
         class: self.class,
         trusted: self.trusted,
         blocked: self.blocked,
         link_key: self.link_key,
         long_term_key: self.long_term_key,
         uuids: self.uuids.iter().copied().collect(),
         primaries: self.primaries.clone(),
         sdp_records: self.sdp_records.clone(),
      }
   }

   pub(crate) fn info(&self) -> DeviceInfo {
      DeviceInfo {
         address: self.address,
         address_type: self.address_type,
         name: self.name.clone(),
         alias: self.display_alias(),
         class: self.class,
         paired: self.paired,
         trusted: self.trusted,
         blocked: self.blocked,
         connected: self.connected,
         temporary: self.temporary,
         rssi: self.rssi,
         uuids: self.uuids.iter().copied().collect(),
         primaries: self.primaries.clone(),
         bonding: self.bonding.as_ref().map(|b| b.phase),
         browsing: self.browse.is_some(),
         auto_connect: self.supervisor.auto_connect,
         reconnect_attempts: self.supervisor.attempts,
      }
   }

   fn display_alias(&self) -> SmolStr {
      self
         .alias
         .clone()
         .or_else(|| self.name.clone())
         .unwrap_or_else(|| SmolStr::new(self.address.to_string()))
   }

   /// Nothing holds the device alive.
   pub(crate) fn is_idle(&self) -> bool {
      !self.connected && self.bonding.is_none() && self.browse.is_none() && self.att.is_none()
   }

   /// Binds every unbound driver handling one of `uuids`.
   pub(crate) fn probe_drivers(&mut self, ctx: &Context, adapter: AdapterId, uuids: &[Uuid]) {
      if self.blocked {
         return;
      }
      for driver in &ctx.drivers {
         if self.drivers.iter().any(|d| same_driver(d, driver)) {
            continue;
         }
         let matching = matching_uuids(driver.as_ref(), uuids);
         if matching.is_empty() {
            continue;
         }
         match driver.probe(adapter, self.address, &matching) {
            Ok(()) => {
               debug!("{}: bound {}", self.address, driver.name());
               self.drivers.push(driver.clone());
            },
            Err(e) => warn!("{}: {} probe failed: {e}", self.address, driver.name()),
         }
      }
   }

   /// Unbinds drivers that no longer match any service of the device.
   fn remove_stale_drivers(&mut self, adapter: AdapterId) {
      let address = self.address;
      let uuids = &self.uuids;
      self.drivers.retain(|driver| {
         let keep = driver.remote_uuids().iter().any(|u| uuids.contains(u));
         if !keep {
            debug!("{address}: unbinding {}", driver.name());
            driver.remove(adapter, address);
         }
         keep
      });
   }

   pub(crate) fn remove_drivers(&mut self, adapter: AdapterId) {
      for driver in self.drivers.drain(..) {
         driver.remove(adapter, self.address);
      }
   }

   /// Replaces the service set with `reported`, probing drivers for new
   /// UUIDs and unbinding drivers whose UUIDs went away.
   ///
   /// Removed UUIDs are kept when configured as never-remove, or when they
   /// belong to an audio profile whose driver is in active use.
   pub(crate) fn update_services(
      &mut self,
      ctx: &Context,
      adapter: AdapterId,
      reported: &BTreeSet<Uuid>,
   ) -> bool {
      let removed: Vec<Uuid> = self
         .uuids
         .difference(reported)
         .filter(|uuid| {
            if ctx.config.never_remove(uuid) {
               debug!("{}: keeping {uuid}, configured as never-remove", self.address);
               return false;
            }
            let active = ctx.config.is_audio_profile(uuid)
               && self.drivers.iter().any(|d| {
                  d.remote_uuids().contains(uuid) && d.is_active(adapter, self.address)
               });
            if active {
               debug!("{}: keeping {uuid}, profile in use", self.address);
            }
            !active
         })
         .copied()
         .collect();
      let added: Vec<Uuid> = reported.difference(&self.uuids).copied().collect();
      if removed.is_empty() && added.is_empty() {
         return false;
      }

      for uuid in &removed {
         self.uuids.remove(uuid);
      }
      self.uuids.extend(added.iter().copied());
      if !removed.is_empty() {
         self.remove_stale_drivers(adapter);
      }
      if !added.is_empty() {
         self.probe_drivers(ctx, adapter, &added);
      }

      ctx.device_changed(
         adapter,
         self.address,
         Property::Uuids,
         Value::Uuids(self.uuids.iter().copied().collect()),
      );
      true
   }

   /// Drops the ATT link, telling attio users it went away.
   pub(crate) fn release_att(&mut self, ctx: &Context, adapter: AdapterId) {
      let Some(link) = self.att.take() else {
         return;
      };
      ctx.transport.att_disconnect(link);
      if !self.supervisor.attio.is_empty() {
         for driver in &self.drivers {
            driver.attio_disconnected(adapter, self.address);
         }
      }
   }

   /// Fails every in-flight request and releases links and timers.
   pub(crate) fn teardown(&mut self, ctx: &Context, adapter: AdapterId, err: Error) {
      if let Some(browse) = self.browse.take() {
         browse.origin.fail(err.clone());
      }
      if let Some(bonding) = self.bonding.take() {
         bonding.fail(err);
      }
      if let Some(auth) = self.auth.take() {
         auth.agent.cancel();
      }
      self.supervisor.disable();
      self.release_att(ctx, adapter);
      self.reverse_discovery = None;
      if let Some(pending) = self.disconnect.take() {
         for reply in pending.waiters {
            answer(reply, Ok(()));
         }
      }
   }
}

impl Adapter {
   /// Returns the device, creating a temporary one if it is unknown.
   pub(crate) fn ensure_device(
      &mut self,
      ctx: &Context,
      address: Address,
      address_type: AddressType,
   ) -> &mut Device {
      let id = self.id;
      let device = self.devices.entry(address).or_insert_with(|| {
         debug!("{id}: creating device {address}");
         ctx.emit(Event::DeviceCreated {
            adapter: id,
            device: address,
         });
         Device::new(address, address_type)
      });
      if device.address_type != address_type {
         debug!("{id}: {address} address type is {address_type}");
         device.address_type = address_type;
      }
      device
   }

   /// Persists `address` unless it is temporary.
   pub(crate) fn store_device(&self, ctx: &Context, address: Address) {
      let Some(device) = self.devices.get(&address) else {
         return;
      };
      if device.temporary {
         return;
      }
      if let Err(e) = ctx
         .store
         .store_device(self.address, address, &device.to_record())
      {
         warn!("{}: failed to store {address}: {e}", self.id);
      }
   }

   /// Makes a device persistent.
   pub(crate) fn keep_device(&mut self, ctx: &Context, address: Address) {
      if let Some(device) = self.devices.get_mut(&address)
         && device.temporary
      {
         device.temporary = false;
         self.store_device(ctx, address);
      }
   }

   pub(crate) fn create_device(
      &mut self,
      ctx: &Context,
      caller: CallerId,
      address: Address,
      reply: Reply<()>,
   ) {
      if let Err(e) = self.require_powered() {
         answer(reply, Err(e));
         return;
      }
      if self.devices.contains_key(&address) {
         answer(reply, Err(Error::AlreadyExists));
         return;
      }

      let address_type = self.found_address_type(address);
      info!("{}: {caller} creating {address}", self.id);
      self.ensure_device(ctx, address, address_type);
      self.start_browse(
         ctx,
         address,
         None,
         BrowseOrigin::CreateDevice(caller, reply),
      );
   }

   pub(crate) fn remove_device(&mut self, ctx: &Context, address: Address) -> Result<()> {
      let Some(device) = self.devices.get_mut(&address) else {
         return Err(Error::DoesNotExist);
      };
      info!("{}: removing {address}", self.id);
      let paired = device.paired;
      device.temporary = true;
      if let Err(e) = ctx.store.remove_device(self.address, address) {
         warn!("{}: failed to forget {address}: {e}", self.id);
      }
      if paired && let Err(e) = ctx.backend.remove_bonding(self.id, address) {
         warn!("{}: failed to remove bonding of {address}: {e}", self.id);
      }

      self.abort_bonding(ctx, address, Error::Canceled);
      self.cancel_browse(ctx, address, Error::Canceled);

      let connected = self
         .devices
         .get(&address)
         .is_some_and(|d| d.connected || d.att.is_some());
      if connected {
         self.disconnect_device(ctx, address, true, None);
      } else {
         self.purge_device(ctx, address);
      }
      Ok(())
   }

   /// Drops the device from the registry.
   pub(crate) fn purge_device(&mut self, ctx: &Context, address: Address) {
      let Some(mut device) = self.devices.remove(&address) else {
         return;
      };
      device.teardown(ctx, self.id, Error::DoesNotExist);
      device.remove_drivers(self.id);
      self.connections.retain(|a| *a != address);
      debug!("{}: {address} removed", self.id);
      ctx.emit(Event::DeviceRemoved {
         adapter: self.id,
         device: address,
      });
   }

   /// Removes a temporary device nothing uses any more.
   pub(crate) fn remove_if_unused(&mut self, ctx: &Context, address: Address) {
      if self
         .devices
         .get(&address)
         .is_some_and(|d| d.temporary && d.is_idle())
      {
         self.purge_device(ctx, address);
      }
   }

   /// Cancels the bonding and browse requests `caller` started.
   pub(crate) fn cancel_caller_requests(&mut self, ctx: &Context, caller: &CallerId) {
      let owned: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| {
            d.bonding.as_ref().is_some_and(|b| b.caller == *caller)
               || d
                  .browse
                  .as_ref()
                  .is_some_and(|b| b.origin.caller() == Some(caller))
         })
         .map(|(address, _)| *address)
         .collect();

      for address in owned {
         debug!("{}: {caller} exited, canceling requests on {address}", self.id);
         if self
            .devices
            .get(&address)
            .and_then(|d| d.bonding.as_ref())
            .is_some_and(|b| b.caller == *caller)
         {
            self.abort_bonding(ctx, address, Error::Canceled);
         }
         self.cancel_browse(ctx, address, Error::Canceled);
         self.remove_if_unused(ctx, address);
      }
   }

   pub(crate) fn handle_device_request(
      &mut self,
      ctx: &Context,
      address: Address,
      req: DeviceRequest,
   ) {
      if !self.devices.contains_key(&address) {
         req.reject(Error::DoesNotExist);
         return;
      }

      match req {
         DeviceRequest::Info(reply) => {
            let info = self.devices.get(&address).map(Device::info);
            answer(reply, info.ok_or(Error::DoesNotExist));
         },
         DeviceRequest::DiscoverServices(caller, pattern, reply) => {
            self.discover_services(ctx, address, caller, pattern, reply);
         },
         DeviceRequest::CancelDiscovery(caller, reply) => {
            answer(reply, self.cancel_discovery(ctx, address, &caller));
         },
         DeviceRequest::Disconnect(reply) => {
            self.disconnect_device(ctx, address, false, Some(reply));
         },
         DeviceRequest::SetTrusted(trusted, reply) => {
            answer(reply, self.set_trusted(ctx, address, trusted));
         },
         DeviceRequest::SetBlocked(blocked, reply) => {
            answer(reply, self.set_blocked(ctx, address, blocked));
         },
         DeviceRequest::SetAlias(alias, reply) => {
            answer(reply, self.set_alias(ctx, address, alias));
         },
         DeviceRequest::ReadRssi(reply) => answer(reply, self.read_rssi(ctx, address)),
         DeviceRequest::RegisterAttio(reply) => answer(reply, self.register_attio(ctx, address)),
         DeviceRequest::UnregisterAttio(token, reply) => {
            answer(reply, self.unregister_attio(ctx, address, token));
         },
      }
   }

   // === Properties ===

   fn set_trusted(&mut self, ctx: &Context, address: Address, trusted: bool) -> Result<()> {
      let device = self.devices.get_mut(&address).ok_or(Error::DoesNotExist)?;
      if device.trusted != trusted {
         device.trusted = trusted;
         ctx.device_changed(self.id, address, Property::Trusted, Value::Bool(trusted));
      }
      if trusted {
         device.temporary = false;
      }
      self.store_device(ctx, address);
      Ok(())
   }

   fn set_blocked(&mut self, ctx: &Context, address: Address, blocked: bool) -> Result<()> {
      let id = self.id;
      let device = self.devices.get(&address).ok_or(Error::DoesNotExist)?;
      if device.blocked == blocked {
         return Ok(());
      }

      if blocked {
         ctx.backend.block_device(id, address)?;
         let connected = device.connected || device.att.is_some();
         if connected {
            self.disconnect_device(ctx, address, false, None);
         }
         if let Some(device) = self.devices.get_mut(&address) {
            device.blocked = true;
            device.temporary = false;
            device.remove_drivers(id);
         }
         info!("{id}: {address} blocked");
      } else {
         ctx.backend.unblock_device(id, address)?;
         if let Some(device) = self.devices.get_mut(&address) {
            device.blocked = false;
            let uuids: Vec<Uuid> = device.uuids.iter().copied().collect();
            device.probe_drivers(ctx, id, &uuids);
         }
         info!("{id}: {address} unblocked");
      }

      ctx.device_changed(id, address, Property::Blocked, Value::Bool(blocked));
      self.store_device(ctx, address);
      Ok(())
   }

   fn set_alias(&mut self, ctx: &Context, address: Address, alias: Option<SmolStr>) -> Result<()> {
      let device = self.devices.get_mut(&address).ok_or(Error::DoesNotExist)?;
      let alias = alias.filter(|a| !a.is_empty());
      if device.alias == alias {
         return Ok(());
      }
      device.alias = alias;
      let shown = device.display_alias();
      ctx.device_changed(self.id, address, Property::Alias, Value::Str(shown));
      self.store_device(ctx, address);
      Ok(())
   }

   fn read_rssi(&self, ctx: &Context, address: Address) -> Result<()> {
      let device = self.devices.get(&address).ok_or(Error::DoesNotExist)?;
      if !device.connected {
         return Err(Error::NotConnected);
      }
      ctx.backend.read_rssi(self.id, address)
   }

   pub(crate) fn on_rssi(&mut self, ctx: &Context, address: Address, rssi: i8) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if device.rssi != Some(rssi) {
         device.rssi = Some(rssi);
         ctx.device_changed(self.id, address, Property::Rssi, Value::I32(rssi.into()));
      }
   }

   // === Connections ===

   pub(crate) fn on_connected(&mut self, ctx: &Context, address: Address, address_type: AddressType) {
      let id = self.id;
      let device = self.ensure_device(ctx, address, address_type);
      if device.connected {
         return;
      }
      device.connected = true;
      info!("{id}: {address} connected");
      if !self.connections.contains(&address) {
         self.connections.push(address);
      }
      ctx.device_changed(id, address, Property::Connected, Value::Bool(true));
   }

   pub(crate) fn on_disconnected(&mut self, ctx: &Context, address: Address, reason: u8) {
      let id = self.id;
      self.connections.retain(|a| *a != address);
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if device.connected {
         device.connected = false;
         info!("{id}: {address} disconnected ({reason:#04x})");
         ctx.device_changed(id, address, Property::Connected, Value::Bool(false));
      }
      if let Some(auth) = device.auth.take() {
         auth.agent.cancel();
      }
      if let Some(pending) = device.disconnect.take() {
         if pending.removal {
            device.temporary = true;
         }
         for reply in pending.waiters {
            answer(reply, Ok(()));
         }
      }

      let bonding = device.bonding.as_ref().is_some_and(|b| !b.le);
      if bonding {
         self.bonding_failed(ctx, address, Error::from_bonding_status(reason));
      }
      if self.devices.get(&address).is_some_and(|d| d.temporary) {
         self.schedule_removal(ctx, address);
      }
   }

   /// Notifies disconnect watchers and drops the link after the grace period.
   ///
   /// `reply` is answered once the link is actually down.
   pub(crate) fn disconnect_device(
      &mut self,
      ctx: &Context,
      address: Address,
      removal: bool,
      reply: Option<Reply<()>>,
   ) {
      let id = self.id;
      let connected = self
         .devices
         .get(&address)
         .is_some_and(|d| d.connected || d.att.is_some());
      if !connected {
         if let Some(reply) = reply {
            answer(reply, Err(Error::NotConnected));
         }
         return;
      }

      self.abort_bonding(ctx, address, Error::Canceled);
      self.cancel_browse(ctx, address, Error::Canceled);
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      device.supervisor.disable();

      if let Some(pending) = &mut device.disconnect {
         pending.removal |= removal;
         pending.waiters.extend(reply);
         return;
      }

      debug!("{id}: disconnecting {address} (removal: {removal})");
      for driver in &device.drivers {
         driver.disconnect_requested(id, address, removal);
      }
      ctx.emit(Event::DisconnectRequested {
         adapter: id,
         device: address,
         removal,
      });
      device.disconnect = Some(PendingDisconnect {
         timer: Some(ctx.arm(
            ctx.config.disconnect_grace(),
            TimerTarget::DisconnectGrace(id, address),
         )),
         waiters: reply.into_iter().collect(),
         removal,
      });
   }

   pub(crate) fn on_disconnect_grace(&mut self, ctx: &Context, address: Address, generation: u64) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(pending) = &mut device.disconnect else {
         return;
      };
      if !take_fired(&mut pending.timer, generation) {
         return;
      }

      device.release_att(ctx, id);
      if device.connected {
         if let Err(e) = ctx.backend.disconnect(id, address) {
            warn!("{id}: failed to disconnect {address}: {e}");
            if let Some(pending) = device.disconnect.take() {
               for reply in pending.waiters {
                  answer(reply, Err(e.clone()));
               }
            }
         }
         return;
      }

      // Only the ATT link was up
      if let Some(pending) = device.disconnect.take() {
         if pending.removal {
            device.temporary = true;
         }
         for reply in pending.waiters {
            answer(reply, Ok(()));
         }
      }
      if device.temporary {
         self.schedule_removal(ctx, address);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      testutil::{Call, Harness, MockDriver, addr},
      uuids,
   };

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_waits_for_grace_and_link_drop() {
      let h = Harness::new().await;
      let device = addr(1);
      h.trusted_device(device).await;
      h.connect(device).await;
      let handle = h.adapter.device(device);

      let pending = tokio::spawn({
         let handle = handle.clone();
         async move { handle.disconnect().await }
      });
      h.settle().await;
      assert_eq!(h.events.disconnect_requests(), vec![(device, false)]);
      assert_eq!(h.backend.count(|c| *c == Call::Disconnect(device)), 0);

      tokio::time::sleep(Duration::from_secs(3)).await;
      assert_eq!(h.backend.count(|c| *c == Call::Disconnect(device)), 1);
      assert!(!pending.is_finished());

      h.disconnect(device, 0x16).await;
      assert!(matches!(pending.await.unwrap(), Ok(())));
      assert!(!handle.info().await.unwrap().connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_not_connected() {
      let h = Harness::new().await;
      h.trusted_device(addr(1)).await;
      assert!(matches!(
         h.adapter.device(addr(1)).disconnect().await,
         Err(Error::NotConnected)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_remove_connected_device_waits_for_disconnect() {
      let h = Harness::new().await;
      let device = addr(2);
      h.trusted_device(device).await;
      h.connect(device).await;

      h.adapter.remove_device(device).await.unwrap();
      assert!(h.store.record(device).is_none());
      assert_eq!(h.events.disconnect_requests(), vec![(device, true)]);
      assert!(h.adapter.list_devices().await.unwrap().contains(&device));

      tokio::time::sleep(Duration::from_secs(3)).await;
      h.disconnect(device, 0x16).await;
      assert!(!h.adapter.list_devices().await.unwrap().contains(&device));
      assert_eq!(h.events.removed(), vec![device]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_incoming_connection_creates_temporary_device() {
      let h = Harness::new().await;
      let device = addr(3);
      h.connect(device).await;

      let info = h.adapter.device(device).info().await.unwrap();
      assert!(info.temporary && info.connected);
      assert_eq!(info.alias, device.to_string());

      h.disconnect(device, 0x13).await;
      assert!(matches!(
         h.adapter.device(device).info().await,
         Err(Error::DoesNotExist)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_trust_alias_persist() {
      let h = Harness::new().await;
      let device = addr(4);
      h.connect(device).await;
      let handle = h.adapter.device(device);

      handle.set_trusted(true).await.unwrap();
      handle.set_alias(Some("desk speaker".into())).await.unwrap();
      let record = h.store.record(device).unwrap();
      assert!(record.trusted);
      assert_eq!(record.alias.as_deref(), Some("desk speaker"));

      handle.set_alias(None).await.unwrap();
      assert_eq!(handle.info().await.unwrap().alias, device.to_string());

      // Trusted devices survive the link dropping
      h.disconnect(device, 0x13).await;
      assert!(handle.info().await.unwrap().trusted);
   }

   #[tokio::test(start_paused = true)]
   async fn test_block_unbinds_and_unblock_reprobes() {
      let a2dp = MockDriver::new("a2dp", &[uuids::A2DP_SINK]);
      let device = addr(5);
      let h = Harness::builder()
         .driver(a2dp.clone())
         .record(
            device,
            DeviceRecord {
               uuids: vec![uuids::A2DP_SINK],
               ..Default::default()
            },
         )
         .build()
         .await;
      assert_eq!(a2dp.probes(device), 1);

      let handle = h.adapter.device(device);
      handle.set_blocked(true).await.unwrap();
      assert_eq!(a2dp.removes(device), 1);
      assert!(h.backend.calls().contains(&Call::BlockDevice(device)));
      assert!(h.store.record(device).unwrap().blocked);

      handle.set_blocked(false).await.unwrap();
      assert_eq!(a2dp.probes(device), 2);
      assert!(h.backend.calls().contains(&Call::UnblockDevice(device)));
   }

   #[tokio::test(start_paused = true)]
   async fn test_read_rssi_needs_connection() {
      let h = Harness::new().await;
      let device = addr(6);
      h.trusted_device(device).await;
      let handle = h.adapter.device(device);
      assert!(matches!(handle.read_rssi().await, Err(Error::NotConnected)));

      h.connect(device).await;
      handle.read_rssi().await.unwrap();
      h.rssi(device, -55).await;
      assert_eq!(handle.info().await.unwrap().rssi, Some(-55));
   }

   #[tokio::test(start_paused = true)]
   async fn test_stored_devices_restored_with_keys() {
      let h = Harness::builder()
         .record(
            addr(7),
            DeviceRecord {
               link_key: Some(LinkKey {
                  key: [1; 16],
                  kind: 0,
                  pin_len: 4,
               }),
               trusted: true,
               ..Default::default()
            },
         )
         .build()
         .await;

      let info = h.adapter.device(addr(7)).info().await.unwrap();
      assert!(info.paired && info.trusted && !info.temporary);
      assert_eq!(h.backend.count(|c| matches!(c, Call::LoadKeys(1))), 1);
   }
}
