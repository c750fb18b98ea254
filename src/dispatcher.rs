//! Controller event dispatch.
//!
//! Backends hand every [`BackendEvent`] to a [`Dispatcher`]; the actor routes
//! it to the adapter that reported it and on to the coordinator in charge.

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::{
   adapter::Adapter,
   address::{Address, AddressType},
   auth::AuthKind,
   backend::{BackendEvent, LinkKey, LongTermKey},
   error::{Error, Result},
   manager::{Command, Context, ManagerActor},
};

/// Feeds controller events into the manager.
#[derive(Clone)]
pub struct Dispatcher {
   inbox: mpsc::Sender<Command>,
}

impl Dispatcher {
   pub(crate) const fn new(inbox: mpsc::Sender<Command>) -> Self {
      Self { inbox }
   }

   /// Queues `event`, waiting for room in the inbox.
   pub async fn dispatch(&self, event: BackendEvent) -> Result<()> {
      self
         .inbox
         .send(Command::Backend(event))
         .await
         .map_err(|_| Error::ManagerShutdown)
   }

   /// Queues `event` from a context that cannot await.
   pub fn try_dispatch(&self, event: BackendEvent) -> Result<()> {
      self.inbox.try_send(Command::Backend(event)).map_err(|e| match e {
         mpsc::error::TrySendError::Full(_) => Error::Busy,
         mpsc::error::TrySendError::Closed(_) => Error::ManagerShutdown,
      })
   }
}

impl ManagerActor {
   pub(crate) fn handle_backend_event(&mut self, event: BackendEvent) {
      match event {
         BackendEvent::ControllerAdded {
            adapter,
            address,
            class,
            name,
            powered,
         } => self.add_adapter(adapter, address, class, name, powered),
         BackendEvent::ControllerRemoved { adapter } => self.remove_adapter(adapter),
         event => {
            let id = event.adapter();
            match self.adapters.get_mut(&id) {
               Some(adapter) => adapter.handle_event(&self.ctx, event),
               None => debug!("{id}: event for unknown controller dropped"),
            }
         },
      }
   }
}

impl Adapter {
   pub(crate) fn handle_event(&mut self, ctx: &Context, event: BackendEvent) {
      match event {
         BackendEvent::ControllerAdded { .. } | BackendEvent::ControllerRemoved { .. } => {},
         BackendEvent::PowerChanged { powered, .. } => self.on_power_changed(ctx, powered),
         BackendEvent::ModeChanged { scan_mask, .. } => self.on_mode_changed(ctx, scan_mask),
         BackendEvent::DiscoveryStateChanged { discovering, .. } => {
            self.on_discovery_state(ctx, discovering);
         },
         BackendEvent::DeviceFound {
            device,
            address_type,
            rssi,
            class,
            eir,
            ..
         } => self.on_device_found(ctx, device, address_type, rssi, class, &eir),
         BackendEvent::RemoteName { device, name, .. } => self.on_remote_name(ctx, device, name),
         BackendEvent::Connected {
            device,
            address_type,
            ..
         } => self.on_connected(ctx, device, address_type),
         BackendEvent::ConnectFailed { device, status, .. } => {
            self.on_connect_failed(ctx, device, status);
         },
         BackendEvent::Disconnected { device, reason, .. } => {
            self.on_disconnected(ctx, device, reason);
         },
         BackendEvent::AttLinkLost { device, reason, .. } => {
            self.on_att_link_lost(ctx, device, reason);
         },
         BackendEvent::BondingComplete { device, status, .. } => {
            self.on_bonding_complete(ctx, device, status);
         },
         BackendEvent::LinkKeyNotify {
            device,
            key,
            persistent,
            ..
         } => self.on_link_key(ctx, device, key, persistent),
         BackendEvent::LongTermKeyNotify {
            device,
            key,
            persistent,
            ..
         } => self.on_long_term_key(ctx, device, key, persistent),
         BackendEvent::SimplePairingComplete { device, status, .. } => {
            self.on_simple_pairing_complete(ctx, device, status);
         },
         BackendEvent::EncryptionChanged {
            device, enabled, ..
         } => debug!("{}: encryption on {device} {}", self.id, if enabled { "on" } else { "off" }),
         BackendEvent::PinCodeRequest { device, secure, .. } => {
            self.authenticate(ctx, device, AuthKind::Pin { secure });
         },
         BackendEvent::PasskeyRequest { device, .. } => {
            self.authenticate(ctx, device, AuthKind::Passkey);
         },
         BackendEvent::ConfirmRequest {
            device, passkey, ..
         } => self.authenticate(ctx, device, AuthKind::Confirm { passkey }),
         BackendEvent::AuthorizeRequest { device, .. } => {
            self.authenticate(ctx, device, AuthKind::Consent);
         },
         BackendEvent::PasskeyNotify {
            device, passkey, ..
         } => self.authenticate(ctx, device, AuthKind::Notify { passkey }),
         BackendEvent::RssiSample { device, rssi, .. } => self.on_rssi(ctx, device, rssi),
      }
   }

   fn authenticate(&mut self, ctx: &Context, device: Address, kind: AuthKind) {
      if let Err(e) = self.request_authentication(ctx, device, kind) {
         debug!("{}: prompt for {device} not delivered: {e}", self.id);
      }
   }

   fn on_connect_failed(&mut self, ctx: &Context, address: Address, status: u8) {
      info!("{}: connecting {address} failed ({status:#04x})", self.id);
      let bonding = self
         .devices
         .get(&address)
         .and_then(|d| d.bonding.as_ref())
         .is_some_and(|b| !b.le);
      if bonding {
         self.bonding_failed(ctx, address, Error::from_bonding_status(status));
      }
      if self.devices.get(&address).is_some_and(|d| d.temporary) {
         self.schedule_removal(ctx, address);
      }
   }

   fn on_link_key(&mut self, ctx: &Context, address: Address, key: LinkKey, persistent: bool) {
      let id = self.id;
      let address_type = self
         .devices
         .get(&address)
         .map_or(AddressType::BrEdr, |d| d.address_type);
      let device = self.ensure_device(ctx, address, address_type);
      debug!("{id}: link key for {address} (persistent: {persistent})");
      if persistent {
         device.link_key = Some(key);
         device.bonded = true;
         device.temporary = false;
      }
      self.mark_paired(ctx, address);
      self.store_device(ctx, address);
   }

   fn on_long_term_key(
      &mut self,
      ctx: &Context,
      address: Address,
      key: LongTermKey,
      persistent: bool,
   ) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         warn!("{id}: long-term key for unknown {address}");
         return;
      };
      debug!("{id}: long-term key for {address} (persistent: {persistent})");
      if persistent {
         device.long_term_key = Some(key);
         device.bonded = true;
         device.temporary = false;
      }
      self.mark_paired(ctx, address);
      self.store_device(ctx, address);
   }
}
