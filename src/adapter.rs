//! Local controller state.
//!
//! An [`Adapter`] owns every [`Device`] it has created, its mode and discovery
//! sessions, and the cache of devices seen during the current discovery. All
//! of it is mutated from the manager actor only.

use std::{cmp::Reverse, collections::HashMap};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   address::{AdapterId, Address, AddressType},
   agent::{AgentRef, RegisteredAgent},
   backend::{SCAN_INQUIRY, SCAN_PAGE},
   bonding::BondingRequest,
   device::Device,
   eir,
   error::{Error, Result},
   event::{Event, Property, Value},
   manager::{AdapterRequest, Command, Completion, Context, Reply, answer},
   session::{Acquired, CallerId, Released, SessionList},
   storage::AdapterSettings,
   timer::{Task, Timer, TimerTarget, take_fired},
};

/// Longest local name the controller accepts, in bytes.
const MAX_NAME_LENGTH: usize = 248;

/// Scan mode of a controller, ordered by how visible it makes the adapter.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
   Off,
   #[default]
   Connectable,
   Discoverable,
}

impl Mode {
   pub const fn scan_mask(self) -> u8 {
      match self {
         Self::Off => 0,
         Self::Connectable => SCAN_PAGE,
         Self::Discoverable => SCAN_PAGE | SCAN_INQUIRY,
      }
   }

   pub const fn from_scan_mask(mask: u8) -> Self {
      if mask & SCAN_INQUIRY != 0 {
         Self::Discoverable
      } else if mask & SCAN_PAGE != 0 {
         Self::Connectable
      } else {
         Self::Off
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PowerState {
   Off,
   PoweringOn,
   On,
   PoweringOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameStatus {
   NotNeeded,
   Required,
   Requested,
   Resolved,
   Failed,
}

/// A device seen during the current discovery.
#[derive(Debug, Clone)]
pub struct FoundDevice {
   pub address: Address,
   pub address_type: AddressType,
   pub rssi: i8,
   pub class: Option<u32>,
   pub name: Option<SmolStr>,
   pub uuids: SmallVec<[Uuid; 4]>,
   pub(crate) name_complete: bool,
   /// Not seen since the current inquiry burst started.
   pub(crate) stale: bool,
   pub(crate) name_status: NameStatus,
}

impl FoundDevice {
   fn new(address: Address, address_type: AddressType, rssi: i8) -> Self {
      Self {
         address,
         address_type,
         rssi,
         class: None,
         name: None,
         uuids: SmallVec::new(),
         name_complete: false,
         stale: false,
         name_status: NameStatus::NotNeeded,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.to_string(),
         "address_type": self.address_type.to_string(),
         "rssi": self.rssi,
         "class": self.class,
         "name": self.name.as_deref(),
         "uuids": self.uuids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
      })
   }
}

/// Snapshot of adapter properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
   pub id: AdapterId,
   pub address: Address,
   pub name: SmolStr,
   pub class: u32,
   pub power: PowerState,
   pub mode: Mode,
   pub pairable: bool,
   pub discoverable_timeout: u32,
   pub pairable_timeout: u32,
   pub discovering: bool,
   pub mode_sessions: usize,
   pub discovery_sessions: usize,
   pub devices: Vec<Address>,
}

impl AdapterInfo {
   pub fn powered(&self) -> bool {
      self.power == PowerState::On
   }

   pub fn discoverable(&self) -> bool {
      self.mode == Mode::Discoverable
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "id": self.id.to_string(),
         "address": self.address.to_string(),
         "name": self.name.as_str(),
         "class": self.class,
         "powered": self.powered(),
         "mode": self.mode.to_string(),
         "discoverable": self.discoverable(),
         "pairable": self.pairable,
         "discoverable_timeout": self.discoverable_timeout,
         "pairable_timeout": self.pairable_timeout,
         "discovering": self.discovering,
         "devices": self.devices.iter().map(Address::to_string).collect::<Vec<_>>(),
      })
   }
}

struct ModeConfirm {
   caller: CallerId,
   token: u64,
   agent: AgentRef,
   _task: Task,
}

/// The one in-flight scan-mode change.
struct PendingMode {
   target: Mode,
   /// Set while the agent is asked to confirm going discoverable.
   confirm: Option<ModeConfirm>,
   replies: Vec<Reply<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct Discovery {
   pub(crate) sessions: SessionList<()>,
   /// The controller is scanning, or has been told to.
   pub(crate) running: bool,
   /// Published `Discovering` state.
   pub(crate) active: bool,
   pub(crate) suspended: bool,
   pub(crate) restart: Option<Timer>,
   pub(crate) resolving: Option<Address>,
   /// Kept sorted by signal strength, strongest first.
   pub(crate) found: Vec<FoundDevice>,
}

pub(crate) struct Adapter {
   pub(crate) id: AdapterId,
   pub(crate) address: Address,
   pub(crate) name: SmolStr,
   pub(crate) class: u32,
   pub(crate) power: PowerState,
   power_waiters: Vec<Reply<()>>,
   off_requested: bool,
   /// Mode reported by the controller.
   pub(crate) mode: Mode,
   /// Mode set through the adapter properties, independent of sessions.
   pub(crate) global_mode: Mode,
   pub(crate) mode_sessions: SessionList<Mode>,
   pending_mode: Option<PendingMode>,
   pub(crate) pairable: bool,
   pub(crate) discoverable_timeout: u32,
   pub(crate) pairable_timeout: u32,
   discoverable_timer: Option<Timer>,
   pairable_timer: Option<Timer>,
   pub(crate) discovery: Discovery,
   pub(crate) agent: Option<RegisteredAgent>,
   pub(crate) devices: HashMap<Address, Device>,
   pub(crate) connections: Vec<Address>,
}

impl Adapter {
   pub(crate) fn new(
      ctx: &Context,
      id: AdapterId,
      address: Address,
      class: u32,
      name: SmolStr,
   ) -> Self {
      let settings = ctx
         .store
         .adapter_settings(address)
         .unwrap_or_else(|e| {
            warn!("{id}: failed to read stored settings: {e}");
            None
         })
         .unwrap_or_default();

      let name = settings
         .name
         .unwrap_or_else(|| if name.is_empty() { ctx.config.name.clone() } else { name });
      let class = settings
         .class
         .unwrap_or(if class == 0 { ctx.config.class } else { class });

      Self {
         id,
         address,
         name,
         class,
         power: PowerState::Off,
         power_waiters: Vec::new(),
         off_requested: false,
         mode: Mode::Off,
         global_mode: settings.mode.unwrap_or(ctx.config.initial_mode),
         mode_sessions: SessionList::default(),
         pending_mode: None,
         pairable: settings.pairable.unwrap_or(true),
         discoverable_timeout: settings
            .discoverable_timeout
            .unwrap_or(ctx.config.discoverable_timeout),
         pairable_timeout: settings
            .pairable_timeout
            .unwrap_or(ctx.config.pairable_timeout),
         discoverable_timer: None,
         pairable_timer: None,
         discovery: Discovery::default(),
         agent: None,
         devices: HashMap::new(),
         connections: Vec::new(),
      }
   }

   /// Recreates stored devices and hands their keys to the controller.
   /// Devices that already exist are left alone.
   pub(crate) fn restore_devices(&mut self, ctx: &Context) {
      let records = match ctx.store.devices(self.address) {
         Ok(records) => records,
         Err(e) => {
            warn!("{}: failed to read stored devices: {e}", self.id);
            return;
         },
      };

      let mut link_keys = Vec::new();
      let mut long_term_keys = Vec::new();
      let mut restored = 0;
      for (address, record) in records {
         if self.devices.contains_key(&address) {
            continue;
         }
         let mut device = Device::from_record(address, record);
         if let Some(key) = device.link_key {
            link_keys.push((address, key));
         }
         if let Some(key) = device.long_term_key {
            long_term_keys.push((address, key));
         }
         let uuids: Vec<Uuid> = device.uuids.iter().copied().collect();
         device.probe_drivers(ctx, self.id, &uuids);
         self.devices.insert(address, device);
         ctx.emit(Event::DeviceCreated {
            adapter: self.id,
            device: address,
         });
         restored += 1;
      }

      if !link_keys.is_empty()
         && let Err(e) = ctx.backend.load_keys(self.id, &link_keys)
      {
         warn!("{}: failed to load link keys: {e}", self.id);
      }
      if !long_term_keys.is_empty()
         && let Err(e) = ctx.backend.load_long_term_keys(self.id, &long_term_keys)
      {
         warn!("{}: failed to load long-term keys: {e}", self.id);
      }
      debug!("{}: restored {restored} devices", self.id);
   }

   pub(crate) fn info(&self) -> AdapterInfo {
      let mut devices: Vec<_> = self.devices.keys().copied().collect();
      devices.sort();
      AdapterInfo {
         id: self.id,
         address: self.address,
         name: self.name.clone(),
         class: self.class,
         power: self.power,
         mode: self.mode,
         pairable: self.pairable,
         discoverable_timeout: self.discoverable_timeout,
         pairable_timeout: self.pairable_timeout,
         discovering: self.discovery.active,
         mode_sessions: self.mode_sessions.len(),
         discovery_sessions: self.discovery.sessions.len(),
         devices,
      }
   }

   pub(crate) fn store_settings(&self, ctx: &Context) {
      let settings = AdapterSettings {
         name: Some(self.name.clone()),
         class: Some(self.class),
         mode: Some(self.global_mode),
         discoverable_timeout: Some(self.discoverable_timeout),
         pairable_timeout: Some(self.pairable_timeout),
         pairable: Some(self.pairable),
      };
      if let Err(e) = ctx.store.store_adapter_settings(self.address, &settings) {
         warn!("{}: failed to store settings: {e}", self.id);
      }
   }

   pub(crate) fn handle_request(&mut self, ctx: &Context, req: AdapterRequest) {
      match req {
         AdapterRequest::Info(reply) => answer(reply, Ok(self.info())),
         AdapterRequest::SetPowered(powered, reply) => self.set_powered(ctx, powered, reply),
         AdapterRequest::SetDiscoverable(on, reply) => self.set_discoverable(ctx, on, reply),
         AdapterRequest::SetPairable(on, reply) => answer(reply, self.set_pairable(ctx, on)),
         AdapterRequest::SetDiscoverableTimeout(seconds, reply) => {
            self.set_discoverable_timeout(ctx, seconds);
            answer(reply, Ok(()));
         },
         AdapterRequest::SetPairableTimeout(seconds, reply) => {
            self.set_pairable_timeout(ctx, seconds);
            answer(reply, Ok(()));
         },
         AdapterRequest::SetName(name, reply) => answer(reply, self.set_name(ctx, name)),
         AdapterRequest::RequestMode(caller, mode, reply) => {
            self.request_mode(ctx, caller, mode, reply);
         },
         AdapterRequest::ReleaseMode(caller, reply) => {
            answer(reply, self.release_mode(ctx, &caller));
         },
         AdapterRequest::StartDiscovery(caller, reply) => {
            answer(reply, self.start_discovery(ctx, caller));
         },
         AdapterRequest::StopDiscovery(caller, reply) => {
            answer(reply, self.stop_discovery(ctx, &caller));
         },
         AdapterRequest::FoundDevices(reply) => answer(reply, Ok(self.discovery.found.clone())),
         AdapterRequest::RegisterAgent(agent, reply) => answer(reply, self.register_agent(agent)),
         AdapterRequest::UnregisterAgent(owner, reply) => {
            answer(reply, self.unregister_agent(&owner));
         },
         AdapterRequest::CreateDevice(caller, address, reply) => {
            self.create_device(ctx, caller, address, reply);
         },
         AdapterRequest::CreatePairedDevice(params, reply) => {
            self.create_paired_device(ctx, params, reply);
         },
         AdapterRequest::CancelBonding(caller, address, reply) => {
            answer(reply, self.cancel_bonding(ctx, &caller, address));
         },
         AdapterRequest::RemoveDevice(address, reply) => {
            answer(reply, self.remove_device(ctx, address));
         },
         AdapterRequest::ListDevices(reply) => {
            let mut devices: Vec<_> = self.devices.keys().copied().collect();
            devices.sort();
            answer(reply, Ok(devices));
         },
      }
   }

   pub(crate) fn on_timer(&mut self, ctx: &Context, target: TimerTarget, generation: u64) {
      match target {
         TimerTarget::DiscoverableTimeout(_) => self.on_discoverable_timeout(ctx, generation),
         TimerTarget::PairableTimeout(_) => self.on_pairable_timeout(ctx, generation),
         TimerTarget::DiscoveryRestart(_) => self.on_discovery_restart(ctx, generation),
         TimerTarget::DisconnectGrace(_, device) => {
            self.on_disconnect_grace(ctx, device, generation);
         },
         TimerTarget::ReverseDiscovery(_, device) => {
            self.on_reverse_discovery(ctx, device, generation);
         },
         TimerTarget::Reconnect(_, device) => self.on_reconnect_timer(ctx, device, generation),
      }
   }

   pub(crate) fn on_completion(&mut self, ctx: &Context, completion: Completion) {
      match completion {
         Completion::ModeConfirmed { token, result } => self.on_mode_confirmed(ctx, token, result),
         Completion::AgentAnswered {
            device,
            request,
            answer,
         } => self.on_agent_answer(ctx, device, request, answer),
         Completion::SdpSearched {
            device,
            browse,
            result,
         } => self.on_sdp_searched(ctx, device, browse, result),
         Completion::AttConnected {
            device,
            purpose,
            result,
         } => self.on_att_connected(ctx, device, purpose, result),
         Completion::PrimariesDiscovered {
            device,
            browse,
            result,
         } => self.on_primaries_discovered(ctx, device, browse, result),
         Completion::SecurityRaised {
            device,
            bonding,
            result,
         } => self.on_security_raised(ctx, device, bonding, result),
         Completion::PurgeDevice(device) => self.remove_if_unused(ctx, device),
      }
   }

   /// Queues removal of `device` for the next turn of the actor loop.
   pub(crate) fn schedule_removal(&self, ctx: &Context, device: Address) {
      ctx.post(Command::Completed(self.id, Completion::PurgeDevice(device)));
   }

   pub(crate) fn caller_exited(&mut self, ctx: &Context, caller: &CallerId) {
      self.drop_mode_sessions(ctx, caller);

      if self.discovery.sessions.remove_owner(caller) {
         debug!("{}: discovery session of {caller} dropped", self.id);
         if self.discovery.sessions.is_empty() {
            self.end_discovery(ctx);
         }
      }

      if self.agent.as_ref().is_some_and(|a| a.owner == *caller)
         && let Some(agent) = self.agent.take()
      {
         info!("{}: agent of {caller} exited", self.id);
         agent.agent.release();
      }

      self.cancel_caller_requests(ctx, caller);
   }

   // === Power ===

   fn set_powered(&mut self, ctx: &Context, powered: bool, reply: Reply<()>) {
      match (self.power, powered) {
         (PowerState::PoweringOn | PowerState::PoweringOff, _) => {
            answer(reply, Err(Error::NotReady));
            return;
         },
         (PowerState::On, true) | (PowerState::Off, false) => {
            answer(reply, Ok(()));
            return;
         },
         _ => {},
      }

      if let Err(e) = ctx.backend.set_powered(self.id, powered) {
         answer(reply, Err(e));
         return;
      }
      if powered {
         self.power = PowerState::PoweringOn;
      } else {
         self.power = PowerState::PoweringOff;
         self.off_requested = true;
      }
      self.power_waiters.push(reply);
   }

   pub(crate) fn on_power_changed(&mut self, ctx: &Context, powered: bool) {
      if powered {
         if self.power != PowerState::On {
            self.powered_on(ctx);
         }
      } else if self.power != PowerState::Off {
         self.stop(ctx);
      }
   }

   pub(crate) fn powered_on(&mut self, ctx: &Context) {
      let was = self.power;
      self.power = PowerState::On;
      self.off_requested = false;
      info!("{}: powered on", self.id);

      if let Err(e) = ctx.backend.set_name(self.id, &self.name) {
         warn!("{}: failed to restore name: {e}", self.id);
      }
      if let Err(e) = ctx.backend.set_pairable(self.id, self.pairable) {
         warn!("{}: failed to restore pairable: {e}", self.id);
      }
      self.update_mode(ctx);

      if was != PowerState::On {
         ctx.adapter_changed(self.id, Property::Powered, Value::Bool(true));
      }
      for reply in self.power_waiters.drain(..) {
         answer(reply, Ok(()));
      }
   }

   /// Tears down sessions, timers and connections once the controller is off.
   pub(crate) fn stop(&mut self, ctx: &Context) {
      let id = self.id;
      if self.power == PowerState::On && !self.off_requested {
         warn!("{id}: controller powered off unexpectedly");
      }

      self.discovery.sessions.clear();
      self.discovery.restart = None;
      self.discovery.resolving = None;
      self.discovery.running = false;
      self.discovery.suspended = false;
      self.discovery.found.clear();
      self.set_discovering(ctx, false);

      self.mode_sessions.clear();
      if let Some(pending) = self.pending_mode.take() {
         if let Some(confirm) = &pending.confirm {
            confirm.agent.cancel();
         }
         for reply in pending.replies {
            answer(reply, Err(Error::NotReady));
         }
      }
      self.discoverable_timer = None;
      self.pairable_timer = None;
      if self.mode == Mode::Discoverable {
         ctx.adapter_changed(id, Property::Discoverable, Value::Bool(false));
      }
      self.mode = Mode::Off;

      let mut temporary = Vec::new();
      for (address, device) in &mut self.devices {
         device.teardown(ctx, id, Error::NotReady);
         if device.connected {
            device.connected = false;
            ctx.device_changed(id, *address, Property::Connected, Value::Bool(false));
         }
         if device.temporary {
            temporary.push(*address);
         }
      }
      self.connections.clear();
      for address in temporary {
         self.purge_device(ctx, address);
      }

      let was = self.power;
      self.power = PowerState::Off;
      if was != PowerState::Off {
         info!("{id}: powered off");
         ctx.adapter_changed(id, Property::Powered, Value::Bool(false));
      }
      for reply in self.power_waiters.drain(..) {
         let result = if was == PowerState::PoweringOff {
            Ok(())
         } else {
            Err(Error::Failed(SmolStr::new_static("Controller powered off")))
         };
         answer(reply, result);
      }
   }

   pub(crate) fn require_powered(&self) -> Result<()> {
      if self.power == PowerState::On {
         Ok(())
      } else {
         Err(Error::NotReady)
      }
   }

   // === Mode ===

   pub(crate) fn effective_mode(&self) -> Mode {
      self
         .mode_sessions
         .max_mode()
         .map_or(self.global_mode, |mode| mode.max(self.global_mode))
   }

   /// Asks the controller for `target`; replies queued on the pending mode
   /// are answered once it reports the new scan mask.
   fn apply_mode(&mut self, ctx: &Context, target: Mode) -> Result<()> {
      ctx.backend.set_scan_mode(self.id, target.scan_mask())?;
      debug!("{}: switching mode {} -> {target}", self.id, self.mode);
      self.pending_mode = Some(PendingMode {
         target,
         confirm: None,
         replies: Vec::new(),
      });
      Ok(())
   }

   fn queue_mode_reply(&mut self, reply: Reply<()>) {
      match &mut self.pending_mode {
         Some(pending) => pending.replies.push(reply),
         None => answer(reply, Ok(())),
      }
   }

   /// Brings the controller to the effective mode, unless a change is
   /// already in flight.
   pub(crate) fn update_mode(&mut self, ctx: &Context) {
      if self.power != PowerState::On || self.pending_mode.is_some() {
         return;
      }
      let target = self.effective_mode();
      if target != self.mode
         && let Err(e) = self.apply_mode(ctx, target)
      {
         warn!("{}: failed to set mode {target}: {e}", self.id);
      }
   }

   fn request_mode(&mut self, ctx: &Context, caller: CallerId, mode: Mode, reply: Reply<()>) {
      if let Err(e) = self.require_powered() {
         answer(reply, Err(e));
         return;
      }
      if mode == Mode::Off {
         answer(reply, Err(Error::InvalidArguments(SmolStr::new_static("Invalid mode"))));
         return;
      }
      if self.pending_mode.is_some() {
         answer(reply, Err(Error::AlreadyInProgress));
         return;
      }
      if self.mode_sessions.acquire(&caller, mode) == Acquired::Existing {
         answer(reply, Ok(()));
         return;
      }

      let target = self.effective_mode();
      if target == self.mode {
         answer(reply, Ok(()));
         return;
      }

      if target == Mode::Discoverable
         && self.mode < Mode::Discoverable
         && let Some(agent) = self.agent.as_ref().map(|a| a.agent.clone())
      {
         let token = ctx.next_id();
         let id = self.id;
         let confirm = agent.confirm_mode_change(target);
         let task = ctx.spawn(async move {
            Command::Completed(id, Completion::ModeConfirmed {
               token,
               result: confirm.await,
            })
         });
         debug!("{id}: asking agent to confirm {target} for {caller}");
         self.pending_mode = Some(PendingMode {
            target,
            confirm: Some(ModeConfirm {
               caller,
               token,
               agent,
               _task: task,
            }),
            replies: vec![reply],
         });
         return;
      }

      match self.apply_mode(ctx, target) {
         Ok(()) => self.queue_mode_reply(reply),
         Err(e) => {
            self.mode_sessions.release(&caller);
            answer(reply, Err(e));
         },
      }
   }

   fn on_mode_confirmed(&mut self, ctx: &Context, token: u64, result: Result<()>) {
      let matches = self
         .pending_mode
         .as_ref()
         .and_then(|p| p.confirm.as_ref())
         .is_some_and(|c| c.token == token);
      if !matches {
         debug!("{}: ignoring stale mode confirmation", self.id);
         return;
      }
      let Some(PendingMode {
         confirm: Some(confirm),
         replies,
         ..
      }) = self.pending_mode.take()
      else {
         return;
      };

      let outcome = match result {
         Ok(()) => {
            let target = self.effective_mode();
            if target == self.mode {
               Ok(())
            } else {
               self.apply_mode(ctx, target)
            }
         },
         Err(e) => {
            info!("{}: agent rejected mode change for {}: {e}", self.id, confirm.caller);
            Err(e)
         },
      };

      match outcome {
         Ok(()) => {
            for reply in replies {
               self.queue_mode_reply(reply);
            }
         },
         Err(e) => {
            self.mode_sessions.release(&confirm.caller);
            for reply in replies {
               answer(reply, Err(e.clone()));
            }
         },
      }
   }

   fn release_mode(&mut self, ctx: &Context, caller: &CallerId) -> Result<()> {
      match self.mode_sessions.release(caller) {
         None => Err(Error::DoesNotExist),
         Some(Released::Held) => Ok(()),
         Some(Released::Dropped) => {
            debug!("{}: mode session of {caller} released", self.id);
            self.update_mode(ctx);
            Ok(())
         },
      }
   }

   /// Drops every mode session of `caller`, abandoning a confirmation the
   /// agent has not answered yet.
   fn drop_mode_sessions(&mut self, ctx: &Context, caller: &CallerId) {
      let confirming = self
         .pending_mode
         .as_ref()
         .and_then(|p| p.confirm.as_ref())
         .is_some_and(|c| c.caller == *caller);
      if confirming && let Some(pending) = self.pending_mode.take() {
         if let Some(confirm) = &pending.confirm {
            confirm.agent.cancel();
         }
         for reply in pending.replies {
            answer(reply, Err(Error::Canceled));
         }
      }

      if self.mode_sessions.remove_owner(caller) {
         debug!("{}: mode session of {caller} dropped", self.id);
         self.update_mode(ctx);
      }
   }

   pub(crate) fn on_mode_changed(&mut self, ctx: &Context, scan_mask: u8) {
      let mode = Mode::from_scan_mask(scan_mask);
      let old = self.mode;
      self.mode = mode;

      if self.pending_mode.as_ref().is_some_and(|p| p.confirm.is_none())
         && let Some(pending) = self.pending_mode.take()
      {
         let result = if mode == pending.target {
            Ok(())
         } else {
            Err(Error::Failed(SmolStr::new_static("Controller refused scan mode")))
         };
         for reply in pending.replies {
            answer(reply, result.clone());
         }
         if self.effective_mode() != pending.target {
            self.update_mode(ctx);
         }
      }

      if old == mode {
         return;
      }
      info!("{}: mode {old} -> {mode}", self.id);

      if (old == Mode::Discoverable) != (mode == Mode::Discoverable) {
         ctx.adapter_changed(
            self.id,
            Property::Discoverable,
            Value::Bool(mode == Mode::Discoverable),
         );
      }
      if mode == Mode::Discoverable {
         self.arm_discoverable_timer(ctx);
      } else {
         self.discoverable_timer = None;
      }
   }

   fn arm_discoverable_timer(&mut self, ctx: &Context) {
      self.discoverable_timer = (self.discoverable_timeout > 0).then(|| {
         ctx.arm(
            std::time::Duration::from_secs(u64::from(self.discoverable_timeout)),
            TimerTarget::DiscoverableTimeout(self.id),
         )
      });
   }

   fn on_discoverable_timeout(&mut self, ctx: &Context, generation: u64) {
      if !take_fired(&mut self.discoverable_timer, generation) {
         return;
      }
      info!("{}: discoverable timeout expired", self.id);
      if self.global_mode == Mode::Discoverable {
         self.global_mode = Mode::Connectable;
         self.store_settings(ctx);
      }
      self.update_mode(ctx);
   }

   fn set_discoverable(&mut self, ctx: &Context, discoverable: bool, reply: Reply<()>) {
      if let Err(e) = self.require_powered() {
         answer(reply, Err(e));
         return;
      }
      if self.pending_mode.is_some() {
         answer(reply, Err(Error::AlreadyInProgress));
         return;
      }

      self.global_mode = if discoverable {
         Mode::Discoverable
      } else {
         Mode::Connectable
      };
      self.store_settings(ctx);

      let target = self.effective_mode();
      if target == self.mode {
         if target == Mode::Discoverable {
            self.arm_discoverable_timer(ctx);
         }
         answer(reply, Ok(()));
         return;
      }
      match self.apply_mode(ctx, target) {
         Ok(()) => self.queue_mode_reply(reply),
         Err(e) => answer(reply, Err(e)),
      }
   }

   fn set_pairable(&mut self, ctx: &Context, pairable: bool) -> Result<()> {
      ctx.backend.set_pairable(self.id, pairable)?;
      if self.pairable != pairable {
         self.pairable = pairable;
         ctx.adapter_changed(self.id, Property::Pairable, Value::Bool(pairable));
         self.store_settings(ctx);
      }
      self.pairable_timer = (pairable && self.pairable_timeout > 0).then(|| {
         ctx.arm(
            std::time::Duration::from_secs(u64::from(self.pairable_timeout)),
            TimerTarget::PairableTimeout(self.id),
         )
      });
      Ok(())
   }

   fn on_pairable_timeout(&mut self, ctx: &Context, generation: u64) {
      if !take_fired(&mut self.pairable_timer, generation) {
         return;
      }
      info!("{}: pairable timeout expired", self.id);
      if let Err(e) = self.set_pairable(ctx, false) {
         warn!("{}: failed to clear pairable: {e}", self.id);
      }
   }

   fn set_discoverable_timeout(&mut self, ctx: &Context, seconds: u32) {
      if self.discoverable_timeout == seconds {
         return;
      }
      self.discoverable_timeout = seconds;
      ctx.adapter_changed(self.id, Property::DiscoverableTimeout, Value::U32(seconds));
      self.store_settings(ctx);
      if self.mode == Mode::Discoverable {
         self.arm_discoverable_timer(ctx);
      }
   }

   fn set_pairable_timeout(&mut self, ctx: &Context, seconds: u32) {
      if self.pairable_timeout == seconds {
         return;
      }
      self.pairable_timeout = seconds;
      ctx.adapter_changed(self.id, Property::PairableTimeout, Value::U32(seconds));
      self.store_settings(ctx);
      if self.pairable {
         self.pairable_timer = (seconds > 0).then(|| {
            ctx.arm(
               std::time::Duration::from_secs(u64::from(seconds)),
               TimerTarget::PairableTimeout(self.id),
            )
         });
      }
   }

   fn set_name(&mut self, ctx: &Context, name: SmolStr) -> Result<()> {
      if name.is_empty() || name.len() > MAX_NAME_LENGTH {
         return Err(Error::InvalidArguments(SmolStr::new_static("Invalid name")));
      }
      if name == self.name {
         return Ok(());
      }
      if self.power == PowerState::On {
         ctx.backend.set_name(self.id, &name)?;
      }
      self.name = name.clone();
      ctx.adapter_changed(self.id, Property::Name, Value::Str(name));
      self.store_settings(ctx);
      Ok(())
   }

   // === Agent ===

   fn register_agent(&mut self, agent: RegisteredAgent) -> Result<()> {
      if self.agent.is_some() {
         return Err(Error::AlreadyExists);
      }
      info!(
         "{}: agent registered by {} ({})",
         self.id, agent.owner, agent.capability
      );
      self.agent = Some(agent);
      Ok(())
   }

   fn unregister_agent(&mut self, owner: &CallerId) -> Result<()> {
      if !self.agent.as_ref().is_some_and(|a| a.owner == *owner) {
         return Err(Error::DoesNotExist);
      }
      if let Some(agent) = self.agent.take() {
         info!("{}: agent of {owner} unregistered", self.id);
         agent.agent.release();
      }
      Ok(())
   }

   // === Discovery ===

   fn set_discovering(&mut self, ctx: &Context, active: bool) {
      if self.discovery.active != active {
         self.discovery.active = active;
         ctx.adapter_changed(self.id, Property::Discovering, Value::Bool(active));
      }
   }

   fn begin_burst(&mut self, ctx: &Context) -> Result<()> {
      ctx.backend.start_discovery(self.id)?;
      self.discovery.running = true;
      Ok(())
   }

   fn start_discovery(&mut self, ctx: &Context, caller: CallerId) -> Result<()> {
      self.require_powered()?;
      if self.discovery.sessions.acquire(&caller, ()) == Acquired::Existing {
         return Ok(());
      }
      if self.discovery.sessions.len() > 1 {
         return Ok(());
      }

      debug!("{}: first discovery session opened by {caller}", self.id);
      self.discovery.found.clear();
      if !self.discovery.suspended
         && let Err(e) = self.begin_burst(ctx)
      {
         self.discovery.sessions.release(&caller);
         return Err(e);
      }
      Ok(())
   }

   fn stop_discovery(&mut self, ctx: &Context, caller: &CallerId) -> Result<()> {
      match self.discovery.sessions.release(caller) {
         None => Err(Error::NotAuthorized),
         Some(Released::Held) => Ok(()),
         Some(Released::Dropped) => {
            if self.discovery.sessions.is_empty() {
               self.end_discovery(ctx);
            }
            Ok(())
         },
      }
   }

   /// Called once the last discovery session is gone.
   fn end_discovery(&mut self, ctx: &Context) {
      self.discovery.resolving = None;
      if self.discovery.restart.take().is_some() {
         debug!("{}: discovery restart disarmed", self.id);
      }
      if self.discovery.running {
         self.discovery.running = false;
         if let Err(e) = ctx.backend.stop_discovery(self.id) {
            warn!("{}: failed to stop discovery: {e}", self.id);
         }
      } else {
         self.set_discovering(ctx, false);
      }
   }

   /// Pauses inquiry while a bonding is in progress. Sessions are untouched,
   /// and sessions opened meanwhile wait for the bonding too.
   pub(crate) fn suspend_discovery(&mut self, ctx: &Context) {
      if self.discovery.suspended {
         return;
      }
      debug!("{}: suspending discovery", self.id);
      self.discovery.suspended = true;
      self.discovery.restart = None;
      if self.discovery.resolving.take().is_some() {
         for entry in &mut self.discovery.found {
            if entry.name_status == NameStatus::Requested {
               entry.name_status = NameStatus::Required;
            }
         }
      }
      if self.discovery.running {
         self.discovery.running = false;
         if let Err(e) = ctx.backend.stop_discovery(self.id) {
            warn!("{}: failed to suspend discovery: {e}", self.id);
         }
      }
   }

   /// Resumes inquiry once no bonding is left in progress.
   pub(crate) fn resume_discovery(&mut self, ctx: &Context) {
      let held = self
         .devices
         .values()
         .any(|d| d.bonding.as_ref().is_some_and(BondingRequest::holds_discovery));
      if !self.discovery.suspended || held {
         return;
      }
      debug!("{}: resuming discovery", self.id);
      self.discovery.suspended = false;
      if !self.discovery.sessions.is_empty()
         && self.power == PowerState::On
         && let Err(e) = self.begin_burst(ctx)
      {
         warn!("{}: failed to resume discovery: {e}", self.id);
      }
   }

   pub(crate) fn on_discovery_state(&mut self, ctx: &Context, discovering: bool) {
      if discovering {
         self.discovery.running = true;
         for entry in &mut self.discovery.found {
            entry.stale = true;
         }
         self.set_discovering(ctx, true);
         return;
      }

      self.discovery.running = false;
      if self.discovery.sessions.is_empty() {
         self.set_discovering(ctx, false);
      } else if !self.discovery.suspended {
         self.resolve_next_name(ctx);
      }
   }

   /// Resolves the next unknown name, strongest signal first, then closes
   /// the burst.
   fn resolve_next_name(&mut self, ctx: &Context) {
      if ctx.config.name_resolving {
         for entry in &mut self.discovery.found {
            if entry.name_status != NameStatus::Required {
               continue;
            }
            match ctx.backend.resolve_name(self.id, entry.address) {
               Ok(()) => {
                  entry.name_status = NameStatus::Requested;
                  self.discovery.resolving = Some(entry.address);
                  return;
               },
               Err(e) => {
                  debug!("{}: cannot resolve name of {}: {e}", self.id, entry.address);
                  entry.name_status = NameStatus::Failed;
               },
            }
         }
      }
      self.finish_burst(ctx);
   }

   fn finish_burst(&mut self, ctx: &Context) {
      let stale: Vec<Address> = self
         .discovery
         .found
         .iter()
         .filter(|f| f.stale)
         .map(|f| f.address)
         .collect();
      self.discovery.found.retain(|f| !f.stale);
      for device in stale {
         ctx.emit(Event::DeviceDisappeared {
            adapter: self.id,
            device,
         });
      }

      if !self.discovery.sessions.is_empty() && !self.discovery.suspended {
         self.discovery.restart = Some(ctx.arm(
            ctx.config.discovery_interval(),
            TimerTarget::DiscoveryRestart(self.id),
         ));
      }
   }

   fn on_discovery_restart(&mut self, ctx: &Context, generation: u64) {
      if !take_fired(&mut self.discovery.restart, generation) {
         return;
      }
      if self.discovery.sessions.is_empty()
         || self.discovery.suspended
         || self.power != PowerState::On
      {
         return;
      }
      if let Err(e) = self.begin_burst(ctx) {
         warn!("{}: failed to restart discovery: {e}", self.id);
      }
   }

   pub(crate) fn on_device_found(
      &mut self,
      ctx: &Context,
      address: Address,
      address_type: AddressType,
      rssi: i8,
      class: Option<u32>,
      data: &[u8],
   ) {
      let eir = eir::parse(data);
      let class = class.or(eir.class);
      let id = self.id;

      let mut known_name = None;
      let mut changed = false;
      if let Some(device) = self.devices.get_mut(&address) {
         if device.address_type != address_type {
            debug!("{id}: {address} is {address_type}, not {}", device.address_type);
            device.address_type = address_type;
            changed = true;
         }
         if let Some(class) = class
            && device.class != class
         {
            device.class = class;
            ctx.device_changed(id, address, Property::Class, Value::U32(class));
            changed = true;
         }
         if eir.name_complete
            && let Some(name) = &eir.name
            && device.name.as_ref() != Some(name)
         {
            device.name = Some(name.clone());
            ctx.device_changed(id, address, Property::Name, Value::Str(name.clone()));
            changed = true;
         }
         known_name = device.name.clone();
      }
      if changed {
         self.store_device(ctx, address);
      }

      if self.discovery.sessions.is_empty() {
         return;
      }

      let found = &mut self.discovery.found;
      let idx = match found.iter().position(|f| f.address == address) {
         Some(idx) => idx,
         None => {
            found.push(FoundDevice::new(address, address_type, rssi));
            found.len() - 1
         },
      };
      let entry = &mut found[idx];
      entry.rssi = rssi;
      entry.stale = false;
      entry.address_type = address_type;
      if class.is_some() {
         entry.class = class;
      }
      for uuid in &eir.uuids {
         if !entry.uuids.contains(uuid) {
            entry.uuids.push(*uuid);
         }
      }
      if let Some(name) = eir.name
         && (eir.name_complete || !entry.name_complete)
      {
         entry.name = Some(name);
         entry.name_complete = eir.name_complete;
      }
      if entry.name.is_none() {
         entry.name = known_name.clone();
      }

      let name_known = entry.name_complete || known_name.is_some();
      match entry.name_status {
         NameStatus::NotNeeded | NameStatus::Required => {
            entry.name_status = if !name_known && ctx.config.name_resolving {
               NameStatus::Required
            } else {
               NameStatus::NotNeeded
            };
         },
         NameStatus::Requested | NameStatus::Resolved | NameStatus::Failed => {},
      }

      let snapshot = entry.clone();
      found.sort_by_key(|f| Reverse(f.rssi));
      ctx.emit(Event::DeviceFound {
         adapter: id,
         device: snapshot,
      });
   }

   pub(crate) fn on_remote_name(&mut self, ctx: &Context, address: Address, name: Option<SmolStr>) {
      let id = self.id;
      if let Some(name) = &name
         && let Some(device) = self.devices.get_mut(&address)
         && device.name.as_ref() != Some(name)
      {
         device.name = Some(name.clone());
         ctx.device_changed(id, address, Property::Name, Value::Str(name.clone()));
         self.store_device(ctx, address);
      }

      if let Some(entry) = self.discovery.found.iter_mut().find(|f| f.address == address) {
         match name {
            Some(name) => {
               entry.name = Some(name);
               entry.name_complete = true;
               entry.name_status = NameStatus::Resolved;
               ctx.emit(Event::DeviceFound {
                  adapter: id,
                  device: entry.clone(),
               });
            },
            None => entry.name_status = NameStatus::Failed,
         }
      }

      if self.discovery.resolving == Some(address) {
         self.discovery.resolving = None;
         if !self.discovery.sessions.is_empty() && !self.discovery.suspended {
            self.resolve_next_name(ctx);
         }
      }
   }

   /// Address type of a device seen during discovery, if any.
   pub(crate) fn found_address_type(&self, address: Address) -> AddressType {
      self
         .discovery
         .found
         .iter()
         .find(|f| f.address == address)
         .map_or(AddressType::BrEdr, |f| f.address_type)
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      backend::BackendEvent,
      testutil::{ADAPTER, Call, Harness, MockAgent, addr, caller},
   };

   #[test]
   fn test_mode_scan_mask_round_trip_and_order() {
      assert_eq!(Mode::from_scan_mask(0x03), Mode::Discoverable);
      assert_eq!(Mode::from_scan_mask(0x02), Mode::Connectable);
      assert_eq!(Mode::from_scan_mask(0x00), Mode::Off);
      assert_eq!(Mode::Discoverable.scan_mask(), 0x03);
      assert!(Mode::Off < Mode::Connectable && Mode::Connectable < Mode::Discoverable);
      assert_eq!("discoverable".parse::<Mode>().unwrap(), Mode::Discoverable);
      assert_eq!(Mode::Connectable.to_string(), "connectable");
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_cycle_waits_for_controller() {
      let h = Harness::new().await;

      assert!(matches!(h.adapter.set_powered(true).await, Ok(())));
      let pending = tokio::spawn({
         let adapter = h.adapter.clone();
         async move { adapter.set_powered(false).await }
      });
      h.settle().await;

      // A second transition while the first is pending
      assert!(matches!(h.adapter.set_powered(true).await, Err(Error::NotReady)));
      assert_eq!(h.adapter.info().await.unwrap().power, PowerState::PoweringOff);

      h.dispatch(BackendEvent::PowerChanged {
         adapter: ADAPTER,
         powered: false,
      })
      .await;
      assert!(matches!(pending.await.unwrap(), Ok(())));
      let info = h.adapter.info().await.unwrap();
      assert!(!info.powered());
      assert_eq!(info.mode, Mode::Off);
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_on_restores_name_and_mode() {
      let h = Harness::unpowered().await;
      let pending = tokio::spawn({
         let adapter = h.adapter.clone();
         async move { adapter.set_powered(true).await }
      });
      h.settle().await;
      h.dispatch(BackendEvent::PowerChanged {
         adapter: ADAPTER,
         powered: true,
      })
      .await;
      assert!(matches!(pending.await.unwrap(), Ok(())));

      let calls = h.backend.calls();
      assert!(calls.contains(&Call::SetName("bluecore".into())));
      assert!(calls.contains(&Call::SetScanMode(Mode::Connectable.scan_mask())));
   }

   #[tokio::test(start_paused = true)]
   async fn test_mode_session_takes_maximum() {
      let h = Harness::new().await;
      let a = caller(":1.1");
      let b = caller(":1.2");

      let pending = tokio::spawn({
         let adapter = h.adapter.clone();
         let a = a.clone();
         async move { adapter.request_mode(a, Mode::Discoverable).await }
      });
      h.settle().await;
      assert_eq!(h.backend.count(|c| *c == Call::SetScanMode(0x03)), 1);
      h.mode_changed(0x03).await;
      assert!(matches!(pending.await.unwrap(), Ok(())));

      // A lower request does not lower the mode
      h.adapter.request_mode(b.clone(), Mode::Connectable).await.unwrap();
      assert_eq!(h.adapter.info().await.unwrap().mode, Mode::Discoverable);

      h.adapter.release_mode(a.clone()).await.unwrap();
      h.settle().await;
      assert_eq!(h.backend.count(|c| *c == Call::SetScanMode(0x02)), 2);
      assert!(matches!(
         h.adapter.release_mode(a).await,
         Err(Error::DoesNotExist)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_mode_request_rolled_back_when_caller_exits() {
      let h = Harness::new().await;
      let agent = MockAgent::holding();
      h.adapter
         .register_agent(caller(":1.9"), Default::default(), agent.clone())
         .await
         .unwrap();

      let who = caller(":1.1");
      let pending = tokio::spawn({
         let adapter = h.adapter.clone();
         let who = who.clone();
         async move { adapter.request_mode(who, Mode::Discoverable).await }
      });
      h.settle().await;
      assert_eq!(agent.mode_prompts(), 1);

      // Concurrent requests are refused while the agent decides
      assert!(matches!(
         h.adapter.request_mode(caller(":1.2"), Mode::Discoverable).await,
         Err(Error::AlreadyInProgress)
      ));

      h.manager.caller_exited(who).await.unwrap();
      assert!(matches!(pending.await.unwrap(), Err(Error::Canceled)));

      let info = h.adapter.info().await.unwrap();
      assert_eq!(info.mode, Mode::Connectable);
      assert_eq!(info.mode_sessions, 0);
      assert_eq!(h.backend.count(|c| *c == Call::SetScanMode(0x03)), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_mode_request_rejected_by_agent() {
      let h = Harness::new().await;
      let agent = MockAgent::rejecting();
      h.adapter
         .register_agent(caller(":1.9"), Default::default(), agent)
         .await
         .unwrap();

      let result = h
         .adapter
         .request_mode(caller(":1.1"), Mode::Discoverable)
         .await;
      assert!(matches!(result, Err(Error::AuthenticationRejected)));
      assert_eq!(h.adapter.info().await.unwrap().mode_sessions, 0);
      assert_eq!(h.backend.count(|c| *c == Call::SetScanMode(0x03)), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discoverable_timeout_drops_to_connectable() {
      let h = Harness::new().await;
      h.adapter.set_discoverable_timeout(30).await.unwrap();

      let pending = tokio::spawn({
         let adapter = h.adapter.clone();
         async move { adapter.set_discoverable(true).await }
      });
      h.settle().await;
      h.mode_changed(0x03).await;
      assert!(matches!(pending.await.unwrap(), Ok(())));
      assert_eq!(h.store.settings().unwrap().mode, Some(Mode::Discoverable));

      tokio::time::sleep(Duration::from_secs(31)).await;
      assert_eq!(h.backend.count(|c| *c == Call::SetScanMode(0x02)), 2);
      assert_eq!(h.store.settings().unwrap().mode, Some(Mode::Connectable));
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_sessions_stop_once() {
      let h = Harness::new().await;
      let callers: Vec<_> = (0..3).map(|i| caller(&format!(":1.{i}"))).collect();
      for c in &callers {
         h.adapter.start_discovery(c.clone()).await.unwrap();
      }
      // Re-acquiring only bumps the refcount
      h.adapter.start_discovery(callers[0].clone()).await.unwrap();
      assert_eq!(h.backend.count(|c| *c == Call::StartDiscovery), 1);

      h.adapter.stop_discovery(callers[0].clone()).await.unwrap();
      h.adapter.stop_discovery(callers[0].clone()).await.unwrap();
      h.adapter.stop_discovery(callers[1].clone()).await.unwrap();
      assert_eq!(h.backend.count(|c| *c == Call::StopDiscovery), 0);
      assert_eq!(h.adapter.info().await.unwrap().discovery_sessions, 1);

      h.manager.caller_exited(callers[2].clone()).await.unwrap();
      h.settle().await;
      assert_eq!(h.backend.count(|c| *c == Call::StopDiscovery), 1);
      assert!(matches!(
         h.adapter.stop_discovery(callers[2].clone()).await,
         Err(Error::NotAuthorized)
      ));
      assert_eq!(h.backend.count(|c| *c == Call::StopDiscovery), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_burst_resolves_names_by_signal_strength() {
      let h = Harness::new().await;
      h.adapter.start_discovery(caller(":1.1")).await.unwrap();
      h.discovering(true).await;

      let weak = addr(1);
      let strong = addr(2);
      let named = addr(3);
      h.found(weak, -80, &[]).await;
      h.found(strong, -40, &[]).await;
      h.found(named, -60, &[0x03, 0x09, b'h', b'i']).await;

      let found = h.adapter.found_devices().await.unwrap();
      let order: Vec<_> = found.iter().map(|f| f.address).collect();
      assert_eq!(order, vec![strong, named, weak]);

      h.discovering(false).await;
      assert_eq!(h.backend.last_resolve(), Some(strong));
      h.remote_name(strong, Some("speaker")).await;
      assert_eq!(h.backend.last_resolve(), Some(weak));
      h.remote_name(weak, None).await;
      assert_eq!(h.backend.count(|c| matches!(c, Call::ResolveName(_))), 2);

      // The burst restarts after the configured interval
      tokio::time::sleep(Duration::from_secs(3)).await;
      assert_eq!(h.backend.count(|c| *c == Call::StartDiscovery), 2);

      // Devices not seen again during the next burst disappear
      h.discovering(true).await;
      h.found(strong, -42, &[]).await;
      h.discovering(false).await;
      let gone = h.events.disappeared();
      assert!(gone.contains(&weak) && gone.contains(&named));
      assert!(!gone.contains(&strong));
   }

   #[tokio::test(start_paused = true)]
   async fn test_last_release_between_bursts_only_disarms() {
      let h = Harness::new().await;
      let who = caller(":1.1");
      h.adapter.start_discovery(who.clone()).await.unwrap();
      h.discovering(true).await;
      h.discovering(false).await;

      h.adapter.stop_discovery(who).await.unwrap();
      tokio::time::sleep(Duration::from_secs(10)).await;
      assert_eq!(h.backend.count(|c| *c == Call::StopDiscovery), 0);
      assert_eq!(h.backend.count(|c| *c == Call::StartDiscovery), 1);
      assert!(!h.adapter.info().await.unwrap().discovering);
   }

   #[tokio::test(start_paused = true)]
   async fn test_agent_registration_is_exclusive() {
      let h = Harness::new().await;
      let agent = MockAgent::accepting();
      h.adapter
         .register_agent(caller(":1.1"), Default::default(), agent.clone())
         .await
         .unwrap();
      assert!(matches!(
         h.adapter
            .register_agent(caller(":1.2"), Default::default(), agent.clone())
            .await,
         Err(Error::AlreadyExists)
      ));
      assert!(matches!(
         h.adapter.unregister_agent(caller(":1.2")).await,
         Err(Error::DoesNotExist)
      ));

      h.manager.caller_exited(caller(":1.1")).await.unwrap();
      h.settle().await;
      assert!(agent.released());
      h.adapter
         .register_agent(caller(":1.2"), Default::default(), agent)
         .await
         .unwrap();
   }

   #[tokio::test(start_paused = true)]
   async fn test_requests_need_power() {
      let h = Harness::unpowered().await;
      assert!(matches!(
         h.adapter.start_discovery(caller(":1.1")).await,
         Err(Error::NotReady)
      ));
      assert!(matches!(
         h.adapter.request_mode(caller(":1.1"), Mode::Discoverable).await,
         Err(Error::NotReady)
      ));
      assert!(matches!(
         h.adapter.create_device(caller(":1.1"), addr(1)).await,
         Err(Error::NotReady)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_name_is_validated_and_persisted() {
      let h = Harness::new().await;
      assert!(matches!(
         h.adapter.set_name("").await,
         Err(Error::InvalidArguments(_))
      ));
      h.adapter.set_name("kitchen").await.unwrap();
      assert_eq!(h.adapter.info().await.unwrap().name, "kitchen");
      assert_eq!(h.store.settings().unwrap().name.as_deref(), Some("kitchen"));
      assert!(h.backend.calls().contains(&Call::SetName("kitchen".into())));
   }

   #[tokio::test(start_paused = true)]
   async fn test_found_devices_order_positive_rssi_first() {
      let h = Harness::new().await;
      h.adapter.start_discovery(caller(":1.1")).await.unwrap();
      h.discovering(true).await;

      let near = addr(1);
      let far = addr(2);
      h.found(far, -30, &[]).await;
      h.found(near, 4, &[]).await;

      let found = h.adapter.found_devices().await.unwrap();
      let order: Vec<_> = found.iter().map(|f| f.address).collect();
      assert_eq!(order, vec![near, far]);
   }
}
