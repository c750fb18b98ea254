//! Adapter and device lifecycle manager.
//!
//! All adapter and device state lives in one actor task. Callers talk to it
//! through [`Manager`], [`AdapterHandle`] and [`DeviceHandle`]; the controller
//! backend feeds it through [`Dispatcher`](crate::dispatcher::Dispatcher).
//! Long-running protocol steps are spawned and post their outcome back on a
//! loopback queue that the actor polls before its inbox.

use std::{
   collections::HashMap,
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};
use uuid::Uuid;

use crate::{
   adapter::{Adapter, AdapterInfo, FoundDevice, Mode},
   address::{AdapterId, Address},
   agent::{AgentRef, RegisteredAgent},
   auth::AgentAnswer,
   backend::{AttLink, Backend, BackendEvent, IoCapability, PrimaryService, SdpRecord, Transport},
   config::Config,
   device::DeviceInfo,
   dispatcher::Dispatcher,
   error::{Error, Result},
   event::{Event, EventSender, ObjectRef, Property, Value},
   profile::DriverRef,
   session::CallerId,
   storage::StoreRef,
   timer::{Task, Timer, TimerTarget},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Answers a caller, ignoring callers that went away.
pub(crate) fn answer<T>(reply: Reply<T>, result: Result<T>) {
   let _ = reply.send(result);
}

/// Collaborators the manager drives.
pub struct Services {
   pub backend: Arc<dyn Backend>,
   pub transport: Arc<dyn Transport>,
   pub store: StoreRef,
   pub events: EventSender,
   pub drivers: Vec<DriverRef>,
}

// === Commands ===

/// Parameters of a caller-initiated bonding.
pub(crate) struct BondingParams {
   pub(crate) caller: CallerId,
   pub(crate) device: Address,
   pub(crate) capability: IoCapability,
   /// Agent used for this bonding only.
   pub(crate) agent: Option<AgentRef>,
}

pub(crate) enum AdapterRequest {
   Info(Reply<AdapterInfo>),
   SetPowered(bool, Reply<()>),
   SetDiscoverable(bool, Reply<()>),
   SetPairable(bool, Reply<()>),
   SetDiscoverableTimeout(u32, Reply<()>),
   SetPairableTimeout(u32, Reply<()>),
   SetName(SmolStr, Reply<()>),
   RequestMode(CallerId, Mode, Reply<()>),
   ReleaseMode(CallerId, Reply<()>),
   StartDiscovery(CallerId, Reply<()>),
   StopDiscovery(CallerId, Reply<()>),
   FoundDevices(Reply<Vec<FoundDevice>>),
   RegisterAgent(RegisteredAgent, Reply<()>),
   UnregisterAgent(CallerId, Reply<()>),
   CreateDevice(CallerId, Address, Reply<()>),
   CreatePairedDevice(BondingParams, Reply<()>),
   CancelBonding(CallerId, Address, Reply<()>),
   RemoveDevice(Address, Reply<()>),
   ListDevices(Reply<Vec<Address>>),
}

impl AdapterRequest {
   /// Answers the request without running it.
   pub(crate) fn reject(self, err: Error) {
      match self {
         Self::Info(reply) => answer(reply, Err(err)),
         Self::FoundDevices(reply) => answer(reply, Err(err)),
         Self::ListDevices(reply) => answer(reply, Err(err)),
         Self::SetPowered(_, reply)
         | Self::SetDiscoverable(_, reply)
         | Self::SetPairable(_, reply)
         | Self::SetDiscoverableTimeout(_, reply)
         | Self::SetPairableTimeout(_, reply)
         | Self::SetName(_, reply)
         | Self::RequestMode(_, _, reply)
         | Self::ReleaseMode(_, reply)
         | Self::StartDiscovery(_, reply)
         | Self::StopDiscovery(_, reply)
         | Self::RegisterAgent(_, reply)
         | Self::UnregisterAgent(_, reply)
         | Self::CreateDevice(_, _, reply)
         | Self::CreatePairedDevice(_, reply)
         | Self::CancelBonding(_, _, reply)
         | Self::RemoveDevice(_, reply) => answer(reply, Err(err)),
      }
   }
}

pub(crate) enum DeviceRequest {
   Info(Reply<DeviceInfo>),
   DiscoverServices(CallerId, Option<Uuid>, Reply<Vec<SdpRecord>>),
   CancelDiscovery(CallerId, Reply<()>),
   Disconnect(Reply<()>),
   SetTrusted(bool, Reply<()>),
   SetBlocked(bool, Reply<()>),
   SetAlias(Option<SmolStr>, Reply<()>),
   ReadRssi(Reply<()>),
   RegisterAttio(Reply<u64>),
   UnregisterAttio(u64, Reply<()>),
}

impl DeviceRequest {
   pub(crate) fn reject(self, err: Error) {
      match self {
         Self::Info(reply) => answer(reply, Err(err)),
         Self::DiscoverServices(_, _, reply) => answer(reply, Err(err)),
         Self::RegisterAttio(reply) => answer(reply, Err(err)),
         Self::CancelDiscovery(_, reply)
         | Self::Disconnect(reply)
         | Self::SetTrusted(_, reply)
         | Self::SetBlocked(_, reply)
         | Self::SetAlias(_, reply)
         | Self::ReadRssi(reply)
         | Self::UnregisterAttio(_, reply) => answer(reply, Err(err)),
      }
   }
}

/// Which flow an ATT connect was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttPurpose {
   Browse(u64),
   Bonding(u64),
   Supervisor(u64),
}

/// Outcome of a spawned step, or a deferred follow-up.
pub(crate) enum Completion {
   ModeConfirmed {
      token: u64,
      result: Result<()>,
   },
   AgentAnswered {
      device: Address,
      request: u64,
      answer: Result<AgentAnswer>,
   },
   SdpSearched {
      device: Address,
      browse: u64,
      result: Result<Vec<SdpRecord>>,
   },
   AttConnected {
      device: Address,
      purpose: AttPurpose,
      result: Result<AttLink>,
   },
   PrimariesDiscovered {
      device: Address,
      browse: u64,
      result: Result<Vec<PrimaryService>>,
   },
   SecurityRaised {
      device: Address,
      bonding: u64,
      result: Result<()>,
   },
   PurgeDevice(Address),
}

pub(crate) enum Command {
   ListAdapters(oneshot::Sender<Vec<AdapterId>>),
   Adapter(AdapterId, AdapterRequest),
   Device(AdapterId, Address, DeviceRequest),
   Backend(BackendEvent),
   CallerExited(CallerId),
   TimerFired(TimerTarget, u64),
   Completed(AdapterId, Completion),
}

// === Public handles ===

/// Handle to the manager actor.
///
/// Cheap to clone; the actor stops once every handle (including dispatchers)
/// has been dropped.
#[derive(Clone)]
pub struct Manager {
   inbox: mpsc::Sender<Command>,
}

impl Manager {
   /// Spawns the manager actor on the current runtime.
   pub fn spawn(config: Config, services: Services) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let ctx = Context {
         config,
         backend: services.backend,
         transport: services.transport,
         store: services.store,
         events: services.events,
         drivers: services.drivers,
         loopback: loopback_tx,
         next_id: AtomicU64::new(1),
      };
      tokio::spawn(
         ManagerActor {
            ctx,
            adapters: HashMap::new(),
            command_rx,
            loopback_rx,
         }
         .run(),
      );
      Self { inbox: command_tx }
   }

   /// Entry point for controller events.
   pub fn dispatcher(&self) -> Dispatcher {
      Dispatcher::new(self.inbox.clone())
   }

   pub fn adapter(&self, id: AdapterId) -> AdapterHandle {
      AdapterHandle {
         id,
         inbox: self.inbox.clone(),
      }
   }

   pub async fn adapters(&self) -> Result<Vec<AdapterId>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::ListAdapters(tx))
         .await
         .map_err(|_| Error::ManagerShutdown)?;
      rx.await.map_err(|_| Error::ManagerShutdown)
   }

   /// Releases everything `caller` holds: sessions, agents, and in-flight
   /// bonding or browse requests.
   pub async fn caller_exited(&self, caller: CallerId) -> Result<()> {
      self
         .inbox
         .send(Command::CallerExited(caller))
         .await
         .map_err(|_| Error::ManagerShutdown)
   }
}

async fn request<T>(
   inbox: &mpsc::Sender<Command>,
   make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
   let (tx, rx) = oneshot::channel();
   inbox
      .send(make(tx))
      .await
      .map_err(|_| Error::ManagerShutdown)?;
   rx.await.map_err(|_| Error::ManagerShutdown)?
}

/// Handle to one local controller.
#[derive(Clone)]
pub struct AdapterHandle {
   id: AdapterId,
   inbox: mpsc::Sender<Command>,
}

impl AdapterHandle {
   pub const fn id(&self) -> AdapterId {
      self.id
   }

   pub fn device(&self, address: Address) -> DeviceHandle {
      DeviceHandle {
         adapter: self.id,
         address,
         inbox: self.inbox.clone(),
      }
   }

   async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> AdapterRequest) -> Result<T> {
      request(&self.inbox, |reply| Command::Adapter(self.id, make(reply))).await
   }

   pub async fn info(&self) -> Result<AdapterInfo> {
      self.call(AdapterRequest::Info).await
   }

   /// Resolves once the controller confirms the new power state.
   pub async fn set_powered(&self, powered: bool) -> Result<()> {
      self.call(|r| AdapterRequest::SetPowered(powered, r)).await
   }

   pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
      self
         .call(|r| AdapterRequest::SetDiscoverable(discoverable, r))
         .await
   }

   pub async fn set_pairable(&self, pairable: bool) -> Result<()> {
      self.call(|r| AdapterRequest::SetPairable(pairable, r)).await
   }

   pub async fn set_discoverable_timeout(&self, seconds: u32) -> Result<()> {
      self
         .call(|r| AdapterRequest::SetDiscoverableTimeout(seconds, r))
         .await
   }

   pub async fn set_pairable_timeout(&self, seconds: u32) -> Result<()> {
      self
         .call(|r| AdapterRequest::SetPairableTimeout(seconds, r))
         .await
   }

   pub async fn set_name(&self, name: impl Into<SmolStr>) -> Result<()> {
      let name = name.into();
      self.call(|r| AdapterRequest::SetName(name, r)).await
   }

   /// Opens (or re-references) the caller's mode session.
   pub async fn request_mode(&self, caller: CallerId, mode: Mode) -> Result<()> {
      self
         .call(|r| AdapterRequest::RequestMode(caller, mode, r))
         .await
   }

   pub async fn release_mode(&self, caller: CallerId) -> Result<()> {
      self.call(|r| AdapterRequest::ReleaseMode(caller, r)).await
   }

   pub async fn start_discovery(&self, caller: CallerId) -> Result<()> {
      self.call(|r| AdapterRequest::StartDiscovery(caller, r)).await
   }

   pub async fn stop_discovery(&self, caller: CallerId) -> Result<()> {
      self.call(|r| AdapterRequest::StopDiscovery(caller, r)).await
   }

   /// Devices seen during the current discovery, strongest signal first.
   pub async fn found_devices(&self) -> Result<Vec<FoundDevice>> {
      self.call(AdapterRequest::FoundDevices).await
   }

   pub async fn register_agent(
      &self,
      owner: CallerId,
      capability: IoCapability,
      agent: AgentRef,
   ) -> Result<()> {
      let registered = RegisteredAgent {
         owner,
         capability,
         agent,
      };
      self
         .call(|r| AdapterRequest::RegisterAgent(registered, r))
         .await
   }

   pub async fn unregister_agent(&self, owner: CallerId) -> Result<()> {
      self.call(|r| AdapterRequest::UnregisterAgent(owner, r)).await
   }

   /// Creates a device and browses its services.
   pub async fn create_device(&self, caller: CallerId, device: Address) -> Result<()> {
      self
         .call(|r| AdapterRequest::CreateDevice(caller, device, r))
         .await
   }

   /// Bonds with `device`, then browses its services.
   pub async fn create_paired_device(
      &self,
      caller: CallerId,
      device: Address,
      capability: IoCapability,
      agent: Option<AgentRef>,
   ) -> Result<()> {
      let params = BondingParams {
         caller,
         device,
         capability,
         agent,
      };
      self
         .call(|r| AdapterRequest::CreatePairedDevice(params, r))
         .await
   }

   pub async fn cancel_bonding(&self, caller: CallerId, device: Address) -> Result<()> {
      self
         .call(|r| AdapterRequest::CancelBonding(caller, device, r))
         .await
   }

   pub async fn remove_device(&self, device: Address) -> Result<()> {
      self.call(|r| AdapterRequest::RemoveDevice(device, r)).await
   }

   pub async fn find_device(&self, device: Address) -> Result<DeviceInfo> {
      self.device(device).info().await
   }

   pub async fn list_devices(&self) -> Result<Vec<Address>> {
      self.call(AdapterRequest::ListDevices).await
   }
}

/// Handle to one remote device of an adapter.
#[derive(Clone)]
pub struct DeviceHandle {
   adapter: AdapterId,
   address: Address,
   inbox: mpsc::Sender<Command>,
}

impl DeviceHandle {
   pub const fn address(&self) -> Address {
      self.address
   }

   async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> DeviceRequest) -> Result<T> {
      request(&self.inbox, |reply| {
         Command::Device(self.adapter, self.address, make(reply))
      })
      .await
   }

   pub async fn info(&self) -> Result<DeviceInfo> {
      self.call(DeviceRequest::Info).await
   }

   /// Browses the device; `pattern` adds one UUID to the classic search.
   pub async fn discover_services(
      &self,
      caller: CallerId,
      pattern: Option<Uuid>,
   ) -> Result<Vec<SdpRecord>> {
      self
         .call(|r| DeviceRequest::DiscoverServices(caller, pattern, r))
         .await
   }

   pub async fn cancel_discovery(&self, caller: CallerId) -> Result<()> {
      self.call(|r| DeviceRequest::CancelDiscovery(caller, r)).await
   }

   /// Resolves once the link is down.
   pub async fn disconnect(&self) -> Result<()> {
      self.call(DeviceRequest::Disconnect).await
   }

   pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
      self.call(|r| DeviceRequest::SetTrusted(trusted, r)).await
   }

   pub async fn set_blocked(&self, blocked: bool) -> Result<()> {
      self.call(|r| DeviceRequest::SetBlocked(blocked, r)).await
   }

   pub async fn set_alias(&self, alias: Option<SmolStr>) -> Result<()> {
      self.call(|r| DeviceRequest::SetAlias(alias, r)).await
   }

   pub async fn read_rssi(&self) -> Result<()> {
      self.call(DeviceRequest::ReadRssi).await
   }

   /// Registers interest in a persistent LE link; returns a token for
   /// [`unregister_attio`](Self::unregister_attio).
   pub async fn register_attio(&self) -> Result<u64> {
      self.call(DeviceRequest::RegisterAttio).await
   }

   pub async fn unregister_attio(&self, token: u64) -> Result<()> {
      self
         .call(|r| DeviceRequest::UnregisterAttio(token, r))
         .await
   }
}

// === Actor ===

/// State shared by every adapter of the actor.
pub(crate) struct Context {
   pub(crate) config: Config,
   pub(crate) backend: Arc<dyn Backend>,
   pub(crate) transport: Arc<dyn Transport>,
   pub(crate) store: StoreRef,
   pub(crate) events: EventSender,
   pub(crate) drivers: Vec<DriverRef>,
   loopback: mpsc::Sender<Command>,
   next_id: AtomicU64,
}

impl Context {
   /// Unique id for requests, tokens and timer generations.
   pub(crate) fn next_id(&self) -> u64 {
      self.next_id.fetch_add(1, Ordering::Relaxed)
   }

   pub(crate) fn emit(&self, event: Event) {
      self.events.emit(event);
   }

   pub(crate) fn adapter_changed(&self, adapter: AdapterId, property: Property, value: Value) {
      self.emit(Event::PropertyChanged {
         object: ObjectRef::Adapter(adapter),
         property,
         value,
      });
   }

   pub(crate) fn device_changed(
      &self,
      adapter: AdapterId,
      device: Address,
      property: Property,
      value: Value,
   ) {
      self.emit(Event::PropertyChanged {
         object: ObjectRef::Device(adapter, device),
         property,
         value,
      });
   }

   /// Queues a follow-up for the next turn of the actor loop.
   pub(crate) fn post(&self, command: Command) {
      if let Err(mpsc::error::TrySendError::Full(command)) = self.loopback.try_send(command) {
         let loopback = self.loopback.clone();
         tokio::spawn(async move {
            let _ = loopback.send(command).await;
         });
      }
   }

   /// Runs `step` off the actor and posts its outcome to the loopback queue.
   pub(crate) fn spawn<F>(&self, step: F) -> Task
   where
      F: Future<Output = Command> + Send + 'static,
   {
      let loopback = self.loopback.clone();
      Task::new(tokio::spawn(async move {
         let command = step.await;
         let _ = loopback.send(command).await;
      }))
   }

   pub(crate) fn arm(&self, delay: Duration, target: TimerTarget) -> Timer {
      Timer::spawn(&self.loopback, self.next_id(), delay, target)
   }
}

pub(crate) struct ManagerActor {
   pub(crate) ctx: Context,
   pub(crate) adapters: HashMap<AdapterId, Adapter>,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<Command>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Lifecycle manager starting up");

      loop {
         select! {
            biased;
            Some(cmd) = self.loopback_rx.recv() => self.handle_command(cmd),
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Lifecycle manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
         }
      }

      for adapter in self.adapters.values_mut() {
         adapter.stop(&self.ctx);
      }
   }

   fn handle_command(&mut self, cmd: Command) {
      match cmd {
         Command::ListAdapters(reply) => {
            let mut ids: Vec<_> = self.adapters.keys().copied().collect();
            ids.sort();
            let _ = reply.send(ids);
         },
         Command::Adapter(id, req) => match self.adapters.get_mut(&id) {
            Some(adapter) => adapter.handle_request(&self.ctx, req),
            None => req.reject(Error::DoesNotExist),
         },
         Command::Device(id, address, req) => match self.adapters.get_mut(&id) {
            Some(adapter) => adapter.handle_device_request(&self.ctx, address, req),
            None => req.reject(Error::DoesNotExist),
         },
         Command::Backend(event) => self.handle_backend_event(event),
         Command::CallerExited(caller) => {
            debug!("Caller {caller} exited");
            for adapter in self.adapters.values_mut() {
               adapter.caller_exited(&self.ctx, &caller);
            }
         },
         Command::TimerFired(target, generation) => {
            let Some(adapter) = self.adapters.get_mut(&target.adapter()) else {
               return;
            };
            adapter.on_timer(&self.ctx, target, generation);
         },
         Command::Completed(id, completion) => {
            let Some(adapter) = self.adapters.get_mut(&id) else {
               if let Completion::AttConnected {
                  result: Ok(link), ..
               } = completion
               {
                  self.ctx.transport.att_disconnect(link);
               }
               return;
            };
            adapter.on_completion(&self.ctx, completion);
         },
      }
   }

   pub(crate) fn add_adapter(
      &mut self,
      id: AdapterId,
      address: Address,
      class: u32,
      name: SmolStr,
      powered: bool,
   ) {
      if self.adapters.contains_key(&id) {
         debug!("{id}: already registered");
         return;
      }

      info!("{id}: controller {address} added");
      let mut adapter = Adapter::new(&self.ctx, id, address, class, name);
      self.ctx.emit(Event::AdapterAdded(id));
      adapter.restore_devices(&self.ctx);
      for driver in &self.ctx.drivers {
         for uuid in driver.local_uuids() {
            if let Err(e) = self.ctx.backend.add_uuid(id, *uuid) {
               warn!("{id}: failed to register {} service {uuid}: {e}", driver.name());
            }
         }
      }
      if powered {
         adapter.powered_on(&self.ctx);
      }
      self.adapters.insert(id, adapter);
   }

   pub(crate) fn remove_adapter(&mut self, id: AdapterId) {
      let Some(mut adapter) = self.adapters.remove(&id) else {
         return;
      };
      info!("{id}: controller removed");
      adapter.stop(&self.ctx);
      for driver in &self.ctx.drivers {
         for uuid in driver.local_uuids() {
            if let Err(e) = self.ctx.backend.remove_uuid(id, *uuid) {
               debug!("{id}: failed to unregister {} service {uuid}: {e}", driver.name());
            }
         }
      }
      self.ctx.emit(Event::AdapterRemoved(id));
   }
}
