//! D-Bus control plane.
//!
//! Each adapter is served at `/org/bluez/hciN` and each of its devices at
//! `/org/bluez/hciN/dev_XX_XX_XX_XX_XX_XX`. Method calls are forwarded to the
//! manager with the message sender as caller identity; manager events are
//! queued by [`DBusEvents`] and turned into signals by a background task.

use std::{str::FromStr, sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{sync::Notify, time};
use zbus::{
   Connection, ObjectServer, interface,
   message::Header,
   names::OwnedUniqueName,
   object_server::SignalEmitter,
   zvariant::{self, ObjectPath, OwnedObjectPath},
};

use crate::{
   adapter::Mode,
   address::{AdapterId, Address},
   agent::{Agent, AgentRef},
   backend::IoCapability,
   error::{Error, Result},
   event::{Event, EventBus, ObjectRef},
   manager::{AdapterHandle, DeviceHandle, Manager},
   session::CallerId,
};

const BASE_PATH: &str = "/org/bluez";
const AGENT_INTERFACE: &str = "org.bluez.Agent";
/// How often an idle emitter checks whether the manager is gone.
const IDLE_CHECK: Duration = Duration::from_secs(1);

pub fn adapter_path(adapter: AdapterId) -> String {
   format!("{BASE_PATH}/{adapter}")
}

pub fn device_path(adapter: AdapterId, device: Address) -> String {
   let address = device.to_string().replace(':', "_");
   format!("{}/dev_{address}", adapter_path(adapter))
}

/// Device address encoded in an object path.
pub fn parse_device_path(path: &str) -> Option<Address> {
   path.rsplit_once("/dev_")?.1.parse().ok()
}

fn object_path(path: String) -> zbus::Result<OwnedObjectPath> {
   Ok(OwnedObjectPath::try_from(path)?)
}

/// Errors returned to D-Bus callers.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub enum BluezError {
   #[zbus(error)]
   ZBus(zbus::Error),
   NotReady(String),
   InProgress(String),
   AlreadyExists(String),
   DoesNotExist(String),
   Canceled(String),
   ConnectionAttemptFailed(String),
   AuthenticationTimeout(String),
   AuthenticationRejected(String),
   AuthenticationCanceled(String),
   AuthenticationFailed(String),
   RepeatedAttempts(String),
   NotSupported(String),
   NotConnected(String),
   NotAuthorized(String),
   InvalidArguments(String),
   AgentNotAvailable(String),
   Failed(String),
}

impl From<Error> for BluezError {
   fn from(e: Error) -> Self {
      let message = e.to_string();
      match e {
         Error::NotReady => Self::NotReady(message),
         Error::AlreadyInProgress | Error::Busy => Self::InProgress(message),
         Error::AlreadyExists => Self::AlreadyExists(message),
         Error::DoesNotExist => Self::DoesNotExist(message),
         Error::Canceled => Self::Canceled(message),
         Error::ConnectionAttemptFailed(_) => Self::ConnectionAttemptFailed(message),
         Error::AuthenticationTimeout => Self::AuthenticationTimeout(message),
         Error::AuthenticationRejected => Self::AuthenticationRejected(message),
         Error::AuthenticationCanceled => Self::AuthenticationCanceled(message),
         Error::AuthenticationFailed | Error::Smp(_) => Self::AuthenticationFailed(message),
         Error::RepeatedAttempts => Self::RepeatedAttempts(message),
         Error::NotSupported => Self::NotSupported(message),
         Error::NotConnected => Self::NotConnected(message),
         Error::NotAuthorized => Self::NotAuthorized(message),
         Error::InvalidArguments(_) => Self::InvalidArguments(message),
         Error::AgentNotAvailable => Self::AgentNotAvailable(message),
         _ => Self::Failed(message),
      }
   }
}

/// Named `Result` so `#[interface]` recognizes fallible method replies.
mod reply {
   pub type Result<T> = std::result::Result<T, super::BluezError>;
}

fn invalid(what: impl std::fmt::Display) -> BluezError {
   BluezError::InvalidArguments(what.to_string())
}

fn sender(header: &Header<'_>) -> reply::Result<CallerId> {
   header
      .sender()
      .map(|name| CallerId::new(name.as_str()))
      .ok_or_else(|| BluezError::Failed("Message has no sender".into()))
}

fn parse_address(address: &str) -> reply::Result<Address> {
   address.parse().map_err(invalid)
}

// === Adapter ===

pub struct AdapterInterface {
   handle: AdapterHandle,
}

impl AdapterInterface {
   pub const fn new(handle: AdapterHandle) -> Self {
      Self { handle }
   }

   fn device_object(&self, device: Address) -> reply::Result<OwnedObjectPath> {
      object_path(device_path(self.handle.id(), device)).map_err(BluezError::ZBus)
   }
}

#[interface(name = "org.bluez.Adapter")]
impl AdapterInterface {
   async fn get_properties(&self) -> reply::Result<String> {
      Ok(self.handle.info().await?.to_json().to_string())
   }

   async fn set_property(&self, name: String, value: zvariant::Value<'_>) -> reply::Result<()> {
      match name.as_str() {
         "Name" => {
            let name = value.downcast_ref::<String>().map_err(invalid)?;
            self.handle.set_name(name).await?;
         },
         "Powered" => {
            let on = value.downcast_ref::<bool>().map_err(invalid)?;
            self.handle.set_powered(on).await?;
         },
         "Discoverable" => {
            let on = value.downcast_ref::<bool>().map_err(invalid)?;
            self.handle.set_discoverable(on).await?;
         },
         "Pairable" => {
            let on = value.downcast_ref::<bool>().map_err(invalid)?;
            self.handle.set_pairable(on).await?;
         },
         "DiscoverableTimeout" => {
            let seconds = value.downcast_ref::<u32>().map_err(invalid)?;
            self.handle.set_discoverable_timeout(seconds).await?;
         },
         "PairableTimeout" => {
            let seconds = value.downcast_ref::<u32>().map_err(invalid)?;
            self.handle.set_pairable_timeout(seconds).await?;
         },
         _ => return Err(invalid(format!("Unknown property: {name}"))),
      }
      Ok(())
   }

   async fn request_session(&self, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      let caller = sender(&header)?;
      Ok(self.handle.request_mode(caller, Mode::Connectable).await?)
   }

   async fn request_mode(&self, mode: String, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      let caller = sender(&header)?;
      let mode = Mode::from_str(&mode).map_err(invalid)?;
      Ok(self.handle.request_mode(caller, mode).await?)
   }

   async fn release_session(&self, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      Ok(self.handle.release_mode(sender(&header)?).await?)
   }

   async fn start_discovery(&self, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      Ok(self.handle.start_discovery(sender(&header)?).await?)
   }

   async fn stop_discovery(&self, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      Ok(self.handle.stop_discovery(sender(&header)?).await?)
   }

   async fn find_device(&self, address: String) -> reply::Result<OwnedObjectPath> {
      let device = parse_address(&address)?;
      self.handle.find_device(device).await?;
      self.device_object(device)
   }

   async fn list_devices(&self) -> reply::Result<Vec<OwnedObjectPath>> {
      self
         .handle
         .list_devices()
         .await?
         .into_iter()
         .map(|device| self.device_object(device))
         .collect()
   }

   async fn create_device(
      &self,
      address: String,
      #[zbus(header)] header: Header<'_>,
   ) -> reply::Result<OwnedObjectPath> {
      let device = parse_address(&address)?;
      self.handle.create_device(sender(&header)?, device).await?;
      self.device_object(device)
   }

   async fn create_paired_device(
      &self,
      address: String,
      agent: ObjectPath<'_>,
      capability: String,
      #[zbus(header)] header: Header<'_>,
      #[zbus(connection)] connection: &Connection,
   ) -> reply::Result<OwnedObjectPath> {
      let device = parse_address(&address)?;
      let caller = sender(&header)?;
      let capability = parse_capability(&capability)?;
      let agent = DBusAgent::for_caller(connection, &header, agent, self.handle.id())?;
      self
         .handle
         .create_paired_device(caller, device, capability, Some(agent))
         .await?;
      self.device_object(device)
   }

   async fn cancel_device_creation(
      &self,
      address: String,
      #[zbus(header)] header: Header<'_>,
   ) -> reply::Result<()> {
      let device = parse_address(&address)?;
      Ok(self.handle.cancel_bonding(sender(&header)?, device).await?)
   }

   async fn remove_device(&self, device: ObjectPath<'_>) -> reply::Result<()> {
      let device = parse_device_path(device.as_str()).ok_or_else(|| invalid("Invalid device path"))?;
      Ok(self.handle.remove_device(device).await?)
   }

   async fn register_agent(
      &self,
      agent: ObjectPath<'_>,
      capability: String,
      #[zbus(header)] header: Header<'_>,
      #[zbus(connection)] connection: &Connection,
   ) -> reply::Result<()> {
      let caller = sender(&header)?;
      let capability = parse_capability(&capability)?;
      let agent = DBusAgent::for_caller(connection, &header, agent, self.handle.id())?;
      Ok(self.handle.register_agent(caller, capability, agent).await?)
   }

   async fn unregister_agent(
      &self,
      _agent: ObjectPath<'_>,
      #[zbus(header)] header: Header<'_>,
   ) -> reply::Result<()> {
      Ok(self.handle.unregister_agent(sender(&header)?).await?)
   }

   #[zbus(signal)]
   pub async fn property_changed(
      emitter: &SignalEmitter<'_>,
      name: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(
      emitter: &SignalEmitter<'_>,
      address: &str,
      properties: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disappeared(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_created(emitter: &SignalEmitter<'_>, path: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_removed(emitter: &SignalEmitter<'_>, path: &str) -> zbus::Result<()>;
}

fn parse_capability(capability: &str) -> reply::Result<IoCapability> {
   if capability.is_empty() {
      return Ok(IoCapability::default());
   }
   IoCapability::from_str(capability).map_err(|_| invalid(format!("Invalid capability: {capability}")))
}

// === Device ===

pub struct DeviceInterface {
   handle: DeviceHandle,
}

impl DeviceInterface {
   pub const fn new(handle: DeviceHandle) -> Self {
      Self { handle }
   }
}

#[interface(name = "org.bluez.Device")]
impl DeviceInterface {
   async fn get_properties(&self) -> reply::Result<String> {
      Ok(self.handle.info().await?.to_json().to_string())
   }

   async fn set_property(&self, name: String, value: zvariant::Value<'_>) -> reply::Result<()> {
      match name.as_str() {
         "Trusted" => {
            let on = value.downcast_ref::<bool>().map_err(invalid)?;
            self.handle.set_trusted(on).await?;
         },
         "Blocked" => {
            let on = value.downcast_ref::<bool>().map_err(invalid)?;
            self.handle.set_blocked(on).await?;
         },
         "Alias" => {
            let alias = value.downcast_ref::<String>().map_err(invalid)?;
            self.handle.set_alias(Some(SmolStr::from(alias))).await?;
         },
         _ => return Err(invalid(format!("Unknown property: {name}"))),
      }
      Ok(())
   }

   /// Returns the records found as JSON.
   async fn discover_services(
      &self,
      pattern: String,
      #[zbus(header)] header: Header<'_>,
   ) -> reply::Result<String> {
      let pattern = if pattern.is_empty() {
         None
      } else {
         Some(pattern.parse().map_err(invalid)?)
      };
      let records = self
         .handle
         .discover_services(sender(&header)?, pattern)
         .await?;
      serde_json::to_string(&records).map_err(|e| BluezError::Failed(e.to_string()))
   }

   async fn cancel_discovery(&self, #[zbus(header)] header: Header<'_>) -> reply::Result<()> {
      Ok(self.handle.cancel_discovery(sender(&header)?).await?)
   }

   async fn disconnect(&self) -> reply::Result<()> {
      Ok(self.handle.disconnect().await?)
   }

   #[zbus(signal)]
   pub async fn property_changed(
      emitter: &SignalEmitter<'_>,
      name: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disconnect_requested(emitter: &SignalEmitter<'_>, removal: bool) -> zbus::Result<()>;
}

// === Agent proxy ===

/// An agent object exported by a D-Bus client.
#[derive(Clone)]
pub struct DBusAgent {
   connection: Connection,
   owner: OwnedUniqueName,
   path: OwnedObjectPath,
   adapter: AdapterId,
}

impl DBusAgent {
   fn for_caller(
      connection: &Connection,
      header: &Header<'_>,
      path: ObjectPath<'_>,
      adapter: AdapterId,
   ) -> reply::Result<AgentRef> {
      let owner = header
         .sender()
         .ok_or_else(|| BluezError::Failed("Message has no sender".into()))?;
      Ok(Arc::new(Self {
         connection: connection.clone(),
         owner: owner.to_owned().into(),
         path: path.into(),
         adapter,
      }))
   }

   fn call<B>(&self, method: &'static str, body: B) -> BoxFuture<'static, Result<zbus::Message>>
   where
      B: serde::Serialize + zvariant::DynamicType + Send + Sync + 'static,
   {
      let this = self.clone();
      async move {
         this
            .connection
            .call_method(
               Some(this.owner.as_str()),
               this.path.as_str(),
               Some(AGENT_INTERFACE),
               method,
               &body,
            )
            .await
            .map_err(agent_error)
      }
      .boxed()
   }

   fn device(&self, device: Address) -> Result<OwnedObjectPath> {
      Ok(object_path(device_path(self.adapter, device))?)
   }

   /// Calls `method` on the agent for `device`, expecting an empty reply.
   fn notify(&self, method: &'static str, device: Address) -> BoxFuture<'static, Result<()>> {
      match self.device(device) {
         Ok(path) => self.call(method, (path,)).map(|r| r.map(drop)).boxed(),
         Err(e) => futures::future::ready(Err(e)).boxed(),
      }
   }
}

/// Maps agent error replies onto authentication outcomes.
fn agent_error(e: zbus::Error) -> Error {
   let outcome = match &e {
      zbus::Error::MethodError(name, _, _) => match name.as_str() {
         "org.bluez.Error.Rejected" => Some(Error::AuthenticationRejected),
         "org.bluez.Error.Canceled" => Some(Error::AuthenticationCanceled),
         "org.freedesktop.DBus.Error.NoReply" => Some(Error::AuthenticationTimeout),
         _ => None,
      },
      _ => None,
   };
   outcome.unwrap_or_else(|| e.into())
}

impl Agent for DBusAgent {
   fn request_pincode(&self, device: Address) -> BoxFuture<'static, Result<SmolStr>> {
      let path = self.device(device);
      let this = self.clone();
      async move {
         let reply = this.call("RequestPinCode", (path?,)).await?;
         let pin: String = reply.body().deserialize()?;
         Ok(SmolStr::from(pin))
      }
      .boxed()
   }

   fn request_passkey(&self, device: Address) -> BoxFuture<'static, Result<u32>> {
      let path = self.device(device);
      let this = self.clone();
      async move {
         let reply = this.call("RequestPasskey", (path?,)).await?;
         Ok(reply.body().deserialize::<u32>()?)
      }
      .boxed()
   }

   fn request_confirmation(&self, device: Address, passkey: u32) -> BoxFuture<'static, Result<()>> {
      let path = self.device(device);
      let this = self.clone();
      async move {
         this.call("RequestConfirmation", (path?, passkey)).await?;
         Ok(())
      }
      .boxed()
   }

   fn request_authorization(&self, device: Address) -> BoxFuture<'static, Result<()>> {
      self.notify("RequestAuthorization", device)
   }

   fn display_passkey(&self, device: Address, passkey: u32) -> BoxFuture<'static, Result<()>> {
      let path = self.device(device);
      let this = self.clone();
      async move {
         this.call("DisplayPasskey", (path?, passkey)).await?;
         Ok(())
      }
      .boxed()
   }

   fn confirm_mode_change(&self, mode: Mode) -> BoxFuture<'static, Result<()>> {
      self
         .call("ConfirmModeChange", (mode.to_string(),))
         .map(|r| r.map(drop))
         .boxed()
   }

   fn cancel(&self) {
      tokio::spawn(self.call("Cancel", ()).map(|r| {
         if let Err(e) = r {
            debug!("Agent cancel failed: {e}");
         }
      }));
   }

   fn release(&self) {
      tokio::spawn(self.call("Release", ()).map(|r| {
         if let Err(e) = r {
            debug!("Agent release failed: {e}");
         }
      }));
   }
}

// === Caller tracking ===

/// Exports the manager on `connection`.
///
/// `events` must be the bus the manager was spawned with.
pub async fn serve(connection: &Connection, manager: &Manager, events: Arc<DBusEvents>) -> Result<()> {
   watch_callers(connection, manager.clone()).await?;
   events.spawn_emitter(connection.clone(), manager.clone());
   info!("Serving adapters under {BASE_PATH}");
   Ok(())
}

/// Reports callers whose bus connection went away to the manager.
pub async fn watch_callers(connection: &Connection, manager: Manager) -> Result<()> {
   let proxy = zbus::fdo::DBusProxy::new(connection).await?;
   let mut changes = proxy.receive_name_owner_changed().await?;
   tokio::spawn(async move {
      while let Some(signal) = changes.next().await {
         let Ok(args) = signal.args() else {
            continue;
         };
         if !args.name().as_str().starts_with(':') || args.new_owner().is_some() {
            continue;
         }
         let caller = CallerId::new(args.name().as_str());
         if manager.caller_exited(caller).await.is_err() {
            break;
         }
      }
   });
   Ok(())
}

// === Signals ===

/// Event bus that forwards manager events as D-Bus signals.
pub struct DBusEvents {
   queue: SegQueue<Event>,
   notifier: Notify,
}

impl DBusEvents {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Moves queued events into `batch`, waiting while the queue is empty.
   /// Returns `false` once nothing can emit any more.
   async fn drain(self: &Arc<Self>, batch: &mut Vec<Event>) -> bool {
      loop {
         batch.extend(std::iter::from_fn(|| self.queue.pop()));
         if !batch.is_empty() {
            return true;
         }
         if Arc::strong_count(self) == 1 {
            return false;
         }
         let _ = time::timeout(IDLE_CHECK, self.notifier.notified()).await;
      }
   }

   /// Exports objects and emits signals for as long as the manager runs.
   pub fn spawn_emitter(self: Arc<Self>, connection: Connection, manager: Manager) {
      tokio::spawn(async move {
         let server = connection.object_server();
         let mut batch = Vec::new();
         while self.drain(&mut batch).await {
            for event in batch.drain(..) {
               if let Err(e) = forward(server, &manager, event).await {
                  warn!("Error forwarding event: {e}");
               }
            }
         }
         info!("Event forwarding stopped");
      });
   }
}

impl EventBus for DBusEvents {
   fn emit(&self, event: Event) {
      self.queue.push(event);
      self.notifier.notify_one();
   }
}

async fn forward(server: &ObjectServer, manager: &Manager, event: Event) -> Result<()> {
   match event {
      Event::AdapterAdded(id) => {
         server
            .at(adapter_path(id), AdapterInterface::new(manager.adapter(id)))
            .await?;
      },
      Event::AdapterRemoved(id) => {
         server.remove::<AdapterInterface, _>(adapter_path(id)).await?;
      },
      Event::DeviceCreated { adapter, device } => {
         let path = device_path(adapter, device);
         let handle = manager.adapter(adapter).device(device);
         server.at(path.as_str(), DeviceInterface::new(handle)).await?;
         let iface = server
            .interface::<_, AdapterInterface>(adapter_path(adapter))
            .await?;
         iface.device_created(&path).await?;
      },
      Event::DeviceRemoved { adapter, device } => {
         let path = device_path(adapter, device);
         server.remove::<DeviceInterface, _>(path.as_str()).await?;
         let iface = server
            .interface::<_, AdapterInterface>(adapter_path(adapter))
            .await?;
         iface.device_removed(&path).await?;
      },
      Event::DeviceFound { adapter, device } => {
         let iface = server
            .interface::<_, AdapterInterface>(adapter_path(adapter))
            .await?;
         iface
            .device_found(&device.address.to_string(), &device.to_json().to_string())
            .await?;
      },
      Event::DeviceDisappeared { adapter, device } => {
         let iface = server
            .interface::<_, AdapterInterface>(adapter_path(adapter))
            .await?;
         iface.device_disappeared(&device.to_string()).await?;
      },
      Event::DisconnectRequested {
         adapter,
         device,
         removal,
      } => {
         let iface = server
            .interface::<_, DeviceInterface>(device_path(adapter, device))
            .await?;
         iface.disconnect_requested(removal).await?;
      },
      Event::PropertyChanged {
         object,
         property,
         value,
      } => {
         let name: &'static str = property.into();
         let value = serde_json::to_value(&value)
            .map(|v| v.to_string())
            .unwrap_or_default();
         match object {
            ObjectRef::Adapter(id) => {
               let iface = server.interface::<_, AdapterInterface>(adapter_path(id)).await?;
               iface.property_changed(name, &value).await?;
            },
            ObjectRef::Device(adapter, device) => {
               let iface = server
                  .interface::<_, DeviceInterface>(device_path(adapter, device))
                  .await?;
               iface.property_changed(name, &value).await?;
            },
         }
      },
   }
   Ok(())
}
