//! Recording mocks and a harness that runs a manager with one controller.

use std::{
   collections::{HashMap, VecDeque},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
   },
   time::Duration,
};

use futures::{
   FutureExt,
   future::{self, BoxFuture},
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
   adapter::Mode,
   address::{AdapterId, Address, AddressType},
   agent::Agent,
   backend::{
      AttLink, Backend, BackendEvent, IoCapability, LinkKey, LongTermKey, PrimaryService,
      SdpRecord, SecurityLevel, Transport,
   },
   config::Config,
   dispatcher::Dispatcher,
   error::{Error, Result},
   event::{Event, EventBus},
   manager::{AdapterHandle, Manager, Services},
   profile::{DriverRef, ProfileDriver},
   session::CallerId,
   storage::{AdapterSettings, DeviceRecord, MemoryStore, Store},
};

pub(crate) const ADAPTER: AdapterId = AdapterId(0);
const ADAPTER_ADDRESS: Address = Address([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);

pub(crate) fn addr(n: u8) -> Address {
   Address([0x00, 0x11, 0x22, 0x33, 0x44, n])
}

pub(crate) fn caller(name: &str) -> CallerId {
   CallerId::new(name)
}

fn init_logging() {
   let _ = env_logger::builder().is_test(true).try_init();
}

// === Backend ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
   SetPowered(bool),
   SetScanMode(u8),
   SetPairable(bool),
   SetName(SmolStr),
   StartDiscovery,
   StopDiscovery,
   ResolveName(Address),
   CreateBonding(Address),
   CancelBonding(Address),
   RemoveBonding(Address),
   PincodeReply(Address, Option<SmolStr>),
   PasskeyReply(Address, Option<u32>),
   ConfirmReply(Address, bool),
   Disconnect(Address),
   ReadRssi(Address),
   AddUuid(Uuid),
   RemoveUuid(Uuid),
   BlockDevice(Address),
   UnblockDevice(Address),
   LoadKeys(usize),
   LoadLongTermKeys(usize),
}

#[derive(Default)]
pub(crate) struct MockBackend {
   calls: Mutex<Vec<Call>>,
}

impl MockBackend {
   fn record(&self, call: Call) -> Result<()> {
      self.calls.lock().push(call);
      Ok(())
   }

   pub(crate) fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
      self.calls.lock().iter().filter(|c| pred(c)).count()
   }

   pub(crate) fn last_resolve(&self) -> Option<Address> {
      self.calls.lock().iter().rev().find_map(|c| match c {
         Call::ResolveName(address) => Some(*address),
         _ => None,
      })
   }
}

impl Backend for MockBackend {
   fn set_powered(&self, _: AdapterId, powered: bool) -> Result<()> {
      self.record(Call::SetPowered(powered))
   }

   fn set_scan_mode(&self, _: AdapterId, scan_mask: u8) -> Result<()> {
      self.record(Call::SetScanMode(scan_mask))
   }

   fn set_pairable(&self, _: AdapterId, pairable: bool) -> Result<()> {
      self.record(Call::SetPairable(pairable))
   }

   fn set_name(&self, _: AdapterId, name: &str) -> Result<()> {
      self.record(Call::SetName(name.into()))
   }

   fn start_discovery(&self, _: AdapterId) -> Result<()> {
      self.record(Call::StartDiscovery)
   }

   fn stop_discovery(&self, _: AdapterId) -> Result<()> {
      self.record(Call::StopDiscovery)
   }

   fn resolve_name(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::ResolveName(device))
   }

   fn create_bonding(&self, _: AdapterId, device: Address, _: IoCapability) -> Result<()> {
      self.record(Call::CreateBonding(device))
   }

   fn cancel_bonding(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::CancelBonding(device))
   }

   fn remove_bonding(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::RemoveBonding(device))
   }

   fn pincode_reply(&self, _: AdapterId, device: Address, pin: Option<&str>) -> Result<()> {
      self.record(Call::PincodeReply(device, pin.map(SmolStr::new)))
   }

   fn confirm_reply(&self, _: AdapterId, device: Address, accept: bool) -> Result<()> {
      self.record(Call::ConfirmReply(device, accept))
   }

   fn passkey_reply(&self, _: AdapterId, device: Address, passkey: Option<u32>) -> Result<()> {
      self.record(Call::PasskeyReply(device, passkey))
   }

   fn disconnect(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::Disconnect(device))
   }

   fn read_rssi(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::ReadRssi(device))
   }

   fn add_uuid(&self, _: AdapterId, uuid: Uuid) -> Result<()> {
      self.record(Call::AddUuid(uuid))
   }

   fn remove_uuid(&self, _: AdapterId, uuid: Uuid) -> Result<()> {
      self.record(Call::RemoveUuid(uuid))
   }

   fn block_device(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::BlockDevice(device))
   }

   fn unblock_device(&self, _: AdapterId, device: Address) -> Result<()> {
      self.record(Call::UnblockDevice(device))
   }

   fn load_keys(&self, _: AdapterId, keys: &[(Address, LinkKey)]) -> Result<()> {
      self.record(Call::LoadKeys(keys.len()))
   }

   fn load_long_term_keys(&self, _: AdapterId, keys: &[(Address, LongTermKey)]) -> Result<()> {
      self.record(Call::LoadLongTermKeys(keys.len()))
   }
}

// === Transport ===

#[derive(Default)]
pub(crate) struct MockTransport {
   records: Mutex<HashMap<Uuid, Vec<SdpRecord>>>,
   sdp_failures: Mutex<VecDeque<Error>>,
   hold_sdp: AtomicBool,
   sdp_queries: AtomicUsize,
   primaries: Mutex<Vec<PrimaryService>>,
   fail_connects: AtomicBool,
   connect_levels: Mutex<Vec<SecurityLevel>>,
   security_result: Mutex<Option<Error>>,
   security_levels: Mutex<Vec<SecurityLevel>>,
   disconnects: AtomicUsize,
   next_link: AtomicU64,
}

impl MockTransport {
   pub(crate) fn set_records(&self, uuid: Uuid, records: Vec<SdpRecord>) {
      self.records.lock().insert(uuid, records);
   }

   /// The next queries fail with these errors, in order.
   pub(crate) fn fail_sdp(&self, errors: Vec<Error>) {
      *self.sdp_failures.lock() = errors.into();
   }

   /// Queries never complete while held.
   pub(crate) fn hold_sdp(&self, hold: bool) {
      self.hold_sdp.store(hold, Ordering::SeqCst);
   }

   pub(crate) fn sdp_queries(&self) -> usize {
      self.sdp_queries.load(Ordering::SeqCst)
   }

   pub(crate) fn set_primaries(&self, primaries: Vec<PrimaryService>) {
      *self.primaries.lock() = primaries;
   }

   pub(crate) fn fail_connects(&self, fail: bool) {
      self.fail_connects.store(fail, Ordering::SeqCst);
   }

   pub(crate) fn connect_levels(&self) -> Vec<SecurityLevel> {
      self.connect_levels.lock().clone()
   }

   pub(crate) fn set_security_result(&self, result: Result<()>) {
      *self.security_result.lock() = result.err();
   }

   pub(crate) fn security_levels(&self) -> Vec<SecurityLevel> {
      self.security_levels.lock().clone()
   }

   pub(crate) fn disconnects(&self) -> usize {
      self.disconnects.load(Ordering::SeqCst)
   }
}

impl Transport for MockTransport {
   fn sdp_search(
      &self,
      _: Address,
      _: Address,
      uuid: Uuid,
   ) -> BoxFuture<'static, Result<Vec<SdpRecord>>> {
      self.sdp_queries.fetch_add(1, Ordering::SeqCst);
      if self.hold_sdp.load(Ordering::SeqCst) {
         return future::pending().boxed();
      }
      let result = match self.sdp_failures.lock().pop_front() {
         Some(err) => Err(err),
         None => Ok(self.records.lock().get(&uuid).cloned().unwrap_or_default()),
      };
      future::ready(result).boxed()
   }

   fn att_connect(
      &self,
      _: Address,
      device: Address,
      _: AddressType,
      security: SecurityLevel,
   ) -> BoxFuture<'static, Result<AttLink>> {
      self.connect_levels.lock().push(security);
      let result = if self.fail_connects.load(Ordering::SeqCst) {
         Err(Error::ConnectionAttemptFailed("Connection Timeout"))
      } else {
         Ok(AttLink {
            id: self.next_link.fetch_add(1, Ordering::SeqCst),
            peer: device,
         })
      };
      future::ready(result).boxed()
   }

   fn discover_primaries(&self, _: &AttLink) -> BoxFuture<'static, Result<Vec<PrimaryService>>> {
      future::ready(Ok(self.primaries.lock().clone())).boxed()
   }

   fn set_security(&self, _: &AttLink, level: SecurityLevel) -> BoxFuture<'static, Result<()>> {
      self.security_levels.lock().push(level);
      let result = match self.security_result.lock().clone() {
         Some(err) => Err(err),
         None => Ok(()),
      };
      future::ready(result).boxed()
   }

   fn att_disconnect(&self, _: AttLink) {
      self.disconnects.fetch_add(1, Ordering::SeqCst);
   }
}

// === Agent ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentMode {
   Accepting,
   Rejecting,
   Holding,
}

pub(crate) struct MockAgent {
   mode: AgentMode,
   mode_prompts: AtomicUsize,
   confirmations: Mutex<Vec<u32>>,
   authorizations: AtomicUsize,
   pin_requests: AtomicUsize,
   cancels: AtomicUsize,
   released: AtomicBool,
}

impl MockAgent {
   fn with_mode(mode: AgentMode) -> Arc<Self> {
      Arc::new(Self {
         mode,
         mode_prompts: AtomicUsize::new(0),
         confirmations: Mutex::new(Vec::new()),
         authorizations: AtomicUsize::new(0),
         pin_requests: AtomicUsize::new(0),
         cancels: AtomicUsize::new(0),
         released: AtomicBool::new(false),
      })
   }

   /// Answers PIN `0000`, passkey `123456` and accepts everything else.
   pub(crate) fn accepting() -> Arc<Self> {
      Self::with_mode(AgentMode::Accepting)
   }

   pub(crate) fn rejecting() -> Arc<Self> {
      Self::with_mode(AgentMode::Rejecting)
   }

   /// Never answers.
   pub(crate) fn holding() -> Arc<Self> {
      Self::with_mode(AgentMode::Holding)
   }

   fn respond<T: Send + 'static>(&self, accepted: T) -> BoxFuture<'static, Result<T>> {
      match self.mode {
         AgentMode::Accepting => future::ready(Ok(accepted)).boxed(),
         AgentMode::Rejecting => future::ready(Err(Error::AuthenticationRejected)).boxed(),
         AgentMode::Holding => future::pending().boxed(),
      }
   }

   pub(crate) fn mode_prompts(&self) -> usize {
      self.mode_prompts.load(Ordering::SeqCst)
   }

   pub(crate) fn confirmations(&self) -> Vec<u32> {
      self.confirmations.lock().clone()
   }

   pub(crate) fn authorizations(&self) -> usize {
      self.authorizations.load(Ordering::SeqCst)
   }

   pub(crate) fn pin_requests(&self) -> usize {
      self.pin_requests.load(Ordering::SeqCst)
   }

   pub(crate) fn cancels(&self) -> usize {
      self.cancels.load(Ordering::SeqCst)
   }

   pub(crate) fn released(&self) -> bool {
      self.released.load(Ordering::SeqCst)
   }
}

impl Agent for MockAgent {
   fn request_pincode(&self, _: Address) -> BoxFuture<'static, Result<SmolStr>> {
      self.pin_requests.fetch_add(1, Ordering::SeqCst);
      self.respond(SmolStr::new_static("0000"))
   }

   fn request_passkey(&self, _: Address) -> BoxFuture<'static, Result<u32>> {
      self.respond(123_456)
   }

   fn request_confirmation(&self, _: Address, passkey: u32) -> BoxFuture<'static, Result<()>> {
      self.confirmations.lock().push(passkey);
      self.respond(())
   }

   fn request_authorization(&self, _: Address) -> BoxFuture<'static, Result<()>> {
      self.authorizations.fetch_add(1, Ordering::SeqCst);
      self.respond(())
   }

   fn display_passkey(&self, _: Address, _: u32) -> BoxFuture<'static, Result<()>> {
      self.respond(())
   }

   fn confirm_mode_change(&self, _: Mode) -> BoxFuture<'static, Result<()>> {
      self.mode_prompts.fetch_add(1, Ordering::SeqCst);
      self.respond(())
   }

   fn cancel(&self) {
      self.cancels.fetch_add(1, Ordering::SeqCst);
   }

   fn release(&self) {
      self.released.store(true, Ordering::SeqCst);
   }
}

// === Profile driver ===

pub(crate) struct MockDriver {
   name: &'static str,
   uuids: Vec<Uuid>,
   active: AtomicBool,
   probes: Mutex<Vec<Address>>,
   removes: Mutex<Vec<Address>>,
}

impl MockDriver {
   pub(crate) fn new(name: &'static str, uuids: &[Uuid]) -> Arc<Self> {
      Arc::new(Self {
         name,
         uuids: uuids.to_vec(),
         active: AtomicBool::new(false),
         probes: Mutex::new(Vec::new()),
         removes: Mutex::new(Vec::new()),
      })
   }

   /// Reports live traffic on every bound device.
   pub(crate) fn set_active(&self, active: bool) {
      self.active.store(active, Ordering::SeqCst);
   }

   pub(crate) fn probes(&self, device: Address) -> usize {
      self.probes.lock().iter().filter(|d| **d == device).count()
   }

   pub(crate) fn removes(&self, device: Address) -> usize {
      self.removes.lock().iter().filter(|d| **d == device).count()
   }
}

impl ProfileDriver for MockDriver {
   fn name(&self) -> &str {
      self.name
   }

   fn remote_uuids(&self) -> &[Uuid] {
      &self.uuids
   }

   fn local_uuids(&self) -> &[Uuid] {
      &self.uuids
   }

   fn probe(&self, _: AdapterId, device: Address, _: &[Uuid]) -> Result<()> {
      self.probes.lock().push(device);
      Ok(())
   }

   fn remove(&self, _: AdapterId, device: Address) {
      self.removes.lock().push(device);
   }

   fn is_active(&self, _: AdapterId, _: Address) -> bool {
      self.active.load(Ordering::SeqCst)
   }
}

// === Events and storage ===

#[derive(Default)]
pub(crate) struct RecordingBus {
   events: Mutex<Vec<Event>>,
}

impl RecordingBus {
   pub(crate) fn all(&self) -> Vec<Event> {
      self.events.lock().clone()
   }

   pub(crate) fn disappeared(&self) -> Vec<Address> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            Event::DeviceDisappeared { device, .. } => Some(*device),
            _ => None,
         })
         .collect()
   }

   pub(crate) fn removed(&self) -> Vec<Address> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            Event::DeviceRemoved { device, .. } => Some(*device),
            _ => None,
         })
         .collect()
   }

   pub(crate) fn disconnect_requests(&self) -> Vec<(Address, bool)> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            Event::DisconnectRequested {
               device, removal, ..
            } => Some((*device, *removal)),
            _ => None,
         })
         .collect()
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: Event) {
      self.events.lock().push(event);
   }
}

/// Read access to what the harness adapter persisted.
pub(crate) struct StoredState {
   store: Arc<MemoryStore>,
}

impl StoredState {
   pub(crate) fn settings(&self) -> Option<AdapterSettings> {
      self.store.adapter_settings(ADAPTER_ADDRESS).ok().flatten()
   }

   pub(crate) fn record(&self, device: Address) -> Option<DeviceRecord> {
      self.store.device(ADAPTER_ADDRESS, device).ok().flatten()
   }
}

// === Harness ===

#[derive(Default)]
pub(crate) struct HarnessBuilder {
   drivers: Vec<DriverRef>,
   records: Vec<(Address, DeviceRecord)>,
   unpowered: bool,
}

impl HarnessBuilder {
   pub(crate) fn driver(mut self, driver: Arc<MockDriver>) -> Self {
      self.drivers.push(driver);
      self
   }

   /// Stores `record` before the controller shows up.
   pub(crate) fn record(mut self, device: Address, record: DeviceRecord) -> Self {
      self.records.push((device, record));
      self
   }

   pub(crate) async fn build(self) -> Harness {
      init_logging();
      let store = Arc::new(MemoryStore::new());
      for (device, record) in &self.records {
         store
            .store_device(ADAPTER_ADDRESS, *device, record)
            .unwrap();
      }
      let backend = Arc::new(MockBackend::default());
      let transport = Arc::new(MockTransport::default());
      let events = Arc::new(RecordingBus::default());

      let manager = Manager::spawn(Config::default(), Services {
         backend: backend.clone(),
         transport: transport.clone(),
         store: store.clone(),
         events: events.clone(),
         drivers: self.drivers,
      });
      let harness = Harness {
         adapter: manager.adapter(ADAPTER),
         dispatcher: manager.dispatcher(),
         manager,
         backend,
         transport,
         events,
         store: StoredState { store },
      };

      let powered = !self.unpowered;
      harness
         .dispatch(BackendEvent::ControllerAdded {
            adapter: ADAPTER,
            address: ADAPTER_ADDRESS,
            class: 0,
            name: SmolStr::default(),
            powered,
         })
         .await;
      if powered {
         harness.mode_changed(Mode::Connectable.scan_mask()).await;
      }
      harness
   }
}

pub(crate) struct Harness {
   pub(crate) manager: Manager,
   pub(crate) adapter: AdapterHandle,
   dispatcher: Dispatcher,
   pub(crate) backend: Arc<MockBackend>,
   pub(crate) transport: Arc<MockTransport>,
   pub(crate) events: Arc<RecordingBus>,
   pub(crate) store: StoredState,
}

impl Harness {
   /// A powered, connectable controller.
   pub(crate) async fn new() -> Self {
      Self::builder().build().await
   }

   pub(crate) async fn unpowered() -> Self {
      HarnessBuilder {
         unpowered: true,
         ..Default::default()
      }
      .build()
      .await
   }

   pub(crate) fn builder() -> HarnessBuilder {
      HarnessBuilder::default()
   }

   /// Lets the actor drain everything it can without time passing.
   pub(crate) async fn settle(&self) {
      tokio::time::sleep(Duration::from_millis(1)).await;
   }

   pub(crate) async fn dispatch(&self, event: BackendEvent) {
      self.dispatcher.dispatch(event).await.unwrap();
      self.settle().await;
   }

   pub(crate) async fn mode_changed(&self, scan_mask: u8) {
      self
         .dispatch(BackendEvent::ModeChanged {
            adapter: ADAPTER,
            scan_mask,
         })
         .await;
   }

   pub(crate) async fn discovering(&self, discovering: bool) {
      self
         .dispatch(BackendEvent::DiscoveryStateChanged {
            adapter: ADAPTER,
            discovering,
         })
         .await;
   }

   pub(crate) async fn found(&self, device: Address, rssi: i8, eir: &[u8]) {
      self
         .dispatch(BackendEvent::DeviceFound {
            adapter: ADAPTER,
            device,
            address_type: AddressType::BrEdr,
            rssi,
            class: None,
            eir: eir.to_vec(),
         })
         .await;
   }

   /// Reports `device` as an LE advertiser during a discovery session.
   pub(crate) async fn found_le(&self, device: Address) {
      self.adapter.start_discovery(caller(":scan")).await.unwrap();
      self
         .dispatch(BackendEvent::DeviceFound {
            adapter: ADAPTER,
            device,
            address_type: AddressType::LePublic,
            rssi: -50,
            class: None,
            eir: Vec::new(),
         })
         .await;
   }

   pub(crate) async fn remote_name(&self, device: Address, name: Option<&str>) {
      self
         .dispatch(BackendEvent::RemoteName {
            adapter: ADAPTER,
            device,
            name: name.map(SmolStr::new),
         })
         .await;
   }

   pub(crate) async fn connect(&self, device: Address) {
      self
         .dispatch(BackendEvent::Connected {
            adapter: ADAPTER,
            device,
            address_type: AddressType::BrEdr,
         })
         .await;
   }

   pub(crate) async fn disconnect(&self, device: Address, reason: u8) {
      self
         .dispatch(BackendEvent::Disconnected {
            adapter: ADAPTER,
            device,
            reason,
         })
         .await;
   }

   /// Leaves a known, trusted, disconnected device behind.
   pub(crate) async fn trusted_device(&self, device: Address) {
      self.connect(device).await;
      self.adapter.device(device).set_trusted(true).await.unwrap();
      self.disconnect(device, 0x13).await;
   }

   pub(crate) async fn rssi(&self, device: Address, rssi: i8) {
      self
         .dispatch(BackendEvent::RssiSample {
            adapter: ADAPTER,
            device,
            rssi,
         })
         .await;
   }

   pub(crate) async fn bonding_complete(&self, device: Address, status: u8) {
      self
         .dispatch(BackendEvent::BondingComplete {
            adapter: ADAPTER,
            device,
            status,
         })
         .await;
   }

   pub(crate) fn spawn_bonding(&self, caller: CallerId, device: Address) -> JoinHandle<Result<()>> {
      let adapter = self.adapter.clone();
      tokio::spawn(async move {
         adapter
            .create_paired_device(caller, device, IoCapability::DisplayYesNo, None)
            .await
      })
   }
}
