//! Collaborator surfaces below the manager.
//!
//! [`Backend`] is the controller command surface: commands are fire-and-forget
//! and their outcome arrives later as a [`BackendEvent`]. [`Transport`] covers
//! the protocol exchanges the coordinators await on (SDP queries, ATT link
//! set-up and primary discovery).

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   address::{AdapterId, Address, AddressType},
   error::Result,
};

/// HCI status codes the manager interprets.
pub mod status {
   pub const SUCCESS: u8 = 0x00;
   pub const PAGE_TIMEOUT: u8 = 0x04;
   pub const AUTHENTICATION_FAILURE: u8 = 0x05;
   pub const PIN_OR_KEY_MISSING: u8 = 0x06;
   pub const MEMORY_CAPACITY_EXCEEDED: u8 = 0x07;
   pub const CONNECTION_TIMEOUT: u8 = 0x08;
   pub const CONNECTION_LIMIT_EXCEEDED: u8 = 0x09;
   pub const SYNC_CONNECTION_LIMIT_EXCEEDED: u8 = 0x0a;
   pub const REJECTED_LIMITED_RESOURCES: u8 = 0x0d;
   pub const REJECTED_SECURITY: u8 = 0x0e;
   pub const CONNECTION_ACCEPT_TIMEOUT: u8 = 0x10;
   pub const REMOTE_USER_TERMINATED: u8 = 0x13;
   pub const REMOTE_LOW_RESOURCES: u8 = 0x14;
   pub const LOCAL_HOST_TERMINATED: u8 = 0x16;
   pub const REPEATED_ATTEMPTS: u8 = 0x17;
   pub const PAIRING_NOT_ALLOWED: u8 = 0x18;
   pub const LMP_RESPONSE_TIMEOUT: u8 = 0x22;
   pub const INSTANT_PASSED: u8 = 0x28;
}

/// SMP pairing-failed reason codes.
pub mod smp {
   pub const PAIRING_NOT_SUPPORTED: u8 = 0x05;
}

/// Inquiry scan bit of the controller scan mask.
pub const SCAN_INQUIRY: u8 = 0x01;
/// Page scan bit of the controller scan mask.
pub const SCAN_PAGE: u8 = 0x02;

/// Local I/O capability announced during pairing.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
pub enum IoCapability {
   DisplayOnly,
   DisplayYesNo,
   KeyboardOnly,
   NoInputNoOutput,
   #[default]
   KeyboardDisplay,
}

/// Security level requested on an ATT link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
   Low,
   Medium,
   High,
}

impl SecurityLevel {
   /// Level to negotiate when bonding with the given capability.
   pub const fn for_capability(capability: IoCapability) -> Self {
      match capability {
         IoCapability::NoInputNoOutput => Self::Medium,
         _ => Self::High,
      }
   }
}

/// Why an ATT link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLoss {
   /// Supervision timeout; the peer may come back.
   Timeout,
   /// Torn down on our side.
   LocalTeardown,
   /// The peer closed the link.
   RemoteTerminated,
}

impl LinkLoss {
   pub const fn is_recoverable(self) -> bool {
      matches!(self, Self::Timeout)
   }
}

/// A classic SDP service record as returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpRecord {
   pub handle: u32,
   /// `ServiceClassIDList`, most specific first.
   pub service_classes: Vec<Uuid>,
}

impl SdpRecord {
   /// The profile UUID this record advertises.
   pub fn profile_uuid(&self) -> Option<Uuid> {
      self.service_classes.first().copied()
   }
}

/// A GATT primary service handle range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryService {
   pub uuid: Uuid,
   pub start: u16,
   pub end: u16,
}

/// An open ATT link. Not cloneable: whoever holds it owns the link.
#[derive(Debug, PartialEq, Eq)]
pub struct AttLink {
   pub id: u64,
   pub peer: Address,
}

/// BR/EDR link key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkKey {
   pub key: [u8; 16],
   pub kind: u8,
   pub pin_len: u8,
}

/// LE long-term key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKey {
   pub key: [u8; 16],
   pub authenticated: bool,
   pub master: bool,
   pub enc_size: u8,
   pub ediv: u16,
   pub rand: u64,
}

/// Controller command surface.
///
/// Every command returns once it is queued; completion is reported through
/// the matching [`BackendEvent`].
pub trait Backend: Send + Sync {
   fn set_powered(&self, adapter: AdapterId, powered: bool) -> Result<()>;
   /// Sets page/inquiry scan; the combination selects connectable/discoverable.
   fn set_scan_mode(&self, adapter: AdapterId, scan_mask: u8) -> Result<()>;
   fn set_pairable(&self, adapter: AdapterId, pairable: bool) -> Result<()>;
   fn set_name(&self, adapter: AdapterId, name: &str) -> Result<()>;
   fn start_discovery(&self, adapter: AdapterId) -> Result<()>;
   fn stop_discovery(&self, adapter: AdapterId) -> Result<()>;
   fn resolve_name(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn create_bonding(
      &self,
      adapter: AdapterId,
      device: Address,
      capability: IoCapability,
   ) -> Result<()>;
   fn cancel_bonding(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn remove_bonding(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn pincode_reply(&self, adapter: AdapterId, device: Address, pin: Option<&str>) -> Result<()>;
   fn confirm_reply(&self, adapter: AdapterId, device: Address, accept: bool) -> Result<()>;
   fn passkey_reply(&self, adapter: AdapterId, device: Address, passkey: Option<u32>)
   -> Result<()>;
   fn disconnect(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn read_rssi(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn add_uuid(&self, adapter: AdapterId, uuid: Uuid) -> Result<()>;
   fn remove_uuid(&self, adapter: AdapterId, uuid: Uuid) -> Result<()>;
   fn block_device(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn unblock_device(&self, adapter: AdapterId, device: Address) -> Result<()>;
   fn load_keys(&self, adapter: AdapterId, keys: &[(Address, LinkKey)]) -> Result<()>;
   fn load_long_term_keys(&self, adapter: AdapterId, keys: &[(Address, LongTermKey)])
   -> Result<()>;
}

/// Protocol exchanges the coordinators await on.
pub trait Transport: Send + Sync {
   /// Runs one SDP service-search-attribute query for `uuid`.
   fn sdp_search(
      &self,
      adapter: Address,
      device: Address,
      uuid: Uuid,
   ) -> BoxFuture<'static, Result<Vec<SdpRecord>>>;

   fn att_connect(
      &self,
      adapter: Address,
      device: Address,
      address_type: AddressType,
      security: SecurityLevel,
   ) -> BoxFuture<'static, Result<AttLink>>;

   fn discover_primaries(&self, link: &AttLink) -> BoxFuture<'static, Result<Vec<PrimaryService>>>;

   /// Raises the link security; resolves once SMP completes.
   fn set_security(&self, link: &AttLink, level: SecurityLevel) -> BoxFuture<'static, Result<()>>;

   fn att_disconnect(&self, link: AttLink);
}

/// Notifications delivered by the controller backend.
#[derive(Debug, Clone)]
pub enum BackendEvent {
   ControllerAdded {
      adapter: AdapterId,
      address: Address,
      class: u32,
      name: SmolStr,
      powered: bool,
   },
   ControllerRemoved {
      adapter: AdapterId,
   },
   PowerChanged {
      adapter: AdapterId,
      powered: bool,
   },
   ModeChanged {
      adapter: AdapterId,
      scan_mask: u8,
   },
   DiscoveryStateChanged {
      adapter: AdapterId,
      discovering: bool,
   },
   DeviceFound {
      adapter: AdapterId,
      device: Address,
      address_type: AddressType,
      rssi: i8,
      class: Option<u32>,
      eir: Vec<u8>,
   },
   RemoteName {
      adapter: AdapterId,
      device: Address,
      name: Option<SmolStr>,
   },
   Connected {
      adapter: AdapterId,
      device: Address,
      address_type: AddressType,
   },
   ConnectFailed {
      adapter: AdapterId,
      device: Address,
      status: u8,
   },
   Disconnected {
      adapter: AdapterId,
      device: Address,
      reason: u8,
   },
   AttLinkLost {
      adapter: AdapterId,
      device: Address,
      reason: LinkLoss,
   },
   BondingComplete {
      adapter: AdapterId,
      device: Address,
      status: u8,
   },
   LinkKeyNotify {
      adapter: AdapterId,
      device: Address,
      key: LinkKey,
      persistent: bool,
   },
   LongTermKeyNotify {
      adapter: AdapterId,
      device: Address,
      key: LongTermKey,
      persistent: bool,
   },
   SimplePairingComplete {
      adapter: AdapterId,
      device: Address,
      status: u8,
   },
   EncryptionChanged {
      adapter: AdapterId,
      device: Address,
      enabled: bool,
   },
   PinCodeRequest {
      adapter: AdapterId,
      device: Address,
      secure: bool,
   },
   PasskeyRequest {
      adapter: AdapterId,
      device: Address,
   },
   ConfirmRequest {
      adapter: AdapterId,
      device: Address,
      passkey: u32,
   },
   AuthorizeRequest {
      adapter: AdapterId,
      device: Address,
   },
   PasskeyNotify {
      adapter: AdapterId,
      device: Address,
      passkey: u32,
   },
   RssiSample {
      adapter: AdapterId,
      device: Address,
      rssi: i8,
   },
}

impl BackendEvent {
   /// The controller the event was reported by.
   pub const fn adapter(&self) -> AdapterId {
      match self {
         Self::ControllerAdded { adapter, .. }
         | Self::ControllerRemoved { adapter }
         | Self::PowerChanged { adapter, .. }
         | Self::ModeChanged { adapter, .. }
         | Self::DiscoveryStateChanged { adapter, .. }
         | Self::DeviceFound { adapter, .. }
         | Self::RemoteName { adapter, .. }
         | Self::Connected { adapter, .. }
         | Self::ConnectFailed { adapter, .. }
         | Self::Disconnected { adapter, .. }
         | Self::AttLinkLost { adapter, .. }
         | Self::BondingComplete { adapter, .. }
         | Self::LinkKeyNotify { adapter, .. }
         | Self::LongTermKeyNotify { adapter, .. }
         | Self::SimplePairingComplete { adapter, .. }
         | Self::EncryptionChanged { adapter, .. }
         | Self::PinCodeRequest { adapter, .. }
         | Self::PasskeyRequest { adapter, .. }
         | Self::ConfirmRequest { adapter, .. }
         | Self::AuthorizeRequest { adapter, .. }
         | Self::PasskeyNotify { adapter, .. }
         | Self::RssiSample { adapter, .. } => *adapter,
      }
   }
}
