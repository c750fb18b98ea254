//! Error types for the lifecycle manager.
//!
//! Every failure surfaced to a caller is one of these typed kinds; raw
//! controller status codes are classified here and never returned as-is.

use std::sync::Arc;

use smol_str::SmolStr;
use thiserror::Error;

use crate::backend::status;

/// Main error type for the manager.
///
/// Cloneable so a single outcome can be delivered to every waiter of a
/// request; wrapped foreign errors are kept behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
   #[error("Adapter not ready")]
   NotReady,

   #[error("Operation already in progress")]
   AlreadyInProgress,

   #[error("Device busy")]
   Busy,

   #[error("Already exists")]
   AlreadyExists,

   #[error("Does not exist")]
   DoesNotExist,

   #[error("Operation canceled")]
   Canceled,

   #[error("Connection attempt failed: {0}")]
   ConnectionAttemptFailed(&'static str),

   #[error("Authentication timeout")]
   AuthenticationTimeout,

   #[error("Authentication rejected")]
   AuthenticationRejected,

   #[error("Authentication canceled")]
   AuthenticationCanceled,

   #[error("Authentication failed")]
   AuthenticationFailed,

   #[error("Too many authentication attempts")]
   RepeatedAttempts,

   #[error("Operation not supported")]
   NotSupported,

   #[error("Device not connected")]
   NotConnected,

   #[error("Not authorized")]
   NotAuthorized,

   #[error("Invalid arguments: {0}")]
   InvalidArguments(SmolStr),

   #[error("No agent available")]
   AgentNotAvailable,

   #[error("Connection reset by peer")]
   ConnectionReset,

   #[error("SMP pairing failed with reason {0:#04x}")]
   Smp(u8),

   #[error("Backend failure: {0}")]
   Failed(SmolStr),

   #[error("Storage error: {0}")]
   Storage(Arc<heed::Error>),

   #[error("I/O error: {0}")]
   Io(Arc<std::io::Error>),

   #[error("TOML parsing error: {0}")]
   TomlParse(Arc<toml::de::Error>),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(Arc<toml::ser::Error>),

   #[error("D-Bus error: {0}")]
   DBus(Arc<zbus::Error>),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not determine data directory")]
   DataDirNotFound,

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl From<heed::Error> for Error {
   fn from(e: heed::Error) -> Self {
      Self::Storage(Arc::new(e))
   }
}

impl From<std::io::Error> for Error {
   fn from(e: std::io::Error) -> Self {
      Self::Io(Arc::new(e))
   }
}

impl From<toml::de::Error> for Error {
   fn from(e: toml::de::Error) -> Self {
      Self::TomlParse(Arc::new(e))
   }
}

impl From<toml::ser::Error> for Error {
   fn from(e: toml::ser::Error) -> Self {
      Self::TomlSerialize(Arc::new(e))
   }
}

impl From<zbus::Error> for Error {
   fn from(e: zbus::Error) -> Self {
      Self::DBus(Arc::new(e))
   }
}

impl Error {
   /// Classifies a bonding-complete status code.
   ///
   /// Each non-zero status maps to exactly one kind; unknown codes are
   /// reported as a generic authentication failure.
   pub const fn from_bonding_status(code: u8) -> Self {
      match code {
         status::PAGE_TIMEOUT => Self::ConnectionAttemptFailed("Page Timeout"),
         status::CONNECTION_TIMEOUT => Self::ConnectionAttemptFailed("Connection Timeout"),
         status::CONNECTION_ACCEPT_TIMEOUT | status::LMP_RESPONSE_TIMEOUT | status::INSTANT_PASSED => {
            Self::AuthenticationTimeout
         },
         status::REPEATED_ATTEMPTS => Self::RepeatedAttempts,
         status::PIN_OR_KEY_MISSING | status::PAIRING_NOT_ALLOWED => Self::AuthenticationRejected,
         status::MEMORY_CAPACITY_EXCEEDED
         | status::CONNECTION_LIMIT_EXCEEDED
         | status::SYNC_CONNECTION_LIMIT_EXCEEDED
         | status::REJECTED_LIMITED_RESOURCES
         | status::REMOTE_USER_TERMINATED
         | status::REMOTE_LOW_RESOURCES
         | status::LOCAL_HOST_TERMINATED => Self::AuthenticationCanceled,
         _ => Self::AuthenticationFailed,
      }
   }

   /// Name of the error on the control plane.
   pub const fn dbus_name(&self) -> &'static str {
      match self {
         Self::NotReady => "org.bluez.Error.NotReady",
         Self::AlreadyInProgress | Self::Busy => "org.bluez.Error.InProgress",
         Self::AlreadyExists => "org.bluez.Error.AlreadyExists",
         Self::DoesNotExist => "org.bluez.Error.DoesNotExist",
         Self::Canceled => "org.bluez.Error.Canceled",
         Self::ConnectionAttemptFailed(_) => "org.bluez.Error.ConnectionAttemptFailed",
         Self::AuthenticationTimeout => "org.bluez.Error.AuthenticationTimeout",
         Self::AuthenticationRejected => "org.bluez.Error.AuthenticationRejected",
         Self::AuthenticationCanceled => "org.bluez.Error.AuthenticationCanceled",
         Self::AuthenticationFailed | Self::Smp(_) => "org.bluez.Error.AuthenticationFailed",
         Self::RepeatedAttempts => "org.bluez.Error.RepeatedAttempts",
         Self::NotSupported => "org.bluez.Error.NotSupported",
         Self::NotConnected => "org.bluez.Error.NotConnected",
         Self::NotAuthorized => "org.bluez.Error.NotAuthorized",
         Self::InvalidArguments(_) => "org.bluez.Error.InvalidArguments",
         Self::AgentNotAvailable => "org.bluez.Error.AgentNotAvailable",
         _ => "org.bluez.Error.Failed",
      }
   }
}

/// Convenience type alias for Results with the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_bonding_status_classification() {
      assert!(matches!(
         Error::from_bonding_status(0x04),
         Error::ConnectionAttemptFailed("Page Timeout")
      ));
      assert!(matches!(
         Error::from_bonding_status(0x08),
         Error::ConnectionAttemptFailed("Connection Timeout")
      ));
      for code in [0x10, 0x22, 0x28] {
         assert!(matches!(Error::from_bonding_status(code), Error::AuthenticationTimeout));
      }
      assert!(matches!(Error::from_bonding_status(0x17), Error::RepeatedAttempts));
      for code in [0x06, 0x18] {
         assert!(matches!(Error::from_bonding_status(code), Error::AuthenticationRejected));
      }
      for code in [0x07, 0x09, 0x0a, 0x0d, 0x13, 0x14, 0x16] {
         assert!(matches!(Error::from_bonding_status(code), Error::AuthenticationCanceled));
      }
      for code in [0x05, 0x0e, 0x3d, 0xff] {
         assert!(matches!(Error::from_bonding_status(code), Error::AuthenticationFailed));
      }
   }

   #[test]
   fn test_dbus_names() {
      assert_eq!(Error::Busy.dbus_name(), "org.bluez.Error.InProgress");
      assert_eq!(Error::Smp(0x05).dbus_name(), "org.bluez.Error.AuthenticationFailed");
      assert_eq!(Error::ManagerShutdown.dbus_name(), "org.bluez.Error.Failed");
   }
}
