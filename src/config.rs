//! Configuration management for the lifecycle manager.
//!
//! This module handles loading and saving the daemon settings from disk:
//! adapter defaults, discovery behaviour, timer intervals and the
//! interoperability UUID lists used by the browse coordinator.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::Mode,
   error::{Error, Result},
   uuids,
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Name given to adapters that have none stored.
   #[serde(default = "default_name")]
   pub name: SmolStr,

   #[serde(default = "default_class")]
   pub class: u32,

   /// Mode applied when an adapter powers on without a stored mode.
   #[serde(default = "default_initial_mode")]
   pub initial_mode: Mode,

   /// Seconds; 0 keeps the adapter discoverable forever.
   #[serde(default = "default_discoverable_timeout")]
   pub discoverable_timeout: u32,

   /// Seconds; 0 keeps the adapter pairable forever.
   #[serde(default)]
   pub pairable_timeout: u32,

   /// Resolve unknown names at the end of each inquiry burst.
   #[serde(default = "default_true")]
   pub name_resolving: bool,

   /// Pause between two inquiry bursts while discovery sessions are alive.
   #[serde(default = "default_discovery_interval")]
   pub discovery_interval_sec: u64,

   /// Browse services after a peer-initiated bonding.
   #[serde(default = "default_true")]
   pub reverse_service_discovery: bool,

   #[serde(default = "default_reverse_discovery_delay")]
   pub reverse_discovery_delay_sec: u64,

   #[serde(default = "default_disconnect_grace")]
   pub disconnect_grace_sec: u64,

   #[serde(default = "default_reconnect_interval")]
   pub reconnect_interval_sec: u64,

   #[serde(default = "default_reconnect_attempts")]
   pub reconnect_max_attempts: u32,

   /// Profiles whose bindings survive a transient SDP omission while active.
   #[serde(default = "default_audio_uuids")]
   pub audio_uuids: Vec<Uuid>,

   /// Service UUIDs never dropped from a device once seen.
   #[serde(default)]
   pub never_remove_uuids: Vec<Uuid>,
}

fn default_name() -> SmolStr {
   SmolStr::new_static("bluecore")
}

const fn default_class() -> u32 {
   0x00_0100
}

const fn default_initial_mode() -> Mode {
   Mode::Connectable
}

const fn default_discoverable_timeout() -> u32 {
   180
}

const fn default_true() -> bool {
   true
}

const fn default_discovery_interval() -> u64 {
   2
}

const fn default_reverse_discovery_delay() -> u64 {
   2
}

const fn default_disconnect_grace() -> u64 {
   2
}

const fn default_reconnect_interval() -> u64 {
   5
}

/// `RECONNECTION_MAX_COUNT`
const fn default_reconnect_attempts() -> u32 {
   5
}

fn default_audio_uuids() -> Vec<Uuid> {
   uuids::AUDIO_PROFILES.to_vec()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         name: default_name(),
         class: default_class(),
         initial_mode: default_initial_mode(),
         discoverable_timeout: default_discoverable_timeout(),
         pairable_timeout: 0,
         name_resolving: true,
         discovery_interval_sec: default_discovery_interval(),
         reverse_service_discovery: true,
         reverse_discovery_delay_sec: default_reverse_discovery_delay(),
         disconnect_grace_sec: default_disconnect_grace(),
         reconnect_interval_sec: default_reconnect_interval(),
         reconnect_max_attempts: default_reconnect_attempts(),
         audio_uuids: default_audio_uuids(),
         never_remove_uuids: Vec::new(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLUECORE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("bluecore").join("main.toml"))
   }

   pub const fn discovery_interval(&self) -> Duration {
      Duration::from_secs(self.discovery_interval_sec)
   }

   pub const fn reverse_discovery_delay(&self) -> Duration {
      Duration::from_secs(self.reverse_discovery_delay_sec)
   }

   pub const fn disconnect_grace(&self) -> Duration {
      Duration::from_secs(self.disconnect_grace_sec)
   }

   pub const fn reconnect_interval(&self) -> Duration {
      Duration::from_secs(self.reconnect_interval_sec)
   }

   pub fn is_audio_profile(&self, uuid: &Uuid) -> bool {
      self.audio_uuids.contains(uuid)
   }

   pub fn never_remove(&self, uuid: &Uuid) -> bool {
      self.never_remove_uuids.contains(uuid)
   }
}
