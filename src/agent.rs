//! Pluggable user-interaction agent.
//!
//! The agent answers pairing prompts and confirms mode changes. Every prompt
//! returns a boxed future so implementations can wait on a user (or a remote
//! process) without blocking the manager.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use smol_str::SmolStr;

use crate::{
   adapter::Mode,
   address::Address,
   backend::IoCapability,
   error::Result,
   session::CallerId,
};

pub trait Agent: Send + Sync {
   fn request_pincode(&self, device: Address) -> BoxFuture<'static, Result<SmolStr>>;

   fn request_passkey(&self, device: Address) -> BoxFuture<'static, Result<u32>>;

   /// Resolves `Ok` if the user confirmed the displayed value.
   fn request_confirmation(&self, device: Address, passkey: u32) -> BoxFuture<'static, Result<()>>;

   /// Consent for an incoming pairing or connection.
   fn request_authorization(&self, device: Address) -> BoxFuture<'static, Result<()>>;

   fn display_passkey(&self, device: Address, passkey: u32) -> BoxFuture<'static, Result<()>>;

   fn confirm_mode_change(&self, mode: Mode) -> BoxFuture<'static, Result<()>>;

   /// The last prompt is no longer needed.
   fn cancel(&self);

   /// The agent has been unregistered.
   fn release(&self) {}
}

/// Shared handle to an agent.
pub type AgentRef = Arc<dyn Agent>;

/// The adapter-wide agent and who registered it.
#[derive(Clone)]
pub struct RegisteredAgent {
   pub owner: CallerId,
   pub capability: IoCapability,
   pub agent: AgentRef,
}

impl fmt::Debug for RegisteredAgent {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("RegisteredAgent")
         .field("owner", &self.owner)
         .field("capability", &self.capability)
         .finish_non_exhaustive()
   }
}
