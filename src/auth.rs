//! Authentication coordinator: routes controller prompts to the agent and
//! the agent's answers back to the controller.

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use smol_str::SmolStr;

use crate::{
   adapter::Adapter,
   address::{AdapterId, Address, AddressType},
   agent::AgentRef,
   bonding::BondingPhase,
   error::{Error, Result},
   manager::{Command, Completion, Context},
   timer::Task,
};

/// Longest PIN accepted by the controller.
const MAX_PIN_LENGTH: usize = 16;
/// Passkeys are six decimal digits.
const MAX_PASSKEY: u32 = 999_999;

/// What the controller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
   /// Legacy PIN; `secure` requires a full 16-digit PIN.
   Pin { secure: bool },
   Passkey,
   Confirm { passkey: u32 },
   Consent,
   /// Display only, no reply is sent.
   Notify { passkey: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAnswer {
   Pin(SmolStr),
   Passkey(u32),
   Accepted,
}

pub(crate) struct AuthRequest {
   pub(crate) id: u64,
   pub(crate) kind: AuthKind,
   pub(crate) agent: AgentRef,
   _task: Task,
}

fn prompt(agent: &AgentRef, device: Address, kind: AuthKind) -> BoxFuture<'static, Result<AgentAnswer>> {
   match kind {
      AuthKind::Pin { .. } => agent
         .request_pincode(device)
         .map(|r| r.map(AgentAnswer::Pin))
         .boxed(),
      AuthKind::Passkey => agent
         .request_passkey(device)
         .map(|r| r.map(AgentAnswer::Passkey))
         .boxed(),
      AuthKind::Confirm { passkey } => agent
         .request_confirmation(device, passkey)
         .map(|r| r.map(|()| AgentAnswer::Accepted))
         .boxed(),
      AuthKind::Consent => agent
         .request_authorization(device)
         .map(|r| r.map(|()| AgentAnswer::Accepted))
         .boxed(),
      AuthKind::Notify { passkey } => agent
         .display_passkey(device, passkey)
         .map(|r| r.map(|()| AgentAnswer::Accepted))
         .boxed(),
   }
}

fn valid_pin(pin: &str, secure: bool) -> bool {
   if secure {
      pin.len() == MAX_PIN_LENGTH
   } else {
      (1..=MAX_PIN_LENGTH).contains(&pin.len())
   }
}

/// Sends the controller reply matching `kind`; anything but a fitting
/// positive answer becomes a negative reply.
fn send_reply(
   ctx: &Context,
   adapter: AdapterId,
   device: Address,
   kind: AuthKind,
   answer: Result<AgentAnswer>,
) -> Result<()> {
   match (kind, answer) {
      (AuthKind::Pin { secure }, Ok(AgentAnswer::Pin(pin))) if valid_pin(&pin, secure) => {
         ctx.backend.pincode_reply(adapter, device, Some(&pin))
      },
      (AuthKind::Pin { .. }, _) => ctx.backend.pincode_reply(adapter, device, None),
      (AuthKind::Passkey, Ok(AgentAnswer::Passkey(passkey))) if passkey <= MAX_PASSKEY => {
         ctx.backend.passkey_reply(adapter, device, Some(passkey))
      },
      (AuthKind::Passkey, _) => ctx.backend.passkey_reply(adapter, device, None),
      (AuthKind::Confirm { .. } | AuthKind::Consent, Ok(AgentAnswer::Accepted)) => {
         ctx.backend.confirm_reply(adapter, device, true)
      },
      (AuthKind::Confirm { .. } | AuthKind::Consent, _) => {
         ctx.backend.confirm_reply(adapter, device, false)
      },
      (AuthKind::Notify { .. }, _) => Ok(()),
   }
}

impl Adapter {
   /// Asks the agent to handle a controller prompt.
   ///
   /// Fails when a prompt is already pending for the device or nobody can
   /// answer; the controller then gets a negative reply.
   pub(crate) fn request_authentication(
      &mut self,
      ctx: &Context,
      address: Address,
      kind: AuthKind,
   ) -> Result<()> {
      let id = self.id;
      let adapter_agent = self.agent.as_ref().map(|a| a.agent.clone());
      let known = self.devices.get(&address);
      let refusal = match known {
         Some(d) if d.auth.is_some() => Some(Error::AlreadyInProgress),
         Some(d) if d.blocked => Some(Error::NotAuthorized),
         _ => None,
      };
      let address_type = known.map_or(AddressType::BrEdr, |d| d.address_type);
      let agent = known
         .and_then(|d| d.bonding.as_ref())
         .and_then(|b| b.agent.clone())
         .or(adapter_agent);
      let agent = match (refusal, agent) {
         (None, Some(agent)) => agent,
         (refusal, _) => {
            let err = refusal.unwrap_or(Error::AgentNotAvailable);
            warn!("{id}: refusing {kind:?} for {address}: {err}");
            if let Err(e) = send_reply(ctx, id, address, kind, Err(err.clone())) {
               warn!("{id}: failed to reject {address}: {e}");
            }
            return Err(err);
         },
      };

      let device = self.ensure_device(ctx, address, address_type);
      let request = ctx.next_id();
      let answer = prompt(&agent, address, kind);
      let task = ctx.spawn(async move {
         Command::Completed(id, Completion::AgentAnswered {
            device: address,
            request,
            answer: answer.await,
         })
      });
      debug!("{id}: asking agent {kind:?} for {address}");

      if let Some(bonding) = device.bonding.as_mut() {
         bonding.phase = BondingPhase::AwaitingAgent;
      }
      device.auth = Some(AuthRequest {
         id: request,
         kind,
         agent,
         _task: task,
      });
      Ok(())
   }

   pub(crate) fn on_agent_answer(
      &mut self,
      ctx: &Context,
      address: Address,
      request: u64,
      answer: Result<AgentAnswer>,
   ) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(auth) = device.auth.take_if(|a| a.id == request) else {
         debug!("{id}: stale agent answer for {address}");
         return;
      };
      if let Some(bonding) = device.bonding.as_mut()
         && bonding.phase == BondingPhase::AwaitingAgent
      {
         bonding.phase = BondingPhase::AwaitingLinkLevelAuth;
      }

      if let Err(e) = &answer {
         info!("{id}: agent declined {:?} for {address}: {e}", auth.kind);
      }
      if let Err(e) = send_reply(ctx, id, address, auth.kind, answer) {
         warn!("{id}: failed to answer {address}: {e}");
      }
   }
}
