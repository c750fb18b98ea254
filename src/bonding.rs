//! Bonding coordinator.
//!
//! Classic bonding is driven by the controller: we issue create-bonding and
//! wait for bonding-complete while the auth coordinator answers prompts. LE
//! bonding opens an ATT link at low security and raises it. A caller-initiated
//! bonding then browses the device before answering the caller.

use log::{debug, info, warn};

use crate::{
   adapter::Adapter,
   address::Address,
   agent::AgentRef,
   backend::{IoCapability, SecurityLevel, smp, status},
   browse::BrowseOrigin,
   error::{Error, Result},
   event::{Property, Value},
   manager::{AttPurpose, BondingParams, Command, Completion, Context, Reply, answer},
   session::CallerId,
   timer::{Task, TimerTarget},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BondingPhase {
   AwaitingLinkLevelAuth,
   AwaitingAgent,
   AwaitingServiceBrowse,
}

pub(crate) struct BondingRequest {
   pub(crate) id: u64,
   pub(crate) caller: CallerId,
   /// Agent given for this bonding only; the adapter agent is used otherwise.
   pub(crate) agent: Option<AgentRef>,
   pub(crate) capability: IoCapability,
   pub(crate) phase: BondingPhase,
   /// The device did not exist before this bonding.
   pub(crate) created: bool,
   pub(crate) le: bool,
   pub(crate) task: Option<Task>,
   reply: Option<Reply<()>>,
}

impl BondingRequest {
   pub(crate) fn fail(mut self, err: Error) {
      if let Some(reply) = self.reply.take() {
         answer(reply, Err(err));
      }
   }

   fn finish(mut self, result: Result<()>) {
      if let Some(reply) = self.reply.take() {
         answer(reply, result);
      }
   }

   /// Inquiry stays suspended until the link-level part is over.
   pub(crate) fn holds_discovery(&self) -> bool {
      !self.le && self.phase != BondingPhase::AwaitingServiceBrowse
   }
}

impl Adapter {
   pub(crate) fn create_paired_device(
      &mut self,
      ctx: &Context,
      params: BondingParams,
      reply: Reply<()>,
   ) {
      let BondingParams {
         caller,
         device: address,
         capability,
         agent,
      } = params;
      let id = self.id;

      if let Err(e) = self.require_powered() {
         answer(reply, Err(e));
         return;
      }
      if let Some(device) = self.devices.get(&address) {
         let refusal = if device.paired {
            Some(Error::AlreadyExists)
         } else if device.bonding.is_some() {
            Some(Error::AlreadyInProgress)
         } else if device.browse.is_some() {
            Some(Error::Busy)
         } else {
            None
         };
         if let Some(err) = refusal {
            answer(reply, Err(err));
            return;
         }
      }

      let created = !self.devices.contains_key(&address);
      let address_type = self
         .devices
         .get(&address)
         .map_or_else(|| self.found_address_type(address), |d| d.address_type);
      let le = address_type.is_le();

      if !le {
         if let Err(e) = ctx.backend.create_bonding(id, address, capability) {
            answer(reply, Err(e));
            return;
         }
         self.suspend_discovery(ctx);
      }

      info!("{id}: {caller} bonding with {address} ({capability})");
      let adapter_address = self.address;
      let request_id = ctx.next_id();
      let device = self.ensure_device(ctx, address, address_type);
      let task = le.then(|| match &device.att {
         Some(link) => {
            let raise = ctx
               .transport
               .set_security(link, SecurityLevel::for_capability(capability));
            ctx.spawn(async move {
               Command::Completed(id, Completion::SecurityRaised {
                  device: address,
                  bonding: request_id,
                  result: raise.await,
               })
            })
         },
         None => {
            let connect =
               ctx.transport
                  .att_connect(adapter_address, address, address_type, SecurityLevel::Low);
            ctx.spawn(async move {
               Command::Completed(id, Completion::AttConnected {
                  device: address,
                  purpose: AttPurpose::Bonding(request_id),
                  result: connect.await,
               })
            })
         },
      });

      device.bonding = Some(BondingRequest {
         id: request_id,
         caller,
         agent,
         capability,
         phase: BondingPhase::AwaitingLinkLevelAuth,
         created,
         le,
         task,
         reply: Some(reply),
      });
   }

   /// The ATT link requested for an LE bonding is up (or failed).
   pub(crate) fn on_bonding_link(
      &mut self,
      ctx: &Context,
      address: Address,
      bonding: u64,
      result: Result<()>,
   ) {
      let id = self.id;
      let current = self
         .devices
         .get(&address)
         .and_then(|d| d.bonding.as_ref())
         .is_some_and(|b| b.id == bonding);
      if !current {
         return;
      }
      if let Err(e) = result {
         self.bonding_failed(ctx, address, e);
         return;
      }

      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let (Some(request), Some(link)) = (device.bonding.as_mut(), device.att.as_ref()) else {
         self.bonding_failed(ctx, address, Error::NotConnected);
         return;
      };
      let level = SecurityLevel::for_capability(request.capability);
      debug!("{id}: raising security of {address} to {level:?}");
      let raise = ctx.transport.set_security(link, level);
      request.task = Some(ctx.spawn(async move {
         Command::Completed(id, Completion::SecurityRaised {
            device: address,
            bonding,
            result: raise.await,
         })
      }));
   }

   pub(crate) fn on_security_raised(
      &mut self,
      ctx: &Context,
      address: Address,
      bonding: u64,
      result: Result<()>,
   ) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if !device.bonding.as_ref().is_some_and(|b| b.id == bonding) {
         return;
      }

      match result {
         Ok(()) => {
            self.mark_paired(ctx, address);
            self.bonding_succeeded(ctx, address);
         },
         Err(Error::Smp(reason)) if reason == smp::PAIRING_NOT_SUPPORTED => {
            info!("{}: {address} does not support pairing", self.id);
            device.temporary = true;
            self.bonding_failed(ctx, address, Error::Smp(reason));
         },
         Err(e) => self.bonding_failed(ctx, address, e),
      }
   }

   pub(crate) fn on_bonding_complete(&mut self, ctx: &Context, address: Address, code: u8) {
      let id = self.id;
      let bonding = self
         .devices
         .get(&address)
         .is_some_and(|d| d.bonding.is_some());

      if code != status::SUCCESS {
         if bonding {
            self.bonding_failed(ctx, address, Error::from_bonding_status(code));
         } else {
            debug!("{id}: unsolicited bonding failure for {address} ({code:#04x})");
         }
         return;
      }

      if !self.devices.contains_key(&address) {
         debug!("{id}: bonding complete for unknown {address}");
         return;
      }
      self.mark_paired(ctx, address);
      if bonding {
         self.bonding_succeeded(ctx, address);
         return;
      }

      // Initiated by the peer
      self.keep_device(ctx, address);
      if !ctx.config.reverse_service_discovery {
         return;
      }
      if let Some(device) = self.devices.get_mut(&address)
         && device.browse.is_none()
      {
         debug!("{id}: scheduling reverse service discovery of {address}");
         device.reverse_discovery = Some(ctx.arm(
            ctx.config.reverse_discovery_delay(),
            TimerTarget::ReverseDiscovery(id, address),
         ));
      }
   }

   pub(crate) fn on_simple_pairing_complete(&mut self, ctx: &Context, address: Address, code: u8) {
      if code == status::SUCCESS {
         return;
      }
      if self
         .devices
         .get(&address)
         .is_some_and(|d| d.bonding.is_some())
      {
         self.bonding_failed(ctx, address, Error::from_bonding_status(code));
      }
   }

   pub(crate) fn mark_paired(&mut self, ctx: &Context, address: Address) {
      if let Some(device) = self.devices.get_mut(&address)
         && !device.paired
      {
         device.paired = true;
         ctx.device_changed(self.id, address, Property::Paired, Value::Bool(true));
      }
   }

   /// Link-level bonding done: browse on behalf of the caller, or answer it
   /// right away when there is nothing to browse.
   fn bonding_succeeded(&mut self, ctx: &Context, address: Address) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(request) = device.bonding.as_mut() else {
         return;
      };
      info!("{id}: bonded with {address}");
      request.task = None;
      let skip_browse = device.browse.is_some() || (request.le && !device.primaries.is_empty());
      let bonding = request.id;
      device.temporary = false;
      if let Some(auth) = device.auth.take() {
         auth.agent.cancel();
      }

      if skip_browse {
         if let Some(request) = device.bonding.take() {
            request.finish(Ok(()));
         }
      } else {
         request.phase = BondingPhase::AwaitingServiceBrowse;
      }

      self.store_device(ctx, address);
      self.resume_discovery(ctx);
      if !skip_browse {
         self.start_browse(ctx, address, None, BrowseOrigin::Bonding(bonding));
      }
   }

   /// The browse that followed a bonding finished.
   pub(crate) fn finish_bonding(
      &mut self,
      ctx: &Context,
      address: Address,
      bonding: u64,
      result: Result<()>,
   ) {
      let Some(request) = self
         .devices
         .get_mut(&address)
         .and_then(|d| d.bonding.take_if(|b| b.id == bonding))
      else {
         debug!("{}: browse finished for a stale bonding with {address}", self.id);
         return;
      };
      if let Err(e) = &result {
         warn!("{}: browse after bonding {address} failed: {e}", self.id);
      }
      request.finish(result);
      self.resume_discovery(ctx);
   }

   /// Clears the bonding request, answering its caller with `err`.
   pub(crate) fn bonding_failed(&mut self, ctx: &Context, address: Address, err: Error) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(request) = device.bonding.take() else {
         return;
      };
      info!("{id}: bonding with {address} failed: {err}");
      if let Some(auth) = device.auth.take() {
         auth.agent.cancel();
      }
      if request.phase == BondingPhase::AwaitingServiceBrowse
         && let Some(browse) = device.browse.take()
      {
         browse.origin.fail(Error::Canceled);
      }
      if request.le && device.supervisor.attio.is_empty() {
         device.release_att(ctx, id);
      }
      let created = request.created;
      request.fail(err);

      self.resume_discovery(ctx);
      if created
         && self
            .devices
            .get(&address)
            .is_some_and(|d| d.temporary && !d.connected)
      {
         self.schedule_removal(ctx, address);
      }
   }

   /// Cancels an in-flight bonding, telling the controller if it is still
   /// at link level. Returns whether there was one.
   pub(crate) fn abort_bonding(&mut self, ctx: &Context, address: Address, err: Error) -> bool {
      let Some(request) = self.devices.get(&address).and_then(|d| d.bonding.as_ref()) else {
         return false;
      };
      if !request.le
         && request.phase != BondingPhase::AwaitingServiceBrowse
         && let Err(e) = ctx.backend.cancel_bonding(self.id, address)
      {
         warn!("{}: failed to cancel bonding with {address}: {e}", self.id);
      }
      self.bonding_failed(ctx, address, err);
      true
   }

   pub(crate) fn cancel_bonding(
      &mut self,
      ctx: &Context,
      caller: &CallerId,
      address: Address,
   ) -> Result<()> {
      let device = self.devices.get(&address).ok_or(Error::DoesNotExist)?;
      let Some(request) = &device.bonding else {
         debug!("{}: no bonding with {address} to cancel", self.id);
         return Ok(());
      };
      if request.caller != *caller {
         return Err(Error::NotAuthorized);
      }
      info!("{}: {caller} canceled bonding with {address}", self.id);
      self.abort_bonding(ctx, address, Error::AuthenticationCanceled);
      Ok(())
   }
}
