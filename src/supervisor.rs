//! LE link supervision.
//!
//! Profiles that need a persistent ATT link register interest per device.
//! While anybody is registered the supervisor keeps the link up, reconnecting
//! after a supervision timeout with a jittered delay and giving up after a
//! bounded number of attempts.

use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::{
   adapter::Adapter,
   address::Address,
   backend::{AttLink, LinkLoss, SecurityLevel},
   browse::BrowseKind,
   error::{Error, Result},
   manager::{AttPurpose, Command, Completion, Context},
   timer::{Task, Timer, TimerTarget, take_fired},
};

/// Upper bound of the random delay added to each reconnect.
const RECONNECT_JITTER_MS: u64 = 1000;

#[derive(Debug, Default)]
pub(crate) struct LinkSupervisor {
   pub(crate) auto_connect: bool,
   /// Connect attempts since the link was last up.
   pub(crate) attempts: u32,
   /// Registration tokens of attio users.
   pub(crate) attio: Vec<u64>,
   timer: Option<Timer>,
   connecting: Option<(u64, Task)>,
}

impl LinkSupervisor {
   /// Stops reconnecting until someone registers again.
   pub(crate) fn disable(&mut self) {
      self.auto_connect = false;
      self.timer = None;
      self.connecting = None;
   }
}

impl Adapter {
   pub(crate) fn register_attio(&mut self, ctx: &Context, address: Address) -> Result<u64> {
      let id = self.id;
      let device = self.devices.get_mut(&address).ok_or(Error::DoesNotExist)?;
      if !device.address_type.is_le() {
         return Err(Error::NotSupported);
      }

      let token = ctx.next_id();
      let supervisor = &mut device.supervisor;
      supervisor.attio.push(token);
      if !supervisor.auto_connect {
         supervisor.attempts = 0;
         supervisor.auto_connect = true;
      }
      debug!("{id}: attio user {token} registered for {address}");

      if device.att.is_some() {
         for driver in &device.drivers {
            driver.attio_connected(id, address);
         }
      } else if device.supervisor.timer.is_none() && device.supervisor.connecting.is_none() {
         self.connect_le(ctx, address);
      }
      Ok(token)
   }

   pub(crate) fn unregister_attio(&mut self, ctx: &Context, address: Address, token: u64) -> Result<()> {
      let device = self.devices.get_mut(&address).ok_or(Error::DoesNotExist)?;
      let before = device.supervisor.attio.len();
      device.supervisor.attio.retain(|t| *t != token);
      if device.supervisor.attio.len() == before {
         return Err(Error::DoesNotExist);
      }
      debug!("{}: attio user {token} of {address} gone", self.id);
      if device.supervisor.attio.is_empty() {
         device.supervisor.disable();
         self.release_idle_link(ctx, address);
      }
      Ok(())
   }

   /// Drops the ATT link of `address` when no flow needs it.
   pub(crate) fn release_idle_link(&mut self, ctx: &Context, address: Address) {
      let id = self.id;
      if let Some(device) = self.devices.get_mut(&address)
         && device.supervisor.attio.is_empty()
         && device.bonding.is_none()
         && device.browse.is_none()
      {
         device.release_att(ctx, id);
      }
   }

   fn connect_le(&mut self, ctx: &Context, address: Address) {
      let id = self.id;
      let adapter_address = self.address;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let token = ctx.next_id();
      let connect =
         ctx.transport
            .att_connect(adapter_address, address, device.address_type, SecurityLevel::Low);
      let task = ctx.spawn(async move {
         Command::Completed(id, Completion::AttConnected {
            device: address,
            purpose: AttPurpose::Supervisor(token),
            result: connect.await,
         })
      });
      device.supervisor.attempts += 1;
      device.supervisor.connecting = Some((token, task));
   }

   /// Arms the one reconnect timer, unless one is pending or the attempts
   /// are used up.
   fn schedule_reconnect(&mut self, ctx: &Context, address: Address) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let supervisor = &mut device.supervisor;
      if !supervisor.auto_connect
         || supervisor.attio.is_empty()
         || supervisor.timer.is_some()
         || supervisor.connecting.is_some()
      {
         return;
      }
      if supervisor.attempts >= ctx.config.reconnect_max_attempts {
         info!("{id}: giving up on {address} after {} attempts", supervisor.attempts);
         supervisor.auto_connect = false;
         return;
      }

      let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS));
      let delay = ctx.config.reconnect_interval() + jitter;
      debug!("{id}: reconnecting {address} in {delay:?}");
      supervisor.timer = Some(ctx.arm(delay, TimerTarget::Reconnect(id, address)));
   }

   pub(crate) fn on_reconnect_timer(&mut self, ctx: &Context, address: Address, generation: u64) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let supervisor = &mut device.supervisor;
      if !take_fired(&mut supervisor.timer, generation) {
         return;
      }
      if !supervisor.auto_connect || supervisor.attio.is_empty() || device.att.is_some() {
         return;
      }
      self.connect_le(ctx, address);
   }

   pub(crate) fn on_att_link_lost(&mut self, ctx: &Context, address: Address, reason: LinkLoss) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if device.att.take().is_some() {
         info!("{id}: ATT link to {address} lost ({reason:?})");
         if !device.supervisor.attio.is_empty() {
            for driver in &device.drivers {
               driver.attio_disconnected(id, address);
            }
         }
      }

      let browsing = device
         .browse
         .as_ref()
         .is_some_and(|b| b.kind == BrowseKind::Primary);
      let bonding = device.bonding.as_ref().is_some_and(|b| b.le);
      if reason == LinkLoss::LocalTeardown {
         device.supervisor.disable();
      }

      if browsing {
         self.fail_browse(ctx, address, Error::NotConnected);
      }
      if bonding {
         self.bonding_failed(ctx, address, Error::NotConnected);
      }
      if reason.is_recoverable() {
         self.schedule_reconnect(ctx, address);
      }
   }

   /// Routes a finished ATT connect to the flow that asked for it.
   pub(crate) fn on_att_connected(
      &mut self,
      ctx: &Context,
      address: Address,
      purpose: AttPurpose,
      result: Result<AttLink>,
   ) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         if let Ok(link) = result {
            ctx.transport.att_disconnect(link);
         }
         return;
      };

      let current = match purpose {
         AttPurpose::Browse(browse) => device.browse.as_ref().is_some_and(|b| b.id == browse),
         AttPurpose::Bonding(bonding) => device.bonding.as_ref().is_some_and(|b| b.id == bonding),
         AttPurpose::Supervisor(token) => device
            .supervisor
            .connecting
            .take_if(|(t, _)| *t == token)
            .is_some(),
      };
      if !current {
         debug!("{id}: stale ATT connect to {address}");
         if let Ok(link) = result {
            ctx.transport.att_disconnect(link);
         }
         return;
      }

      let outcome = result.map(|link| {
         device.supervisor.attempts = 0;
         device.supervisor.timer = None;
         if device.att.is_some() {
            ctx.transport.att_disconnect(link);
            return;
         }
         device.att = Some(link);
         if !device.supervisor.attio.is_empty() {
            for driver in &device.drivers {
               driver.attio_connected(id, address);
            }
         }
      });

      match purpose {
         AttPurpose::Browse(browse) => self.on_browse_link(ctx, address, browse, outcome),
         AttPurpose::Bonding(bonding) => self.on_bonding_link(ctx, address, bonding, outcome),
         AttPurpose::Supervisor(_) => match outcome {
            Ok(()) => info!("{id}: ATT link to {address} up"),
            Err(e) => {
               warn!("{id}: connecting {address} failed: {e}");
               self.schedule_reconnect(ctx, address);
            },
         },
      }
   }
}
