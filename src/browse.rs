//! Service browsing.
//!
//! Classic devices are searched over SDP for each root UUID in turn, one query
//! in flight; LE devices get their primary services discovered over the ATT
//! link. Either way the result replaces the device's service set.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{
   adapter::Adapter,
   address::{AdapterId, Address},
   backend::{AttLink, PrimaryService, SdpRecord, SecurityLevel},
   error::{Error, Result},
   manager::{AttPurpose, Command, Completion, Context, Reply, answer},
   session::CallerId,
   timer::{Task, take_fired},
   uuids,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrowseKind {
   Sdp,
   Primary,
}

/// Who gets told when the browse ends.
pub(crate) enum BrowseOrigin {
   Caller(CallerId, Reply<Vec<SdpRecord>>),
   /// Browse that follows the bonding with this id.
   Bonding(u64),
   /// Browse of a device created by `create_device`; removes it on failure.
   CreateDevice(CallerId, Reply<()>),
   Internal,
}

impl BrowseOrigin {
   pub(crate) fn caller(&self) -> Option<&CallerId> {
      match self {
         Self::Caller(caller, _) | Self::CreateDevice(caller, _) => Some(caller),
         Self::Bonding(_) | Self::Internal => None,
      }
   }

   /// Answers a waiting caller. The owner of a bonding browse answers its
   /// caller itself.
   pub(crate) fn fail(self, err: Error) {
      match self {
         Self::Caller(_, reply) => answer(reply, Err(err)),
         Self::CreateDevice(_, reply) => answer(reply, Err(err)),
         Self::Bonding(_) | Self::Internal => {},
      }
   }
}

pub(crate) struct BrowseRequest {
   pub(crate) id: u64,
   pub(crate) kind: BrowseKind,
   pub(crate) origin: BrowseOrigin,
   search: SmallVec<[Uuid; 4]>,
   cursor: usize,
   /// Deduplicated by record handle.
   records: Vec<SdpRecord>,
   /// The one connection reset retry has been spent.
   retried: bool,
   task: Option<Task>,
}

impl BrowseRequest {
   fn add_records(&mut self, records: Vec<SdpRecord>) {
      for record in records {
         if !self.records.iter().any(|r| r.handle == record.handle) {
            self.records.push(record);
         }
      }
   }
}

fn search_sdp(
   ctx: &Context,
   adapter: (AdapterId, Address),
   device: Address,
   browse: u64,
   uuid: Uuid,
) -> Task {
   let (id, adapter_address) = adapter;
   let search = ctx.transport.sdp_search(adapter_address, device, uuid);
   ctx.spawn(async move {
      Command::Completed(id, Completion::SdpSearched {
         device,
         browse,
         result: search.await,
      })
   })
}

fn discover_primaries(
   ctx: &Context,
   adapter: AdapterId,
   device: Address,
   browse: u64,
   link: &AttLink,
) -> Task {
   let discover = ctx.transport.discover_primaries(link);
   ctx.spawn(async move {
      Command::Completed(adapter, Completion::PrimariesDiscovered {
         device,
         browse,
         result: discover.await,
      })
   })
}

impl Adapter {
   pub(crate) fn discover_services(
      &mut self,
      ctx: &Context,
      address: Address,
      caller: CallerId,
      pattern: Option<Uuid>,
      reply: Reply<Vec<SdpRecord>>,
   ) {
      if let Err(e) = self.require_powered() {
         answer(reply, Err(e));
         return;
      }
      debug!("{}: {caller} browsing {address}", self.id);
      self.start_browse(ctx, address, pattern, BrowseOrigin::Caller(caller, reply));
   }

   /// Starts browsing `address`; `pattern` is searched after the root UUIDs.
   pub(crate) fn start_browse(
      &mut self,
      ctx: &Context,
      address: Address,
      pattern: Option<Uuid>,
      origin: BrowseOrigin,
   ) {
      let id = self.id;
      let adapter_address = self.address;
      let Some(device) = self.devices.get_mut(&address) else {
         origin.fail(Error::DoesNotExist);
         return;
      };
      if device.browse.is_some() {
         self.settle_origin(ctx, address, origin, Err(Error::Busy));
         return;
      }

      let kind = if device.address_type.is_le() {
         BrowseKind::Primary
      } else {
         BrowseKind::Sdp
      };
      if kind == BrowseKind::Primary && !device.primaries.is_empty() {
         self.settle_origin(ctx, address, origin, Err(Error::NotSupported));
         return;
      }

      let browse = ctx.next_id();
      let mut search: SmallVec<[Uuid; 4]> = uuids::BROWSE_ROOTS.into_iter().collect();
      if let Some(pattern) = pattern
         && !search.contains(&pattern)
      {
         search.push(pattern);
      }

      let task = match (kind, &device.att) {
         (BrowseKind::Sdp, _) => search_sdp(ctx, (id, adapter_address), address, browse, search[0]),
         (BrowseKind::Primary, Some(link)) => discover_primaries(ctx, id, address, browse, link),
         (BrowseKind::Primary, None) => {
            let connect = ctx.transport.att_connect(
               adapter_address,
               address,
               device.address_type,
               SecurityLevel::Low,
            );
            ctx.spawn(async move {
               Command::Completed(id, Completion::AttConnected {
                  device: address,
                  purpose: AttPurpose::Browse(browse),
                  result: connect.await,
               })
            })
         },
      };

      device.browse = Some(BrowseRequest {
         id: browse,
         kind,
         origin,
         search,
         cursor: 0,
         records: Vec::new(),
         retried: false,
         task: Some(task),
      });
   }

   pub(crate) fn on_sdp_searched(
      &mut self,
      ctx: &Context,
      address: Address,
      browse: u64,
      result: Result<Vec<SdpRecord>>,
   ) {
      let id = self.id;
      let adapter_address = self.address;
      let Some(request) = self
         .devices
         .get_mut(&address)
         .and_then(|d| d.browse.as_mut())
         .filter(|b| b.id == browse)
      else {
         return;
      };

      match result {
         Ok(records) => {
            request.add_records(records);
            request.cursor += 1;
         },
         Err(Error::ConnectionReset) if !request.retried => {
            debug!("{id}: SDP connection to {address} reset, retrying");
            request.retried = true;
         },
         Err(e) => {
            self.fail_browse(ctx, address, e);
            return;
         },
      }

      match request.search.get(request.cursor) {
         Some(&uuid) => {
            request.task = Some(search_sdp(ctx, (id, adapter_address), address, browse, uuid));
         },
         None => self.finish_sdp_browse(ctx, address),
      }
   }

   fn finish_sdp_browse(&mut self, ctx: &Context, address: Address) {
      let id = self.id;
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(request) = device.browse.take() else {
         return;
      };

      let records = request.records;
      let reported: BTreeSet<Uuid> = records.iter().filter_map(SdpRecord::profile_uuid).collect();
      debug!(
         "{id}: {address} has {} records, {} services",
         records.len(),
         reported.len()
      );
      device.sdp_records.clone_from(&records);
      device.update_services(ctx, id, &reported);
      self.store_device(ctx, address);
      self.settle_origin(ctx, address, request.origin, Ok(&records));
   }

   /// The ATT link requested for a primary browse is up (or failed).
   pub(crate) fn on_browse_link(
      &mut self,
      ctx: &Context,
      address: Address,
      browse: u64,
      result: Result<()>,
   ) {
      let id = self.id;
      if let Err(e) = result {
         self.fail_browse(ctx, address, e);
         return;
      }
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let (Some(request), Some(link)) = (device.browse.as_mut(), device.att.as_ref()) else {
         self.fail_browse(ctx, address, Error::NotConnected);
         return;
      };
      if request.id == browse {
         request.task = Some(discover_primaries(ctx, id, address, browse, link));
      }
   }

   pub(crate) fn on_primaries_discovered(
      &mut self,
      ctx: &Context,
      address: Address,
      browse: u64,
      result: Result<Vec<PrimaryService>>,
   ) {
      let id = self.id;
      let current = self
         .devices
         .get(&address)
         .and_then(|d| d.browse.as_ref())
         .is_some_and(|b| b.id == browse);
      if !current {
         return;
      }
      let primaries = match result {
         Ok(primaries) => primaries,
         Err(e) => {
            self.fail_browse(ctx, address, e);
            return;
         },
      };

      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(request) = device.browse.take() else {
         return;
      };
      debug!("{id}: {address} has {} primary services", primaries.len());
      let reported: BTreeSet<Uuid> = primaries.iter().map(|p| p.uuid).collect();
      device.primaries = primaries;
      device.update_services(ctx, id, &reported);
      self.store_device(ctx, address);
      self.settle_origin(ctx, address, request.origin, Ok(&[]));
      self.release_idle_link(ctx, address);
   }

   /// Clears the browse request, answering its origin with `err`.
   pub(crate) fn fail_browse(&mut self, ctx: &Context, address: Address, err: Error) {
      let Some(request) = self
         .devices
         .get_mut(&address)
         .and_then(|d| d.browse.take())
      else {
         return;
      };
      warn!("{}: browsing {address} failed: {err}", self.id);
      self.settle_origin(ctx, address, request.origin, Err(err));
      if request.kind == BrowseKind::Primary {
         self.release_idle_link(ctx, address);
      }
   }

   /// Aborts the browse of `address`, if any.
   pub(crate) fn cancel_browse(&mut self, ctx: &Context, address: Address, err: Error) -> bool {
      let Some(request) = self
         .devices
         .get_mut(&address)
         .and_then(|d| d.browse.take())
      else {
         return false;
      };
      debug!("{}: browse of {address} canceled", self.id);
      self.settle_origin(ctx, address, request.origin, Err(err));
      true
   }

   pub(crate) fn cancel_discovery(
      &mut self,
      ctx: &Context,
      address: Address,
      caller: &CallerId,
   ) -> Result<()> {
      let device = self.devices.get(&address).ok_or(Error::DoesNotExist)?;
      let request = device.browse.as_ref().ok_or(Error::DoesNotExist)?;
      if request.origin.caller() != Some(caller) {
         return Err(Error::NotAuthorized);
      }
      self.cancel_browse(ctx, address, Error::Canceled);
      Ok(())
   }

   fn settle_origin(
      &mut self,
      ctx: &Context,
      address: Address,
      origin: BrowseOrigin,
      result: Result<&[SdpRecord]>,
   ) {
      match origin {
         BrowseOrigin::Caller(_, reply) => answer(reply, result.map(<[SdpRecord]>::to_vec)),
         BrowseOrigin::CreateDevice(caller, reply) => match result {
            Ok(_) => {
               info!("{}: {address} created by {caller}", self.id);
               self.keep_device(ctx, address);
               answer(reply, Ok(()));
            },
            Err(e) => {
               answer(reply, Err(e));
               self.schedule_removal(ctx, address);
            },
         },
         BrowseOrigin::Bonding(bonding) => {
            self.finish_bonding(ctx, address, bonding, result.map(|_| ()));
         },
         BrowseOrigin::Internal => {},
      }
   }

   pub(crate) fn on_reverse_discovery(&mut self, ctx: &Context, address: Address, generation: u64) {
      let Some(device) = self.devices.get_mut(&address) else {
         return;
      };
      if !take_fired(&mut device.reverse_discovery, generation) || device.browse.is_some() {
         return;
      }
      debug!("{}: reverse service discovery of {address}", self.id);
      self.start_browse(ctx, address, None, BrowseOrigin::Internal);
   }
}

#[cfg(test)]
mod tests {
   use std::collections::BTreeSet;

   use super::*;
   use crate::{
      backend::SdpRecord,
      storage::DeviceRecord,
      testutil::{Harness, MockDriver, addr, caller},
   };

   fn record(handle: u32, uuid: Uuid) -> SdpRecord {
      SdpRecord {
         handle,
         service_classes: vec![uuid],
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_rebrowse_diffs_service_set() {
      let a = uuids::from_u16(0x1124);
      let b = uuids::from_u16(0x1105);
      let c = uuids::from_u16(0x1106);
      let driver_a = MockDriver::new("a", &[a]);
      let driver_b = MockDriver::new("b", &[b]);
      let driver_c = MockDriver::new("c", &[c]);
      let device = addr(1);
      let h = Harness::builder()
         .driver(driver_a.clone())
         .driver(driver_b.clone())
         .driver(driver_c.clone())
         .record(
            device,
            DeviceRecord {
               uuids: vec![a, b],
               ..Default::default()
            },
         )
         .build()
         .await;

      // Two roots return the same record; it is kept once
      h.transport
         .set_records(uuids::L2CAP, vec![record(1, b), record(2, c)]);
      h.transport
         .set_records(uuids::PUBLIC_BROWSE_GROUP, vec![record(2, c)]);

      let records = h
         .adapter
         .device(device)
         .discover_services(caller(":1.1"), None)
         .await
         .unwrap();
      assert_eq!(records.len(), 2);

      let info = h.adapter.device(device).info().await.unwrap();
      assert_eq!(info.uuids.iter().copied().collect::<BTreeSet<_>>(), [b, c].into());
      assert_eq!(driver_a.removes(device), 1);
      assert_eq!(driver_b.removes(device), 0);
      assert_eq!(driver_c.probes(device), 1);

      // Browsing again does not bind C twice
      h.adapter
         .device(device)
         .discover_services(caller(":1.1"), None)
         .await
         .unwrap();
      assert_eq!(driver_c.probes(device), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_active_audio_profile_survives_omission() {
      let sink = MockDriver::new("a2dp", &[uuids::A2DP_SINK]);
      sink.set_active(true);
      let device = addr(2);
      let h = Harness::builder()
         .driver(sink.clone())
         .record(
            device,
            DeviceRecord {
               uuids: vec![uuids::A2DP_SINK],
               ..Default::default()
            },
         )
         .build()
         .await;

      h.adapter
         .device(device)
         .discover_services(caller(":1.1"), None)
         .await
         .unwrap();
      let info = h.adapter.device(device).info().await.unwrap();
      assert_eq!(info.uuids, vec![uuids::A2DP_SINK]);
      assert_eq!(sink.removes(device), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_one_browse_per_device() {
      let h = Harness::new().await;
      let device = addr(3);
      h.trusted_device(device).await;
      h.transport.hold_sdp(true);

      let handle = h.adapter.device(device);
      let first = tokio::spawn({
         let handle = handle.clone();
         async move { handle.discover_services(caller(":1.1"), None).await }
      });
      h.settle().await;
      assert!(handle.info().await.unwrap().browsing);
      assert!(matches!(
         handle.discover_services(caller(":1.2"), None).await,
         Err(Error::Busy)
      ));

      // Only the owner may cancel
      assert!(matches!(
         handle.cancel_discovery(caller(":1.2")).await,
         Err(Error::NotAuthorized)
      ));
      handle.cancel_discovery(caller(":1.1")).await.unwrap();
      assert!(matches!(first.await.unwrap(), Err(Error::Canceled)));
      assert!(!handle.info().await.unwrap().browsing);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connection_reset_retried_once() {
      let h = Harness::new().await;
      let device = addr(4);
      h.trusted_device(device).await;
      h.transport.set_records(uuids::L2CAP, vec![record(7, uuids::HFP_AG)]);
      h.transport.fail_sdp(vec![Error::ConnectionReset]);

      let records = h
         .adapter
         .device(device)
         .discover_services(caller(":1.1"), None)
         .await
         .unwrap();
      assert_eq!(records, vec![record(7, uuids::HFP_AG)]);
      assert_eq!(h.transport.sdp_queries(), 4);

      h.transport
         .fail_sdp(vec![Error::ConnectionReset, Error::ConnectionReset]);
      assert!(matches!(
         h.adapter
            .device(device)
            .discover_services(caller(":1.1"), None)
            .await,
         Err(Error::ConnectionReset)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_create_device_removed_when_browse_fails() {
      let h = Harness::new().await;
      let device = addr(5);
      h.transport.fail_sdp(vec![Error::ConnectionAttemptFailed("Page Timeout")]);

      assert!(matches!(
         h.adapter.create_device(caller(":1.1"), device).await,
         Err(Error::ConnectionAttemptFailed(_))
      ));
      h.settle().await;
      assert!(!h.adapter.list_devices().await.unwrap().contains(&device));

      let other = addr(6);
      h.adapter.create_device(caller(":1.1"), other).await.unwrap();
      assert!(!h.adapter.device(other).info().await.unwrap().temporary);
      assert!(matches!(
         h.adapter.create_device(caller(":1.1"), other).await,
         Err(Error::AlreadyExists)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_caller_exit_cancels_browse() {
      let h = Harness::new().await;
      let device = addr(7);
      h.trusted_device(device).await;
      h.transport.hold_sdp(true);
      let who = caller(":1.1");

      let pending = tokio::spawn({
         let handle = h.adapter.device(device);
         let who = who.clone();
         async move { handle.discover_services(who, None).await }
      });
      h.settle().await;
      h.manager.caller_exited(who).await.unwrap();
      assert!(matches!(pending.await.unwrap(), Err(Error::Canceled)));
   }

   #[tokio::test(start_paused = true)]
   async fn test_le_browse_discovers_primaries_once() {
      let h = Harness::new().await;
      let device = addr(8);
      h.found_le(device).await;
      h.transport.set_primaries(vec![PrimaryService {
         uuid: uuids::GAP,
         start: 1,
         end: 7,
      }]);

      h.adapter.create_device(caller(":1.1"), device).await.unwrap();
      let info = h.adapter.device(device).info().await.unwrap();
      assert_eq!(info.primaries.len(), 1);
      assert_eq!(info.uuids, vec![uuids::GAP]);
      // The link opened for browsing is dropped afterwards
      assert_eq!(h.transport.disconnects(), 1);

      assert!(matches!(
         h.adapter
            .device(device)
            .discover_services(caller(":1.1"), None)
            .await,
         Err(Error::NotSupported)
      ));
   }
}
