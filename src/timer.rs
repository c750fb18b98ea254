//! Spawned steps and one-shot timers delivered through the manager's loopback
//! queue.
//!
//! A fired timer only carries its target and generation; the owner checks the
//! generation against the timer it currently holds, so a timer that raced with
//! a disarm (or with its slot being re-armed) is ignored.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
   address::{AdapterId, Address},
   manager::Command,
};

/// A spawned protocol step. Dropping it aborts the step.
#[derive(Debug)]
pub(crate) struct Task(JoinHandle<()>);

impl Task {
   pub(crate) const fn new(handle: JoinHandle<()>) -> Self {
      Self(handle)
   }
}

impl Drop for Task {
   fn drop(&mut self) {
      self.0.abort();
   }
}

/// What a timer fires into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
   DiscoverableTimeout(AdapterId),
   PairableTimeout(AdapterId),
   DiscoveryRestart(AdapterId),
   DisconnectGrace(AdapterId, Address),
   ReverseDiscovery(AdapterId, Address),
   Reconnect(AdapterId, Address),
}

impl TimerTarget {
   pub(crate) const fn adapter(self) -> AdapterId {
      match self {
         Self::DiscoverableTimeout(id)
         | Self::PairableTimeout(id)
         | Self::DiscoveryRestart(id)
         | Self::DisconnectGrace(id, _)
         | Self::ReverseDiscovery(id, _)
         | Self::Reconnect(id, _) => id,
      }
   }
}

/// An armed timer. Dropping it disarms it.
#[derive(Debug)]
pub(crate) struct Timer {
   generation: u64,
   _task: Task,
}

impl Timer {
   pub(crate) fn spawn(
      loopback: &mpsc::Sender<Command>,
      generation: u64,
      delay: Duration,
      target: TimerTarget,
   ) -> Self {
      let loopback = loopback.clone();
      let handle = tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(Command::TimerFired(target, generation)).await;
      });
      Self {
         generation,
         _task: Task::new(handle),
      }
   }

   pub(crate) const fn generation(&self) -> u64 {
      self.generation
   }
}

/// Takes the timer out of `slot` if it is the one that fired.
///
/// Returns `false` for stale fires, leaving the slot untouched.
pub(crate) fn take_fired(slot: &mut Option<Timer>, generation: u64) -> bool {
   if slot.as_ref().is_some_and(|t| t.generation() == generation) {
      slot.take();
      true
   } else {
      false
   }
}
