//! Reference-counted sessions keyed by caller identity.
//!
//! Mode sessions carry the mode their owner asked for; discovery sessions
//! carry nothing. Re-acquiring from the same owner bumps the refcount instead
//! of creating a second session.

use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::adapter::Mode;

/// Identity of an external caller (its control-plane connection name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerId(pub SmolStr);

impl CallerId {
   pub fn new(name: impl Into<SmolStr>) -> Self {
      Self(name.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for CallerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

#[derive(Debug)]
struct Session<T> {
   owner: CallerId,
   value: T,
   refs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
   Created,
   Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Released {
   /// The owner still holds references.
   Held,
   /// The owner's session is gone.
   Dropped,
}

#[derive(Debug)]
pub(crate) struct SessionList<T> {
   sessions: Vec<Session<T>>,
}

impl<T> Default for SessionList<T> {
   fn default() -> Self {
      Self {
         sessions: Vec::new(),
      }
   }
}

impl<T> SessionList<T> {
   pub(crate) fn acquire(&mut self, owner: &CallerId, value: T) -> Acquired {
      if let Some(session) = self.sessions.iter_mut().find(|s| s.owner == *owner) {
         session.refs += 1;
         return Acquired::Existing;
      }
      self.sessions.push(Session {
         owner: owner.clone(),
         value,
         refs: 1,
      });
      Acquired::Created
   }

   /// Drops one reference; `None` if the owner holds no session.
   pub(crate) fn release(&mut self, owner: &CallerId) -> Option<Released> {
      let idx = self.sessions.iter().position(|s| s.owner == *owner)?;
      let session = &mut self.sessions[idx];
      session.refs -= 1;
      if session.refs > 0 {
         return Some(Released::Held);
      }
      self.sessions.remove(idx);
      Some(Released::Dropped)
   }

   /// Drops every reference held by `owner`.
   pub(crate) fn remove_owner(&mut self, owner: &CallerId) -> bool {
      let before = self.sessions.len();
      self.sessions.retain(|s| s.owner != *owner);
      self.sessions.len() != before
   }

   pub(crate) fn contains(&self, owner: &CallerId) -> bool {
      self.sessions.iter().any(|s| s.owner == *owner)
   }

   pub(crate) fn refs(&self, owner: &CallerId) -> u32 {
      self
         .sessions
         .iter()
         .find(|s| s.owner == *owner)
         .map_or(0, |s| s.refs)
   }

   pub(crate) fn is_empty(&self) -> bool {
      self.sessions.is_empty()
   }

   pub(crate) fn len(&self) -> usize {
      self.sessions.len()
   }

   pub(crate) fn clear(&mut self) {
      self.sessions.clear();
   }
}

impl SessionList<Mode> {
   /// Highest mode requested by any live session.
   pub(crate) fn max_mode(&self) -> Option<Mode> {
      self.sessions.iter().map(|s| s.value).max()
   }
}
