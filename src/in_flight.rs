//! The in-flight registry coalesces concurrent lookups of the same
//! key: the first lookup starts a ticket and does the work, later
//! ones join the ticket as waiters, and completing the ticket hands
//! every waiter to the caller exactly once.
//!
//! There is at most one ticket per key.  Completion removes the
//! ticket before any waiter is notified, so a lookup that arrives
//! during fanout starts afresh; by then the outcome has already been
//! stored in the memory and disk tiers, so it finds it there.
//!
//! Each ticket also remembers the deepest [`Depth`] any of its
//! lookups allows.  Whoever does the work only gives up once it has
//! tried that deep: [`InFlightRegistry::complete_at`] refuses to fail
//! a ticket that a deeper lookup joined in the meantime.
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::key::HashedKey;
use crate::Depth;

/// What [`InFlightRegistry::join_or_start`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Join {
    /// A ticket already existed; the waiter was added to it.
    Joined,
    /// There was no ticket; the caller now owns a new one and must
    /// eventually [`InFlightRegistry::complete`] it.
    Started,
}

struct Ticket<W> {
    depth: Depth,
    waiters: Vec<W>,
}

/// Map from keys to the ticket for that key.
pub struct InFlightRegistry<W> {
    tickets: Mutex<HashMap<HashedKey, Ticket<W>>>,
}

impl<W> std::fmt::Debug for InFlightRegistry<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("tickets", &self.tickets.lock().len())
            .finish()
    }
}

impl<W> Default for InFlightRegistry<W> {
    fn default() -> Self {
        InFlightRegistry {
            tickets: Mutex::new(HashMap::new()),
        }
    }
}

fn notify_all<W>(waiters: Vec<W>, mut notify: impl FnMut(W)) -> usize {
    let count = waiters.len();

    for waiter in waiters {
        notify(waiter);
    }

    count
}

impl<W> InFlightRegistry<W> {
    /// Adds `waiter` (if any) to the ticket for `key`, creating the
    /// ticket if there is none, and raises the ticket's depth to
    /// `depth`.
    pub fn join_or_start(&self, key: &HashedKey, depth: Depth, waiter: Option<W>) -> Join {
        let mut tickets = self.tickets.lock();

        match tickets.get_mut(key) {
            Some(ticket) => {
                ticket.depth = ticket.depth.max(depth);
                ticket.waiters.extend(waiter);
                Join::Joined
            }
            None => {
                tickets.insert(
                    key.clone(),
                    Ticket {
                        depth,
                        waiters: waiter.into_iter().collect(),
                    },
                );
                Join::Started
            }
        }
    }

    /// Removes the ticket for `key` and passes each of its waiters to
    /// `notify`, outside the registry lock.  Returns the number of
    /// waiters notified.
    pub fn complete(&self, key: &HashedKey, notify: impl FnMut(W)) -> usize {
        let waiters = self
            .tickets
            .lock()
            .remove(key)
            .map(|ticket| ticket.waiters)
            .unwrap_or_default();

        notify_all(waiters, notify)
    }

    /// Like [`InFlightRegistry::complete`], for work that only went as
    /// deep as `reached`.  If a lookup joined with a deeper depth, the
    /// ticket stays and this returns that depth as `Err`: the owner
    /// must keep going.
    pub fn complete_at(
        &self,
        key: &HashedKey,
        reached: Depth,
        notify: impl FnMut(W),
    ) -> Result<usize, Depth> {
        let waiters = {
            let mut tickets = self.tickets.lock();

            match tickets.get(key) {
                Some(ticket) if ticket.depth > reached => return Err(ticket.depth),
                Some(_) => tickets.remove(key).map(|ticket| ticket.waiters),
                None => None,
            }
        };

        Ok(notify_all(waiters.unwrap_or_default(), notify))
    }

    /// Detaches the first waiter for `key` that `matches`.  The ticket
    /// stays even if it has no waiter left: the work continues and
    /// still populates the cache.  Returns whether a waiter was
    /// removed.
    pub fn cancel_waiter(&self, key: &HashedKey, matches: impl Fn(&W) -> bool) -> bool {
        let mut tickets = self.tickets.lock();

        match tickets.get_mut(key) {
            Some(ticket) => match ticket.waiters.iter().position(|w| matches(w)) {
                Some(index) => {
                    ticket.waiters.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Returns whether there is a ticket for `key`.
    pub fn contains(&self, key: &HashedKey) -> bool {
        self.tickets.lock().contains_key(key)
    }

    /// Returns the number of waiters on the ticket for `key`, if any.
    pub fn waiter_count(&self, key: &HashedKey) -> Option<usize> {
        self.tickets.lock().get(key).map(|ticket| ticket.waiters.len())
    }

    /// Returns the depth of the ticket for `key`, if any.
    pub fn depth(&self, key: &HashedKey) -> Option<Depth> {
        self.tickets.lock().get(key).map(|ticket| ticket.depth)
    }
}
