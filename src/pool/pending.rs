use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::{connection::Connection, endpoint::Connector, error::Error};

pub(crate) type WaiterId = u64;

/// What a caller waiting on another caller's connection attempt is told once that attempt ends.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// The attempt connected through a connector the waiter asked for.
    Connected(Connection),
    /// The attempt ended without serving the waiter, try again with these connectors.
    Retry(Vec<Connector>),
    /// Every connector the waiter asked for failed.
    Failed(Error),
}

struct Waiter {
    /// Connectors not yet known to have failed
    connectors: Vec<Connector>,
    tx: oneshot::Sender<WaitOutcome>,
}

/// Tracks in-flight connection attempts per connector and the callers waiting on them.
///
/// A connector is in flight while some `acquire` call has claimed it. Other calls needing any
/// in-flight connector attach to it instead of dialing, so a connector is never dialed twice at once.
#[derive(Default)]
pub(crate) struct PendingConnects {
    in_flight: HashMap<Connector, HashSet<WaiterId>>,
    waiters: HashMap<WaiterId, Waiter>,
    next_waiter: WaiterId,
}

impl PendingConnects {
    /// Returns true if any of `connectors` has an attempt in progress.
    pub(crate) fn is_pending(&self, connectors: &[Connector]) -> bool {
        connectors
            .iter()
            .any(|connector| self.in_flight.contains_key(connector))
    }

    /// Attaches a waiter to every in-flight connector among `connectors`.
    pub(crate) fn attach(&mut self, connectors: Vec<Connector>) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        self.next_waiter += 1;
        let id = self.next_waiter;
        for connector in &connectors {
            if let Some(waiters) = self.in_flight.get_mut(connector) {
                waiters.insert(id);
            }
        }
        self.waiters.insert(id, Waiter { connectors, tx });
        rx
    }

    /// Marks `connectors` as in flight for the calling attempt.
    pub(crate) fn claim(&mut self, connectors: &[Connector]) {
        for connector in connectors {
            debug_assert!(!self.in_flight.contains_key(connector));
            self.in_flight.insert(connector.clone(), HashSet::new());
        }
    }

    /// Ends a successful attempt.
    ///
    /// Waiters that asked for `winner` receive the connection, the others are told to retry.
    pub(crate) fn complete_success(
        &mut self,
        claimed: &[Connector],
        winner: &Connector,
        connection: &Connection,
    ) {
        for id in self.release(claimed) {
            let Some(waiter) = self.detach(id) else {
                continue;
            };
            let outcome = if waiter.connectors.contains(winner) {
                WaitOutcome::Connected(connection.clone())
            } else {
                WaitOutcome::Retry(waiter.connectors)
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    /// Ends a failed attempt.
    ///
    /// Waiters left without any untried connector receive `error`, the others retry with what remains.
    pub(crate) fn complete_failure(&mut self, claimed: &[Connector], error: &Error) {
        for id in self.release(claimed) {
            let Some(mut waiter) = self.detach(id) else {
                continue;
            };
            waiter
                .connectors
                .retain(|connector| !claimed.contains(connector));
            let outcome = if waiter.connectors.is_empty() {
                WaitOutcome::Failed(error.clone())
            } else {
                WaitOutcome::Retry(waiter.connectors)
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    /// Ends an attempt that stopped without an outcome, such as a dropped `acquire` future.
    pub(crate) fn abandon(&mut self, claimed: &[Connector]) {
        for id in self.release(claimed) {
            if let Some(waiter) = self.detach(id) {
                let _ = waiter.tx.send(WaitOutcome::Retry(waiter.connectors));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Removes the claimed connectors, returning every waiter attached to them.
    fn release(&mut self, claimed: &[Connector]) -> Vec<WaiterId> {
        let mut ids: Vec<WaiterId> = Vec::new();
        for connector in claimed {
            if let Some(waiters) = self.in_flight.remove(connector) {
                for id in waiters {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Removes a waiter from every connector it is still attached to.
    fn detach(&mut self, id: WaiterId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&id)?;
        for connector in &waiter.connectors {
            if let Some(waiters) = self.in_flight.get_mut(connector) {
                waiters.remove(&id);
            }
        }
        Some(waiter)
    }
}
