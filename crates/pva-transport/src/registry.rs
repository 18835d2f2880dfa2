//! Transport registry: at most one live transport per (peer, priority).
//!
//! Lookups go through a `DashMap` and never block. Establishing a new
//! connection additionally takes a per-key [`Reservation`], so concurrent
//! connects to the same peer and priority queue up behind one another while
//! connects to other peers proceed in parallel. Reservation locks are
//! allocated on first use and dropped again once nobody holds or waits for
//! them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;

use crate::error::ConnectError;
use crate::transport::Transport;

/// Identity of a shared transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub addr: SocketAddr,
    pub priority: i16,
}

impl TransportKey {
    pub fn new(addr: SocketAddr, priority: i16) -> Self {
        Self { addr, priority }
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.priority)
    }
}

type ReservationLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct TransportRegistry {
    transports: DashMap<TransportKey, Arc<Transport>>,
    reservations: Mutex<HashMap<TransportKey, ReservationLock>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &TransportKey) -> Option<Arc<Transport>> {
        self.transports.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Snapshot of every installed transport.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Insert `transport` under its key. A closed leftover under the same
    /// key is replaced; a live one is a logic error.
    pub fn install(&self, transport: Arc<Transport>) -> Result<(), ConnectError> {
        let key = transport.key();
        match self.transports.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    tracing::error!(%key, "transport already installed under this key");
                    return Err(ConnectError::DuplicateInstall(key));
                }
                occupied.insert(transport);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(transport);
            }
        }
        tracing::debug!(%key, "transport installed");
        Ok(())
    }

    /// Remove `transport` if it is the one installed under its key. Safe to
    /// call more than once.
    pub fn remove(&self, transport: &Transport) {
        let key = transport.key();
        let removed = self
            .transports
            .remove_if(&key, |_, installed| std::ptr::eq(Arc::as_ptr(installed), transport));
        if removed.is_some() {
            tracing::debug!(%key, "transport removed");
        }
    }

    /// Take the connect-time lock for `key`, waiting at most `timeout`.
    pub async fn reserve(
        &self,
        key: TransportKey,
        timeout: Duration,
    ) -> Result<Reservation<'_>, ConnectError> {
        let lock = {
            let mut reservations =
                self.reservations.lock().unwrap_or_else(PoisonError::into_inner);
            reservations.entry(key).or_default().clone()
        };

        let acquired = tokio::time::timeout(timeout, lock.clone().lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(Reservation { registry: self, key, lock, guard: Some(guard) }),
            Err(_) => {
                // Drop our clone through the same path a reservation uses.
                self.release_reservation(key, &lock);
                tracing::warn!(%key, ?timeout, "reservation wait timed out");
                Err(ConnectError::PossibleDeadlock { key, waited: timeout })
            }
        }
    }

    /// Forget the lock for `key` if only the map and `lock` still refer to it.
    fn release_reservation(&self, key: TransportKey, lock: &ReservationLock) {
        let mut reservations = self.reservations.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = reservations
            .get(&key)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
        if unused {
            reservations.remove(&key);
        }
    }

    /// Number of keys that currently have a reservation lock allocated.
    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive right to establish the transport for one key. Released on drop.
pub struct Reservation<'a> {
    registry: &'a TransportRegistry,
    key: TransportKey,
    lock: ReservationLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Reservation<'_> {
    pub fn key(&self) -> TransportKey {
        self.key
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        // The guard holds its own clone of the lock; let it go first so the
        // strong count only reflects the map and waiters.
        self.guard.take();
        self.registry.release_reservation(self.key, &self.lock);
    }
}
