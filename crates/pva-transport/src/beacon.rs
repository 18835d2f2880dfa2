//! Beacon tracking.
//!
//! Servers announce themselves periodically. A server we have not heard of,
//! or a known address announcing a new GUID (the server restarted), may
//! host channels we are still looking for, so pending searches are boosted.
//! Servers that stop beaconing are forgotten by a separate expiry task, so a
//! server that comes back counts as new.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use pva_core::message::Beacon;
use pva_core::ServerGuid;

use crate::search::SearchManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconEvent {
    NewServer,
    Restarted,
    /// Same server, its channel set changed.
    Changed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub guid: ServerGuid,
    pub change_count: u16,
    pub last_seen: Instant,
}

pub struct BeaconTracker {
    servers: DashMap<SocketAddr, ServerEntry>,
    search: Arc<SearchManager>,
}

impl BeaconTracker {
    pub fn new(search: Arc<SearchManager>) -> Self {
        Self { servers: DashMap::new(), search }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server(&self, addr: &SocketAddr) -> Option<ServerEntry> {
        self.servers.get(addr).map(|entry| entry.value().clone())
    }

    /// Account for one beacon received from `source`.
    pub fn beacon_received(&self, beacon: &Beacon, source: SocketAddr) -> BeaconEvent {
        let server = if pva_core::buffer::is_unspecified(beacon.server_addr.ip()) {
            SocketAddr::new(source.ip(), beacon.server_addr.port())
        } else {
            beacon.server_addr
        };
        let now = Instant::now();

        let event = match self.servers.entry(server) {
            Entry::Vacant(vacant) => {
                vacant.insert(ServerEntry {
                    guid: beacon.guid,
                    change_count: beacon.change_count,
                    last_seen: now,
                });
                BeaconEvent::NewServer
            }
            Entry::Occupied(mut occupied) => {
                let known = occupied.get_mut();
                let event = if known.guid != beacon.guid {
                    BeaconEvent::Restarted
                } else if known.change_count != beacon.change_count {
                    BeaconEvent::Changed
                } else {
                    BeaconEvent::Unchanged
                };
                known.guid = beacon.guid;
                known.change_count = beacon.change_count;
                known.last_seen = now;
                event
            }
        };

        match event {
            BeaconEvent::NewServer | BeaconEvent::Restarted => {
                tracing::debug!(%server, guid = %beacon.guid, ?event, "server detected");
                self.search.new_server_detected();
            }
            BeaconEvent::Changed => {
                tracing::debug!(%server, change_count = beacon.change_count, "server channel set changed");
            }
            BeaconEvent::Unchanged => {
                tracing::trace!(%server, seq = beacon.sequence_id, "beacon");
            }
        }
        event
    }

    /// Forget servers last heard from `ttl` or longer before `now`.
    /// Returns how many were removed.
    pub fn expire_at(&self, now: Instant, ttl: Duration) -> usize {
        let before = self.servers.len();
        self.servers.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < ttl);
        let removed = before.saturating_sub(self.servers.len());
        if removed > 0 {
            tracing::debug!(removed, "expired beacon entries");
        }
        removed
    }

    /// Run [`expire_at`](Self::expire_at) every second until shutdown.
    pub async fn expiry_loop(self: Arc<Self>, ttl: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    self.expire_at(Instant::now(), ttl);
                }
            }
        }
    }
}
