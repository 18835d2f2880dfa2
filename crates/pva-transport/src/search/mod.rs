//! Channel search over UDP.

mod frame;
pub mod listener;
mod manager;

pub use frame::SearchFrame;
pub use manager::{SearchManager, SearchTargets, BOOST_VALUE, FALLBACK_VALUE, MAX_COUNTER_VALUE};

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use pva_core::ServerGuid;

/// A channel that wants to be found.
pub trait SearchInstance: Send + Sync {
    fn search_instance_id(&self) -> u32;

    fn search_channel_name(&self) -> String;

    /// A server answered. May be called again for duplicate answers.
    fn search_response(&self, guid: ServerGuid, minor_revision: u8, server_addr: SocketAddr);
}

/// Non-blocking datagram output used by the search manager.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize>;
}

/// Sends straight through the socket, so a datagram goes out even before
/// the runtime has polled the socket for writability.
impl DatagramSink for socket2::Socket {
    fn send_datagram(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        self.send_to(datagram, &target.into())
    }
}

/// Every channel the context knows about, found or not, by channel id.
/// Held weakly; dropped channels disappear on lookup.
#[derive(Clone, Default)]
pub struct ChannelDirectory {
    channels: Arc<DashMap<u32, Weak<dyn SearchInstance>>>,
}

impl ChannelDirectory {
    pub fn insert(&self, channel_id: u32, instance: Weak<dyn SearchInstance>) {
        self.channels.insert(channel_id, instance);
    }

    pub fn remove(&self, channel_id: u32) {
        self.channels.remove(&channel_id);
    }

    pub fn get(&self, channel_id: u32) -> Option<Arc<dyn SearchInstance>> {
        let instance = self.channels.get(&channel_id)?.upgrade();
        if instance.is_none() {
            self.channels.remove(&channel_id);
        }
        instance
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
