//! Search manager: UDP channel search with exponential back-off.
//!
//! Every pending channel carries a counter. Each cycle bumps it and the
//! channel is only put on the wire when the counter is a power of two, so
//! retries thin out as 1, 2, 4, 8, ... cycles apart. At 256 the counter
//! drops back to 129 instead of 1, keeping long-lost channels at one search
//! every 128 cycles.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::broadcast;

use pva_core::config::SearchConfig;
use pva_core::ByteOrder;
use pva_core::ServerGuid;

use super::frame::SearchFrame;
use super::{ChannelDirectory, DatagramSink, SearchInstance};

/// Counter value for a fresh or boosted search: sent on the next cycle.
pub const BOOST_VALUE: u32 = 1;
/// Counter ceiling.
pub const MAX_COUNTER_VALUE: u32 = 256;
/// Where the counter restarts after the ceiling, and where penalized
/// searches start.
pub const FALLBACK_VALUE: u32 = MAX_COUNTER_VALUE / 2 + 1;

struct SearchEntry {
    instance: Arc<dyn SearchInstance>,
    counter: u32,
}

struct Pending {
    entries: BTreeMap<u32, SearchEntry>,
    frame: SearchFrame,
    last_cycle: Option<Instant>,
}

/// Where search frames go. Unicast targets get the unicast mask bit.
#[derive(Debug, Clone, Default)]
pub struct SearchTargets {
    pub unicast: Vec<SocketAddr>,
    pub broadcast: Vec<SocketAddr>,
}

impl SearchTargets {
    pub fn classify(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let (broadcast, unicast) =
            addrs.into_iter().partition(pva_core::config::is_broadcast_target);
        Self { unicast, broadcast }
    }

    pub fn is_empty(&self) -> bool {
        self.unicast.is_empty() && self.broadcast.is_empty()
    }
}

pub struct SearchManager {
    pending: Mutex<Pending>,
    directory: ChannelDirectory,
    sink: Arc<dyn DatagramSink>,
    targets: SearchTargets,
    sequence: AtomicU32,
    canceled: AtomicBool,
    period: Duration,
    jitter: Duration,
    min_cycle_gap: Duration,
    shutdown: broadcast::Sender<()>,
}

impl SearchManager {
    /// `response_addr` goes into every frame as the address servers reply
    /// to; an unspecified address makes them use the datagram source.
    pub fn new(
        config: &SearchConfig,
        sink: Arc<dyn DatagramSink>,
        targets: SearchTargets,
        response_addr: SocketAddr,
        directory: ChannelDirectory,
    ) -> Self {
        if targets.is_empty() {
            tracing::warn!("no search targets configured, channels cannot be found");
        }
        let (shutdown, _) = broadcast::channel(1);
        Self {
            pending: Mutex::new(Pending {
                entries: BTreeMap::new(),
                frame: SearchFrame::new(config.max_datagram, ByteOrder::Big, response_addr),
                last_cycle: None,
            }),
            directory,
            sink,
            targets,
            sequence: AtomicU32::new(0),
            canceled: AtomicBool::new(false),
            period: config.period(),
            jitter: Duration::from_millis(config.jitter_ms),
            min_cycle_gap: config.min_cycle_gap(),
            shutdown,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn pending_count(&self) -> usize {
        self.pending().entries.len()
    }

    pub fn is_pending(&self, channel_id: u32) -> bool {
        self.pending().entries.contains_key(&channel_id)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Start searching for `instance`. A penalized search starts at the
    /// slow end of the back-off. The first entry into an empty set is sent
    /// right away.
    pub fn register_search_instance(&self, instance: Arc<dyn SearchInstance>, penalize: bool) {
        self.register_at(instance, penalize, Instant::now());
    }

    pub(crate) fn register_at(&self, instance: Arc<dyn SearchInstance>, penalize: bool, now: Instant) {
        if self.is_canceled() {
            return;
        }
        let channel_id = instance.search_instance_id();
        self.directory.insert(channel_id, Arc::downgrade(&instance));

        let was_empty = {
            let mut pending = self.pending();
            let was_empty = pending.entries.is_empty();
            let counter = if penalize { FALLBACK_VALUE } else { BOOST_VALUE };
            pending.entries.insert(channel_id, SearchEntry { instance, counter });
            was_empty
        };
        tracing::debug!(cid = channel_id, penalize, "search registered");

        if was_empty {
            self.cycle_at(now);
        }
    }

    /// Stop searching for a channel. No-op if it is not pending.
    pub fn unregister_search_instance(&self, channel_id: u32) {
        if self.pending().entries.remove(&channel_id).is_some() {
            tracing::debug!(cid = channel_id, "search unregistered");
        }
    }

    /// A server answered for `channel_id`. Completes the pending search, or
    /// forwards to the channel if it is no longer pending (duplicate answer).
    pub fn search_response(
        &self,
        guid: ServerGuid,
        channel_id: u32,
        sequence_id: u32,
        minor_revision: u8,
        server_addr: SocketAddr,
    ) {
        let removed = self.pending().entries.remove(&channel_id);
        let instance = match removed {
            Some(entry) => {
                tracing::debug!(cid = channel_id, seq = sequence_id, %server_addr, %guid, "channel found");
                Some(entry.instance)
            }
            None => self.directory.get(channel_id),
        };
        match instance {
            Some(instance) => instance.search_response(guid, minor_revision, server_addr),
            None => tracing::trace!(cid = channel_id, %server_addr, "response for unknown channel"),
        }
    }

    /// A server appeared or restarted: search for everything again now.
    pub fn new_server_detected(&self) {
        self.new_server_detected_at(Instant::now());
    }

    pub(crate) fn new_server_detected_at(&self, now: Instant) {
        {
            let mut pending = self.pending();
            for entry in pending.entries.values_mut() {
                entry.counter = BOOST_VALUE;
            }
        }
        tracing::debug!("new server detected, boosting searches");
        self.cycle_at(now);
    }

    /// One timer tick.
    pub fn tick_at(&self, now: Instant) {
        self.cycle_at(now);
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn cycle_at(&self, now: Instant) {
        if self.is_canceled() {
            return;
        }
        let mut guard = self.pending();
        let pending = &mut *guard;

        if let Some(last) = pending.last_cycle {
            if now.saturating_duration_since(last) < self.min_cycle_gap {
                tracing::trace!("search cycle skipped, previous one too recent");
                return;
            }
        }
        pending.last_cycle = Some(now);
        if pending.entries.is_empty() {
            return;
        }

        let frame = &mut pending.frame;
        frame.reset(self.next_sequence());
        let mut frames = 0;

        for (channel_id, entry) in pending.entries.iter_mut() {
            let due = entry.counter.is_power_of_two();
            entry.counter = if entry.counter >= MAX_COUNTER_VALUE {
                FALLBACK_VALUE
            } else {
                entry.counter + 1
            };
            if !due {
                continue;
            }

            let name = entry.instance.search_channel_name();
            if frame.try_add(*channel_id, &name) {
                continue;
            }
            if !frame.is_empty() {
                self.flush(frame);
                frames += 1;
                frame.reset(self.next_sequence());
                if frame.try_add(*channel_id, &name) {
                    continue;
                }
            }
            tracing::warn!(cid = *channel_id, name = %name, "channel name too long for a search frame");
        }

        if !frame.is_empty() {
            self.flush(frame);
            frames += 1;
        }
        if frames > 0 {
            tracing::debug!(frames, pending = pending.entries.len(), "search cycle");
        }
    }

    fn flush(&self, frame: &mut SearchFrame) {
        for target in &self.targets.unicast {
            self.send(frame.finish(true), *target);
        }
        for target in &self.targets.broadcast {
            self.send(frame.finish(false), *target);
        }
    }

    fn send(&self, datagram: &[u8], target: SocketAddr) {
        match self.sink.send_datagram(datagram, target) {
            Ok(_) => tracing::trace!(%target, bytes = datagram.len(), "search sent"),
            Err(e) => tracing::warn!(%target, error = %e, "search send failed"),
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter = self.jitter.as_millis() as i64;
        let offset = if jitter > 0 { rand::thread_rng().gen_range(-jitter..=jitter) } else { 0 };
        let millis = (self.period.as_millis() as i64 + offset).max(1);
        Duration::from_millis(millis as u64)
    }

    /// Drive the search timer until [`cancel`](Self::cancel).
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if self.is_canceled() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("search timer stopped");
                    return;
                }
                _ = tokio::time::sleep(self.next_delay()) => self.tick_at(Instant::now()),
            }
        }
    }

    /// Stop searching. Pending searches are dropped. Safe to call twice.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending().entries.clear();
        let _ = self.shutdown.send(());
        tracing::info!("search manager canceled");
    }
}
