//! Transport: one TCP connection to a peer and its session state.
//!
//! Each transport runs three tasks:
//!   reader     reads messages, reassembles segments, runs the validation
//!              handshake and hands application messages to the handler
//!   writer     drains the send queue; the only task touching the write half
//!   heartbeat  ticks at half the heartbeat interval, probes idle peers and
//!              flags silent ones as unresponsive
//!
//! Several logical consumers ("owners") share one transport. Owners are held
//! weakly and keyed by id, and are notified when the peer goes quiet, comes
//! back, or the connection closes. A transport closes itself once its last
//! owner releases it.

mod framing;
mod heartbeat;

pub use framing::Reassembler;
pub use heartbeat::{HeartbeatCheck, Liveness};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

use pva_core::config::TransportConfig;
use pva_core::field::FieldDesc;
use pva_core::message::{ConnectionValidation, ValidationStatus};
use pva_core::wire::{command, control, finish_message, start_message, MessageHeader, FLAG_SERVER};
use pva_core::{ByteOrder, IdSpace, IntrospectionRegistry, WireError};

use crate::error::{ConnectError, TransportError};
use crate::registry::{TransportKey, TransportRegistry};

/// Writes are batched until the buffer reaches this size.
const WRITE_BATCH: usize = 64 * 1024;

/// Authentication method offered and picked when nothing else is configured.
pub const AUTH_ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We opened the connection.
    Client,
    /// We accepted it.
    Server,
}

impl Role {
    fn id_space(self) -> IdSpace {
        match self {
            Role::Client => IdSpace::Client,
            Role::Server => IdSpace::Server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Validating,
    Active,
    Unresponsive,
    Closed,
}

impl TransportState {
    /// Validated and not yet closed.
    pub fn is_usable(self) -> bool {
        matches!(self, TransportState::Active | TransportState::Unresponsive)
    }
}

pub type OwnerId = u64;

/// A consumer sharing a transport.
///
/// Callbacks run on the transport's tasks. A panicking callback is caught
/// and logged; it does not affect other owners or the transport.
pub trait TransportOwner: Send + Sync {
    fn owner_id(&self) -> OwnerId;

    fn transport_unresponsive(&self, _transport: &Transport) {}

    fn transport_responsive(&self, _transport: &Transport) {}

    fn transport_closed(&self, _transport: &Transport) {}
}

/// Something that wants to put a message on the wire.
///
/// `send` runs on the writer task with the transport's introspection
/// registry locked, so the messages of different senders never interleave.
/// Implementations write complete messages, header included.
pub trait TransportSender: Send + Sync {
    fn send(
        &self,
        buf: &mut BytesMut,
        order: ByteOrder,
        introspection: &mut IntrospectionRegistry<FieldDesc>,
    ) -> Result<(), WireError>;
}

/// Receives application messages once the transport is validated.
///
/// Returning an error that is a [`WireError`] closes the transport as a
/// protocol violation. Any other error is logged and the connection stays up.
pub trait MessageHandler: Send + Sync {
    fn handle_message(
        &self,
        transport: &Arc<Transport>,
        header: &MessageHeader,
        payload: Bytes,
    ) -> anyhow::Result<()>;
}

/// Logs and drops every application message.
pub struct IgnoreMessages;

impl MessageHandler for IgnoreMessages {
    fn handle_message(
        &self,
        transport: &Arc<Transport>,
        header: &MessageHeader,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        tracing::trace!(
            peer = %transport.peer(),
            command = header.command,
            bytes = payload.len(),
            "ignoring application message"
        );
        Ok(())
    }
}

enum Outgoing {
    /// Pre-encoded protocol message (validation, echo).
    Frame(Bytes),
    Sender(Arc<dyn TransportSender>),
}

#[derive(Clone, Copy)]
enum OwnerEvent {
    Unresponsive,
    Responsive,
    Closed,
}

pub struct Transport {
    peer: SocketAddr,
    /// Fixed for clients; learned from the validation reply on servers.
    priority: AtomicI16,
    role: Role,
    order: ByteOrder,
    config: TransportConfig,
    state: watch::Sender<TransportState>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    owners: Mutex<HashMap<OwnerId, Weak<dyn TransportOwner>>>,
    queue: mpsc::UnboundedSender<Outgoing>,
    introspection: Mutex<IntrospectionRegistry<FieldDesc>>,
    liveness: Mutex<Liveness>,
    peer_receive_buffer_size: AtomicU32,
    registry: Weak<TransportRegistry>,
    handler: Arc<dyn MessageHandler>,
    shutdown: broadcast::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport {
    /// Wrap a connected stream and start its tasks.
    ///
    /// A server-role transport sends its validation request straight away;
    /// a client-role one waits for the server's. Either way the transport is
    /// not usable until [`wait_validated`](Self::wait_validated) succeeds.
    pub fn start(
        stream: TcpStream,
        peer: SocketAddr,
        priority: i16,
        role: Role,
        config: &TransportConfig,
        handler: Arc<dyn MessageHandler>,
        registry: Weak<TransportRegistry>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let (state, _) = watch::channel(TransportState::Connecting);
        let now = Instant::now();

        let transport = Arc::new(Self {
            peer,
            priority: AtomicI16::new(priority),
            role,
            order: ByteOrder::Big,
            config: config.clone(),
            state,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            owners: Mutex::new(HashMap::new()),
            queue,
            introspection: Mutex::new(IntrospectionRegistry::new(role.id_space())),
            liveness: Mutex::new(Liveness::new(config.heartbeat_interval(), now)),
            peer_receive_buffer_size: AtomicU32::new(0),
            registry,
            handler,
            shutdown,
        });

        tokio::spawn(writer_loop(transport.clone(), write_half, queue_rx, transport.shutdown.subscribe()));
        tokio::spawn(reader_loop(transport.clone(), read_half, transport.shutdown.subscribe()));
        tokio::spawn(heartbeat_loop(transport.clone(), transport.shutdown.subscribe()));

        transport.set_state(TransportState::Validating);
        if role == Role::Server {
            let request = ConnectionValidation {
                receive_buffer_size: config.receive_buffer_size,
                socket_receive_buffer_size: config.receive_buffer_size,
                priority: None,
                auth_methods: vec![AUTH_ANONYMOUS.to_string()],
            };
            transport.push_message(|buf, order| request.encode(buf, order, true));
        }
        tracing::debug!(%peer, ?role, priority, "transport started");
        transport
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn priority(&self) -> i16 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn key(&self) -> TransportKey {
        TransportKey::new(self.peer, self.priority())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receive buffer size the peer announced during validation.
    pub fn peer_receive_buffer_size(&self) -> u32 {
        self.peer_receive_buffer_size.load(Ordering::Relaxed)
    }

    pub fn owner_count(&self) -> usize {
        lock(&self.owners).len()
    }

    /// Run `f` with the introspection registry locked, e.g. to decode a type
    /// description from a received payload.
    pub fn with_introspection<R>(
        &self,
        f: impl FnOnce(&mut IntrospectionRegistry<FieldDesc>) -> R,
    ) -> R {
        f(&mut lock(&self.introspection))
    }

    /// Returns whether the state changed.
    fn set_state(&self, state: TransportState) -> bool {
        self.state.send_if_modified(|current| {
            // Closed is terminal.
            if *current == state || *current == TransportState::Closed {
                return false;
            }
            *current = state;
            true
        })
    }

    /// Wait until the handshake completes.
    pub async fn wait_validated(&self, timeout: Duration) -> Result<(), ConnectError> {
        let mut states = self.state.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            states.wait_for(|s| s.is_usable() || *s == TransportState::Closed),
        )
        .await;

        match outcome {
            Err(_) => Err(ConnectError::ValidationTimeout(self.peer)),
            Ok(Err(_)) => Err(ConnectError::Closed(self.peer)),
            Ok(Ok(state)) if state.is_usable() => Ok(()),
            Ok(Ok(_)) => match lock(&self.close_reason).clone() {
                Some(message) => Err(ConnectError::ValidationRefused { addr: self.peer, message }),
                None => Err(ConnectError::Closed(self.peer)),
            },
        }
    }

    // ── Owners ───────────────────────────────────────────────────────────────

    /// Add `owner` to the owner set. Fails once the transport is closed.
    pub fn acquire(&self, owner: &Arc<dyn TransportOwner>) -> bool {
        let mut owners = lock(&self.owners);
        if self.is_closed() {
            return false;
        }
        owners.insert(owner.owner_id(), Arc::downgrade(owner));
        true
    }

    /// Remove an owner. The transport closes when the last one leaves.
    pub fn release(&self, id: OwnerId) {
        let now_unowned = {
            let mut owners = lock(&self.owners);
            let before = owners.len();
            owners.remove(&id);
            prune_dropped(&mut owners, before)
        };
        if now_unowned {
            tracing::debug!(peer = %self.peer, "last owner released transport");
            self.close();
        }
    }

    /// Forget owners that were dropped without releasing. Returns true if
    /// that left no owner at all.
    fn prune_owners(&self) -> bool {
        let mut owners = lock(&self.owners);
        let before = owners.len();
        prune_dropped(&mut owners, before)
    }

    fn notify_owners(&self, owners: Vec<Arc<dyn TransportOwner>>, event: OwnerEvent) {
        for owner in owners {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                OwnerEvent::Unresponsive => owner.transport_unresponsive(self),
                OwnerEvent::Responsive => owner.transport_responsive(self),
                OwnerEvent::Closed => owner.transport_closed(self),
            }));
            if result.is_err() {
                tracing::warn!(peer = %self.peer, owner = owner.owner_id(), "owner callback panicked");
            }
        }
    }

    fn live_owners(&self) -> Vec<Arc<dyn TransportOwner>> {
        lock(&self.owners).values().filter_map(Weak::upgrade).collect()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Queue a sender. Senders run in FIFO order on the writer task.
    pub fn enqueue_send_request(&self, sender: Arc<dyn TransportSender>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.peer));
        }
        if !self.state().is_usable() {
            return Err(TransportError::NotValidated(self.peer));
        }
        self.queue
            .send(Outgoing::Sender(sender))
            .map_err(|_| TransportError::Closed(self.peer))
    }

    /// Encode a protocol message and queue it ahead of validation checks.
    fn push_message(&self, encode: impl FnOnce(&mut BytesMut, ByteOrder) -> Result<(), WireError>) {
        let mut buf = BytesMut::new();
        if let Err(e) = encode(&mut buf, self.order) {
            tracing::warn!(peer = %self.peer, error = %e, "failed to encode protocol message");
            return;
        }
        if self.queue.send(Outgoing::Frame(buf.freeze())).is_err() {
            tracing::trace!(peer = %self.peer, "writer gone, message dropped");
        }
    }

    fn send_echo(&self, payload: &[u8]) {
        let flags = match self.role {
            Role::Client => 0,
            Role::Server => FLAG_SERVER,
        };
        self.push_message(|buf, order| {
            let start = start_message(buf, command::ECHO, flags, order);
            buf.extend_from_slice(payload);
            finish_message(buf, start)
        });
    }

    fn write_outgoing(&self, outgoing: Outgoing, buf: &mut BytesMut) {
        match outgoing {
            Outgoing::Frame(frame) => buf.extend_from_slice(&frame),
            Outgoing::Sender(sender) => {
                let mark = buf.len();
                let mut introspection = lock(&self.introspection);
                if let Err(e) = sender.send(buf, self.order, &mut introspection) {
                    buf.truncate(mark);
                    tracing::warn!(peer = %self.peer, error = %e, "sender failed to serialize, message dropped");
                }
            }
        }
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    // The liveness flag and the Active/Unresponsive state only change
    // together, under the liveness lock.

    fn inbound_traffic(&self, now: Instant) {
        let recovered = {
            let mut liveness = lock(&self.liveness);
            liveness.on_inbound(now) && self.set_state(TransportState::Active)
        };
        if recovered {
            tracing::info!(peer = %self.peer, "transport responsive again");
            self.notify_owners(self.live_owners(), OwnerEvent::Responsive);
        }
    }

    fn outbound_traffic(&self, now: Instant) {
        lock(&self.liveness).on_outbound(now);
    }

    /// One heartbeat tick. Does nothing before validation or after close.
    pub fn heartbeat_at(&self, now: Instant) {
        if !self.state().is_usable() {
            return;
        }
        if self.prune_owners() {
            tracing::debug!(peer = %self.peer, "all owners dropped, closing transport");
            self.close();
            return;
        }
        let (check, went_quiet) = {
            let mut liveness = lock(&self.liveness);
            let check = liveness.check_at(now);
            let went_quiet =
                check.became_unresponsive && self.set_state(TransportState::Unresponsive);
            (check, went_quiet)
        };

        if went_quiet {
            tracing::warn!(peer = %self.peer, "no traffic from peer, transport unresponsive");
            self.notify_owners(self.live_owners(), OwnerEvent::Unresponsive);
        }
        // Servers answer probes but never send them.
        if check.probe && self.role == Role::Client {
            tracing::trace!(peer = %self.peer, "sending echo probe");
            self.send_echo(&[]);
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    fn dispatch(self: &Arc<Self>, header: MessageHeader, payload: Bytes) -> Result<(), TransportError> {
        if header.is_control() {
            match header.command {
                control::SET_ENDIANESS => {
                    tracing::trace!(peer = %self.peer, order = ?header.byte_order(), "peer byte order");
                }
                code => tracing::trace!(peer = %self.peer, code, "control message ignored"),
            }
            return Ok(());
        }

        match header.command {
            command::ECHO => {
                if self.role == Role::Server && !header.is_from_server() {
                    self.send_echo(&payload);
                }
                Ok(())
            }
            command::CONNECTION_VALIDATION => self.on_validation(&header, payload),
            command::CONNECTION_VALIDATED => self.on_validated(&header, payload),
            _ if !self.state().is_usable() => {
                Err(WireError::UnexpectedCommand(header.command).into())
            }
            _ => match self.handler.handle_message(self, &header, payload) {
                Ok(()) => Ok(()),
                Err(e) => match e.downcast_ref::<WireError>() {
                    Some(wire) => Err(wire.clone().into()),
                    None => {
                        tracing::warn!(peer = %self.peer, command = header.command, error = %e, "message handler failed");
                        Ok(())
                    }
                },
            },
        }
    }

    fn on_validation(&self, header: &MessageHeader, mut payload: Bytes) -> Result<(), TransportError> {
        let order = header.byte_order();
        match self.role {
            Role::Client => {
                if !header.is_from_server() {
                    return Err(WireError::UnexpectedCommand(header.command).into());
                }
                let request = ConnectionValidation::decode_from_server(&mut payload, order)?;
                self.peer_receive_buffer_size.store(request.receive_buffer_size, Ordering::Relaxed);

                let method = if request.auth_methods.iter().any(|m| m == AUTH_ANONYMOUS) {
                    AUTH_ANONYMOUS.to_string()
                } else {
                    request.auth_methods.first().cloned().unwrap_or_default()
                };
                let reply = ConnectionValidation {
                    receive_buffer_size: self.config.receive_buffer_size,
                    socket_receive_buffer_size: self.config.receive_buffer_size,
                    priority: Some(self.priority()),
                    auth_methods: vec![method],
                };
                self.push_message(|buf, order| reply.encode(buf, order, false));
                Ok(())
            }
            Role::Server => {
                let reply = ConnectionValidation::decode_from_client(&mut payload, order)?;
                self.peer_receive_buffer_size.store(reply.receive_buffer_size, Ordering::Relaxed);
                self.priority.store(reply.priority.unwrap_or_default(), Ordering::Release);
                self.push_message(|buf, order| ValidationStatus::Ok.encode(buf, order));
                self.validated();
                Ok(())
            }
        }
    }

    fn on_validated(&self, header: &MessageHeader, mut payload: Bytes) -> Result<(), TransportError> {
        if self.role != Role::Client {
            return Err(WireError::UnexpectedCommand(header.command).into());
        }
        match ValidationStatus::decode(&mut payload, header.byte_order())? {
            ValidationStatus::Ok => self.validated(),
            ValidationStatus::Failed { kind, message } => {
                tracing::warn!(peer = %self.peer, kind, %message, "validation refused");
                *lock(&self.close_reason) = Some(message);
                self.close();
            }
        }
        Ok(())
    }

    fn validated(&self) {
        // Ids from any earlier session with this peer mean nothing now.
        lock(&self.introspection).reset();
        {
            let mut liveness = lock(&self.liveness);
            liveness.on_inbound(Instant::now());
            self.set_state(TransportState::Active);
        }
        tracing::info!(peer = %self.peer, priority = self.priority(), role = ?self.role, "transport validated");
    }

    // ── Close ────────────────────────────────────────────────────────────────

    /// Close the connection. Owners are notified exactly once; later calls
    /// do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(TransportState::Closed);
        let _ = self.shutdown.send(());

        let owners: Vec<_> = lock(&self.owners).drain().filter_map(|(_, w)| w.upgrade()).collect();
        self.notify_owners(owners, OwnerEvent::Closed);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        tracing::info!(peer = %self.peer, priority = self.priority(), "transport closed");
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("priority", &self.priority())
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

fn prune_dropped(owners: &mut HashMap<OwnerId, Weak<dyn TransportOwner>>, before: usize) -> bool {
    owners.retain(|_, owner| owner.strong_count() > 0);
    before > 0 && owners.is_empty()
}

// ── Tasks ────────────────────────────────────────────────────────────────────

async fn reader_loop(
    transport: Arc<Transport>,
    read_half: OwnedReadHalf,
    mut shutdown: broadcast::Receiver<()>,
) {
    let result = tokio::select! {
        _ = shutdown.recv() => Ok(()),
        r = read_messages(&transport, read_half) => r,
    };
    match result {
        Ok(()) => tracing::debug!(peer = %transport.peer, "reader finished"),
        Err(TransportError::Protocol(e)) => {
            tracing::warn!(peer = %transport.peer, error = %e, "protocol violation, closing transport");
        }
        Err(e) => tracing::debug!(peer = %transport.peer, error = %e, "read failed"),
    }
    transport.close();
}

async fn read_messages(transport: &Arc<Transport>, read_half: OwnedReadHalf) -> Result<(), TransportError> {
    let mut reader = BufReader::new(read_half);
    let mut reassembler = Reassembler::new(transport.config.max_payload);

    while let Some((header, payload)) =
        framing::read_message(&mut reader, transport.config.max_payload).await?
    {
        transport.inbound_traffic(Instant::now());
        if header.is_control() {
            transport.dispatch(header, payload)?;
            continue;
        }
        if let Some((header, payload)) = reassembler.push(header, payload)? {
            transport.dispatch(header, payload)?;
        }
    }
    Ok(())
}

async fn writer_loop(
    transport: Arc<Transport>,
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = BytesMut::with_capacity(transport.config.receive_buffer_size as usize);
    loop {
        let first = tokio::select! {
            _ = shutdown.recv() => break,
            next = queue.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        buf.clear();
        transport.write_outgoing(first, &mut buf);
        while buf.len() < WRITE_BATCH {
            match queue.try_recv() {
                Ok(outgoing) => transport.write_outgoing(outgoing, &mut buf),
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            continue;
        }

        if let Err(e) = write_half.write_all(&buf).await {
            tracing::debug!(peer = %transport.peer, error = %e, "write failed");
            transport.close();
            break;
        }
        tracing::trace!(peer = %transport.peer, bytes = buf.len(), "sent");
        transport.outbound_traffic(Instant::now());
    }
    let _ = write_half.shutdown().await;
}

async fn heartbeat_loop(transport: Arc<Transport>, mut shutdown: broadcast::Receiver<()>) {
    let period = transport.config.heartbeat_interval() / 2;
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => transport.heartbeat_at(Instant::now()),
        }
    }
}
