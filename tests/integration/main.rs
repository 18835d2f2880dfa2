//! PV Access session-layer integration tests.
//!
//! Everything runs over loopback: a real [`Acceptor`] or a hand-driven fake
//! peer on 127.0.0.1, so no network setup is needed.
//!
//!   cargo test --test integration
//!
//! Each test binds its own ephemeral ports and owns the tasks it spawns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use pva_core::config::TransportConfig;
use pva_core::message::{ConnectionValidation, ValidationStatus};
use pva_core::wire::{command, MessageHeader, HEADER_SIZE};
use pva_core::ByteOrder;
use pva_transport::{
    Acceptor, IgnoreMessages, OwnerId, Transport, TransportOwner, TransportRegistry,
};

mod connect;
mod liveness;
mod protocol;
mod search;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Short timeouts so failures show up quickly.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 1_000,
        connect_attempts: 1,
        validation_timeout_ms: 2_000,
        reservation_timeout_ms: 5_000,
        ..TransportConfig::default()
    }
}

/// Counts the callbacks it receives.
pub struct RecordingOwner {
    pub id: OwnerId,
    pub unresponsive: AtomicUsize,
    pub responsive: AtomicUsize,
    pub closed: AtomicUsize,
}

impl RecordingOwner {
    pub fn new(id: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            unresponsive: AtomicUsize::new(0),
            responsive: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl TransportOwner for RecordingOwner {
    fn owner_id(&self) -> OwnerId {
        self.id
    }

    fn transport_unresponsive(&self, _transport: &Transport) {
        self.unresponsive.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_responsive(&self, _transport: &Transport) {
        self.responsive.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_closed(&self, _transport: &Transport) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A running acceptor on an ephemeral loopback port. Dropping the returned
/// sender stops it.
pub async fn start_acceptor(
    config: TransportConfig,
) -> Result<(SocketAddr, Arc<TransportRegistry>, broadcast::Sender<()>)> {
    let registry = TransportRegistry::new();
    let acceptor = Acceptor::bind(
        "127.0.0.1:0".parse()?,
        registry.clone(),
        config,
        Arc::new(IgnoreMessages),
    )
    .await?;
    let addr = acceptor.local_addr()?;
    let (shutdown, _) = broadcast::channel(1);
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = acceptor.run(rx).await;
    });
    Ok((addr, registry, shutdown))
}

/// Poll `condition` every 10 ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ── Fake peer ─────────────────────────────────────────────────────────────────

/// Read one whole message from a raw stream.
pub async fn read_frame(stream: &mut TcpStream) -> Result<(MessageHeader, Bytes)> {
    let mut head = [0u8; HEADER_SIZE];
    stream.read_exact(&mut head).await.context("read header")?;
    let header = MessageHeader::parse(&head)?;
    if header.is_control() {
        return Ok((header, Bytes::new()));
    }
    let mut payload = vec![0u8; header.payload_size() as usize];
    stream.read_exact(&mut payload).await.context("read payload")?;
    Ok((header, Bytes::from(payload)))
}

/// Play the server half of the handshake and answer with `verdict`.
/// Returns what the client sent.
pub async fn serve_handshake(
    stream: &mut TcpStream,
    verdict: ValidationStatus,
) -> Result<ConnectionValidation> {
    let mut buf = BytesMut::new();
    ConnectionValidation {
        receive_buffer_size: 16_384,
        socket_receive_buffer_size: 16_384,
        priority: None,
        auth_methods: vec!["ca".into(), "anonymous".into()],
    }
    .encode(&mut buf, ByteOrder::Big, true)?;
    stream.write_all(&buf).await?;

    let (header, mut payload) = read_frame(stream).await?;
    if header.command != command::CONNECTION_VALIDATION {
        bail!("expected validation reply, got command {}", header.command);
    }
    let reply = ConnectionValidation::decode_from_client(&mut payload, header.byte_order())?;

    buf.clear();
    verdict.encode(&mut buf, ByteOrder::Big)?;
    stream.write_all(&buf).await?;
    Ok(reply)
}

/// Accept one connection on a fresh loopback listener and hand it to `serve`.
pub async fn fake_server<F, Fut>(serve: F) -> Result<SocketAddr>
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let result = async {
            let (stream, _) = listener.accept().await?;
            serve(stream).await
        }
        .await;
        if let Err(e) = result {
            eprintln!("fake server: {e:#}");
        }
    });
    Ok(addr)
}
