//! Connector: finds or establishes the shared transport for a peer.
//!
//! Concurrent connects to the same (address, priority) are funnelled
//! through the registry's per-key reservation: the first caller opens the
//! socket and runs the handshake, the rest find its transport in the
//! registry once they get the reservation.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::TcpStream;

use pva_core::config::TransportConfig;

use crate::error::ConnectError;
use crate::registry::{TransportKey, TransportRegistry};
use crate::transport::{MessageHandler, Role, Transport, TransportOwner};

pub struct Connector {
    registry: Arc<TransportRegistry>,
    config: TransportConfig,
    handler: Arc<dyn MessageHandler>,
}

impl Connector {
    pub fn new(
        registry: Arc<TransportRegistry>,
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self { registry, config, handler }
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Return a validated transport to `addr` at `priority` with `owner`
    /// added to its owner set.
    pub async fn connect(
        &self,
        owner: &Arc<dyn TransportOwner>,
        addr: SocketAddr,
        priority: i16,
    ) -> Result<Arc<Transport>, ConnectError> {
        let key = TransportKey::new(addr, priority);

        if let Some(transport) = self.cached(&key, owner) {
            return Ok(transport);
        }

        let _reservation = self.registry.reserve(key, self.config.reservation_timeout()).await?;

        // Someone else may have finished while we waited.
        if let Some(transport) = self.cached(&key, owner) {
            return Ok(transport);
        }

        let stream = self.try_connect(addr).await?;
        let transport = Transport::start(
            stream,
            addr,
            priority,
            Role::Client,
            &self.config,
            self.handler.clone(),
            Arc::downgrade(&self.registry),
        );

        let established = async {
            transport.wait_validated(self.config.validation_timeout()).await?;
            if !transport.acquire(owner) {
                return Err(ConnectError::Closed(addr));
            }
            self.registry.install(transport.clone())
        };

        match established.await {
            Ok(()) => {
                tracing::info!(%key, "connected");
                Ok(transport)
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "connection establishment failed");
                transport.close();
                Err(e)
            }
        }
    }

    fn cached(&self, key: &TransportKey, owner: &Arc<dyn TransportOwner>) -> Option<Arc<Transport>> {
        let transport = self.registry.get(key)?;
        if transport.acquire(owner) {
            tracing::trace!(%key, "reusing transport");
            Some(transport)
        } else {
            None
        }
    }

    /// Open the TCP socket, retrying up to the configured attempt count.
    async fn try_connect(&self, addr: SocketAddr) -> Result<TcpStream, ConnectError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await;
            let error = match result {
                Ok(Ok(stream)) => {
                    configure_stream(&stream);
                    tracing::debug!(%addr, attempt, "tcp connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            };
            tracing::debug!(%addr, attempt, error = %error, "connect attempt failed");
            last_error = Some(error);
        }

        Err(ConnectError::ConnectFailed {
            addr,
            attempts,
            source: last_error
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempt made")),
        })
    }
}

/// No-delay and keep-alive on a fresh connection. Failures only cost
/// latency, so they are logged and ignored.
pub(crate) fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(error = %e, "TCP_NODELAY");
    }
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        tracing::warn!(error = %e, "SO_KEEPALIVE");
    }
}
