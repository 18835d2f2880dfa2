//! Acceptor: server side of the TCP transport.
//!
//! Every accepted stream becomes a server-role transport. It sends the
//! validation request, learns the client's priority from the reply and is
//! installed in the registry once validated.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use pva_core::config::TransportConfig;

use crate::connector::configure_stream;
use crate::registry::TransportRegistry;
use crate::transport::{MessageHandler, Role, Transport};

pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<TransportRegistry>,
    config: TransportConfig,
    handler: Arc<dyn MessageHandler>,
}

impl Acceptor {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<TransportRegistry>,
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind acceptor on {addr}"))?;
        Ok(Self { listener, registry, config, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("acceptor local_addr")
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "acceptor listening");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("acceptor shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    configure_stream(&stream);
                    tracing::debug!(%peer, "accepted connection");

                    let transport = Transport::start(
                        stream,
                        peer,
                        0,
                        Role::Server,
                        &self.config,
                        self.handler.clone(),
                        Arc::downgrade(&self.registry),
                    );
                    tokio::spawn(install_when_validated(
                        transport,
                        self.registry.clone(),
                        self.config.clone(),
                    ));
                }
            }
        }
    }
}

async fn install_when_validated(
    transport: Arc<Transport>,
    registry: Arc<TransportRegistry>,
    config: TransportConfig,
) {
    let result = match transport.wait_validated(config.validation_timeout()).await {
        Ok(()) => registry.install(transport.clone()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(peer = %transport.peer(), error = %e, "client did not validate");
        transport.close();
    }
}
