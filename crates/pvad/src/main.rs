//! pvad: PV Access session daemon.
//!
//! Locates the channels named on the command line and holds a transport to
//! each of their servers. With `--serve` it also accepts connections on the
//! configured server port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use pva_core::PvaConfig;
use pva_transport::{
    Acceptor, ClientContext, IgnoreMessages, MessageHandler, OwnerId, Transport, TransportOwner,
    TransportRegistry, TransportState,
};

struct Args {
    serve: bool,
    priority: i16,
    channels: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args { serve: false, priority: 0, channels: Vec::new() };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--serve" => args.serve = true,
            "--priority" => {
                let value = iter.next().context("--priority needs a value")?;
                args.priority = value
                    .parse()
                    .with_context(|| format!("invalid priority {value:?}"))?;
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ => args.channels.push(arg),
        }
    }
    Ok(args)
}

/// Logs what happens to the transport a channel is using.
struct ChannelOwner {
    id: OwnerId,
    channel: String,
}

impl TransportOwner for ChannelOwner {
    fn owner_id(&self) -> OwnerId {
        self.id
    }

    fn transport_unresponsive(&self, transport: &Transport) {
        tracing::warn!(channel = %self.channel, peer = %transport.peer(), "transport unresponsive");
    }

    fn transport_responsive(&self, transport: &Transport) {
        tracing::info!(channel = %self.channel, peer = %transport.peer(), "transport responsive again");
    }

    fn transport_closed(&self, transport: &Transport) {
        tracing::warn!(channel = %self.channel, peer = %transport.peer(), "transport closed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PvaConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PvaConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PvaConfig::default()
    });

    let args = parse_args()?;
    tracing::info!(
        serve = args.serve,
        priority = args.priority,
        channels = args.channels.len(),
        "pvad starting"
    );

    let handler: Arc<dyn MessageHandler> = Arc::new(IgnoreMessages);
    let context = ClientContext::start(config.clone(), handler.clone()).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server_registry = TransportRegistry::new();
    let acceptor_task = if args.serve {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.transport.server_port));
        let acceptor = Acceptor::bind(
            addr,
            server_registry.clone(),
            config.transport.clone(),
            handler,
        )
        .await?;
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = acceptor.run(shutdown).await {
                tracing::error!(error = %e, "acceptor failed");
            }
        }))
    } else {
        None
    };

    let next_owner = AtomicU64::new(1);
    for channel in args.channels {
        let owner: Arc<dyn TransportOwner> = Arc::new(ChannelOwner {
            id: next_owner.fetch_add(1, Ordering::Relaxed),
            channel: channel.clone(),
        });
        let context = context.clone();
        let priority = args.priority;
        tokio::spawn(async move {
            match context.connect_channel(&channel, priority, &owner).await {
                Ok((located, transport)) => {
                    tracing::info!(
                        channel = %channel,
                        server = %located.server_addr,
                        guid = %located.guid,
                        key = %transport.key(),
                        "channel connected"
                    );
                    // Keep the owner alive for as long as the transport is.
                    let mut state = transport.subscribe_state();
                    let _ = state.wait_for(|s| *s == TransportState::Closed).await;
                    drop(owner);
                }
                Err(e) => tracing::error!(channel = %channel, error = %e, "channel connect failed"),
            }
        });
    }

    let transport_printer = {
        let client = context.registry().clone();
        let server = server_registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                tracing::info!(
                    client = client.len(),
                    server = server.len(),
                    "transport table snapshot"
                );
                for t in client.transports().into_iter().chain(server.transports()) {
                    tracing::info!(
                        key = %t.key(),
                        role = ?t.role(),
                        state = ?t.state(),
                        owners = t.owner_count(),
                        "  transport"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    match acceptor_task {
        Some(acceptor_task) => tokio::select! {
            _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
            r = acceptor_task        => tracing::error!("acceptor exited: {:?}", r),
            r = transport_printer    => tracing::error!("transport printer exited: {:?}", r),
        },
        None => tokio::select! {
            _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
            r = transport_printer    => tracing::error!("transport printer exited: {:?}", r),
        },
    }

    context.shutdown();
    for transport in server_registry.transports() {
        transport.close();
    }

    Ok(())
}
