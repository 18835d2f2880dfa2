//! Client context: owns everything a client process needs to find and
//! connect to channels. Constructed explicitly by the process entry point
//! and torn down with [`ClientContext::shutdown`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use pva_core::{PvaConfig, ServerGuid};

use crate::beacon::BeaconTracker;
use crate::connector::Connector;
use crate::error::ConnectError;
use crate::registry::TransportRegistry;
use crate::search::listener::{listener_loop, make_beacon_socket, make_search_socket};
use crate::search::{ChannelDirectory, SearchInstance, SearchManager, SearchTargets};
use crate::transport::{MessageHandler, Transport, TransportOwner};

/// Where a channel lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub guid: ServerGuid,
    pub server_addr: SocketAddr,
    pub minor_revision: u8,
}

/// One-shot search used by [`ClientContext::locate`].
struct LocateRequest {
    cid: u32,
    name: String,
    reply: Mutex<Option<oneshot::Sender<Located>>>,
}

impl SearchInstance for LocateRequest {
    fn search_instance_id(&self) -> u32 {
        self.cid
    }

    fn search_channel_name(&self) -> String {
        self.name.clone()
    }

    fn search_response(&self, guid: ServerGuid, minor_revision: u8, server_addr: SocketAddr) {
        let reply = self.reply.lock().unwrap_or_else(PoisonError::into_inner).take();
        match reply {
            Some(tx) => {
                let _ = tx.send(Located { guid, server_addr, minor_revision });
            }
            None => tracing::debug!(cid = self.cid, %server_addr, "duplicate search response ignored"),
        }
    }
}

/// Unregisters a search if `locate` is abandoned before an answer.
struct SearchGuard<'a> {
    search: &'a SearchManager,
    directory: &'a ChannelDirectory,
    cid: u32,
}

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.search.unregister_search_instance(self.cid);
        self.directory.remove(self.cid);
    }
}

pub struct ClientContext {
    config: PvaConfig,
    registry: Arc<TransportRegistry>,
    connector: Connector,
    search: Arc<SearchManager>,
    beacons: Arc<BeaconTracker>,
    next_cid: AtomicU32,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientContext {
    /// Bind the UDP sockets and start the search timer and listeners.
    /// Must be called from within a tokio runtime.
    pub async fn start(config: PvaConfig, handler: Arc<dyn MessageHandler>) -> Result<Arc<Self>> {
        let (addrs, rejected) = config.search.search_addresses();
        for entry in rejected {
            tracing::warn!(entry = %entry, "ignoring unparseable search address");
        }
        let targets = SearchTargets::classify(addrs);
        tracing::info!(
            unicast = targets.unicast.len(),
            broadcast = targets.broadcast.len(),
            "search targets"
        );

        let (search_socket, search_sender) = make_search_socket().context("search socket")?;
        let search_socket = Arc::new(search_socket);
        let response_addr = search_socket.local_addr().context("search socket local_addr")?;

        let directory = ChannelDirectory::default();
        let search = Arc::new(SearchManager::new(
            &config.search,
            Arc::new(search_sender),
            targets,
            response_addr,
            directory,
        ));
        let beacons = Arc::new(BeaconTracker::new(search.clone()));

        let registry = TransportRegistry::new();
        let connector = Connector::new(registry.clone(), config.transport.clone(), handler);
        let (shutdown, _) = broadcast::channel(1);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(search.clone().run()));
        tasks.push(tokio::spawn(
            beacons.clone().expiry_loop(config.search.beacon_ttl(), shutdown.subscribe()),
        ));
        tasks.push(spawn_listener(search_socket, &search, &beacons, &shutdown));

        // Beacons are an optimisation; run without them if the port is taken.
        match make_beacon_socket(config.search.broadcast_port) {
            Ok(socket) => tasks.push(spawn_listener(Arc::new(socket), &search, &beacons, &shutdown)),
            Err(e) => tracing::warn!(error = %e, "beacon listener disabled"),
        }

        tracing::info!(%response_addr, "client context started");
        Ok(Arc::new(Self {
            config,
            registry,
            connector,
            search,
            beacons,
            next_cid: AtomicU32::new(1),
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &PvaConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.search
    }

    pub fn beacons(&self) -> &Arc<BeaconTracker> {
        &self.beacons
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Search for `name` until a server answers. There is no timeout; an
    /// absent channel may appear at any time, so wrap the call in one if
    /// needed. Dropping the future stops the search.
    pub async fn locate(&self, name: &str) -> Result<Located, ConnectError> {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let request: Arc<dyn SearchInstance> = Arc::new(LocateRequest {
            cid,
            name: name.to_string(),
            reply: Mutex::new(Some(tx)),
        });

        let _guard = SearchGuard { search: &self.search, directory: self.search.directory(), cid };
        // The manager holds the only strong reference, so canceling the
        // search drops the reply sender and ends the wait.
        self.search.register_search_instance(request, false);
        tracing::debug!(cid, name, "locating channel");

        rx.await.map_err(|_| ConnectError::SearchCanceled(name.to_string()))
    }

    /// Locate `name`, then connect to its server at `priority` on behalf of
    /// `owner`.
    pub async fn connect_channel(
        &self,
        name: &str,
        priority: i16,
        owner: &Arc<dyn TransportOwner>,
    ) -> Result<(Located, Arc<Transport>), ConnectError> {
        let located = self.locate(name).await?;
        let transport = self.connector.connect(owner, located.server_addr, priority).await?;
        Ok((located, transport))
    }

    /// Stop searching, close every transport and stop the background tasks.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.search.cancel();
        let _ = self.shutdown.send(());
        for transport in self.registry.transports() {
            transport.close();
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        if !tasks.is_empty() {
            tracing::info!("client context shut down");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_listener(
    socket: Arc<tokio::net::UdpSocket>,
    search: &Arc<SearchManager>,
    beacons: &Arc<BeaconTracker>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let search = search.clone();
    let beacons = beacons.clone();
    let shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        if let Err(e) = listener_loop(socket, search, beacons, shutdown).await {
            tracing::error!(error = %e, "udp listener failed");
        }
    })
}
