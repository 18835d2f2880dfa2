//! UDP receive loops for search responses and beacons.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use pva_core::message::{Beacon, SearchResponse};
use pva_core::wire::{command, MessageHeader, HEADER_SIZE, MAX_UDP_RECV};
use pva_core::WireError;

use crate::beacon::BeaconTracker;

use super::SearchManager;

/// Socket that sends search requests and receives their responses.
///
/// Returns the receiving side for the listener task and a clone of the same
/// socket for sending, so responses arrive at the port requests go out from.
pub fn make_search_socket() -> Result<(UdpSocket, Socket)> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    let sender = socket.try_clone().context("failed to clone search socket")?;
    let receiver =
        UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?;
    Ok((receiver, sender))
}

/// Socket bound to the broadcast port for beacons, shared with other
/// clients on the host.
pub fn make_beacon_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).with_context(|| format!("bind() port {port}"))?;
    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Handle every message in one datagram. Stops at the first malformed one.
pub fn dispatch_datagram(
    datagram: &[u8],
    source: SocketAddr,
    search: &SearchManager,
    beacons: &BeaconTracker,
) -> Result<(), WireError> {
    let mut rest = Bytes::copy_from_slice(datagram);
    while rest.remaining() >= HEADER_SIZE {
        let header = MessageHeader::parse(&rest)?;
        rest.advance(HEADER_SIZE);
        let size = header.payload_size() as usize;
        pva_core::buffer::ensure(&rest, size)?;
        let mut payload = rest.split_to(size);
        let order = header.byte_order();

        match header.command {
            command::SEARCH_RESPONSE => {
                let response = SearchResponse::decode(&mut payload, order)?;
                if !response.found {
                    continue;
                }
                let server = response.resolved_server_addr(source.ip());
                for cid in &response.channel_ids {
                    search.search_response(
                        response.guid,
                        *cid,
                        response.sequence_id,
                        header.version,
                        server,
                    );
                }
            }
            command::BEACON => {
                let beacon = Beacon::decode(&mut payload, order)?;
                beacons.beacon_received(&beacon, source);
            }
            other => tracing::trace!(%source, command = other, "ignoring datagram"),
        }
    }
    Ok(())
}

/// Receive and dispatch datagrams until shutdown.
pub async fn listener_loop(
    socket: Arc<UdpSocket>,
    search: Arc<SearchManager>,
    beacons: Arc<BeaconTracker>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_UDP_RECV];
    let local = socket.local_addr().context("local_addr")?;
    tracing::info!(%local, "udp listener starting");

    loop {
        let (len, source) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(%local, "udp listener shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
        };

        if let Err(e) = dispatch_datagram(&buf[..len], source, &search, &beacons) {
            tracing::warn!(%source, error = %e, "malformed datagram dropped");
        }
    }
}
