use std::sync::Mutex;

use bytes::Buf;
use tokio::net::UdpSocket;

use pva_core::config::SearchConfig;
use pva_core::message::{SearchRequest, SearchResponse};
use pva_core::{PvaConfig, ServerGuid};
use pva_transport::{ClientContext, ConnectError, TransportState};

use crate::*;

const GUID: ServerGuid = ServerGuid([0x5A; 12]);

/// Every search request the responder saw: (sequence id, flags, names).
type Seen = Arc<Mutex<Vec<(u32, u8, Vec<String>)>>>;

/// A UDP server that answers searches for `known` with `server_port` on
/// the unspecified address, so the client must resolve it.
async fn fake_responder(known: &'static str, server_port: u16) -> Result<(SocketAddr, Seen)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    let seen: Seen = Arc::default();
    let log = seen.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            let Ok((len, source)) = socket.recv_from(&mut buf).await else { return };
            let mut datagram = Bytes::copy_from_slice(&buf[..len]);
            while datagram.remaining() >= HEADER_SIZE {
                let Ok(header) = MessageHeader::parse(&datagram) else { break };
                datagram.advance(HEADER_SIZE);
                let size = (header.payload_size() as usize).min(datagram.remaining());
                let mut payload = datagram.split_to(size);
                if header.command != command::SEARCH {
                    continue;
                }
                let Ok(request) = SearchRequest::decode(&mut payload, header.byte_order()) else {
                    break;
                };
                log.lock().unwrap().push((
                    request.sequence_id,
                    request.flags,
                    request.channels.iter().map(|(_, n)| n.clone()).collect(),
                ));

                let found: Vec<u32> = request
                    .channels
                    .iter()
                    .filter(|(_, name)| name == known)
                    .map(|(cid, _)| *cid)
                    .collect();
                if found.is_empty() {
                    continue;
                }
                let mut out = BytesMut::new();
                let response = SearchResponse {
                    guid: GUID,
                    sequence_id: request.sequence_id,
                    server_addr: SocketAddr::from(([0, 0, 0, 0], server_port)),
                    protocol: "tcp".into(),
                    found: true,
                    channel_ids: found,
                };
                if response.encode(&mut out, ByteOrder::Big).is_ok() {
                    let _ = socket.send_to(&out, source).await;
                }
            }
        }
    });
    Ok((addr, seen))
}

fn client_config(responder: SocketAddr) -> PvaConfig {
    PvaConfig {
        search: SearchConfig {
            address_list: vec![responder.to_string()],
            auto_address_list: false,
            broadcast_port: 0,
            period_ms: 50,
            jitter_ms: 0,
            ..SearchConfig::default()
        },
        transport: test_config(),
    }
}

/// A unicast search is answered and resolved against the responder's
/// address.
#[tokio::test]
async fn test_locate_channel() {
    let (responder, seen) = fake_responder("ring:current", 5075).await.unwrap();
    let context = ClientContext::start(client_config(responder), Arc::new(IgnoreMessages))
        .await
        .unwrap();

    let located = tokio::time::timeout(Duration::from_secs(3), context.locate("ring:current"))
        .await
        .expect("search should be answered")
        .unwrap();

    assert_eq!(located.guid, GUID);
    assert_eq!(located.server_addr, "127.0.0.1:5075".parse().unwrap());
    assert!(!context.search().is_pending(1));

    let seen = seen.lock().unwrap();
    let (_, flags, names) = &seen[0];
    assert_eq!(names, &vec!["ring:current".to_string()]);
    assert_eq!(flags & pva_core::wire::SEARCH_UNICAST, pva_core::wire::SEARCH_UNICAST);
    context.shutdown();
}

/// The first registration sends at once instead of waiting for the timer.
#[tokio::test]
async fn test_first_search_is_sent_immediately() {
    let (responder, seen) = fake_responder("ring:current", 5075).await.unwrap();
    let mut config = client_config(responder);
    config.search.period_ms = 5_000;
    let context = ClientContext::start(config, Arc::new(IgnoreMessages)).await.unwrap();

    let located = tokio::time::timeout(Duration::from_secs(1), context.locate("ring:current"))
        .await
        .expect("first search should go out without waiting a period")
        .unwrap();

    assert_eq!(located.server_addr, "127.0.0.1:5075".parse().unwrap());
    assert_eq!(seen.lock().unwrap().len(), 1);
    context.shutdown();
}

/// Unanswered names stay pending until the search is abandoned; dropping
/// the locate future unregisters it.
#[tokio::test]
async fn test_abandoned_locate_unregisters() {
    let (responder, seen) = fake_responder("ring:current", 5075).await.unwrap();
    let context = ClientContext::start(client_config(responder), Arc::new(IgnoreMessages))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), context.locate("nobody:home")).await;
    assert!(result.is_err(), "nobody answers for this name");
    assert_eq!(context.search().pending_count(), 0);
    assert!(context.search().directory().is_empty());

    // Retries went out with fresh sequence numbers.
    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 2, "expected retries, saw {}", seen.len());
    assert!(seen.windows(2).all(|w| w[0].0 != w[1].0));
}

/// Shutting the context down ends an outstanding locate with an error.
#[tokio::test]
async fn test_shutdown_cancels_locate() {
    let (responder, _seen) = fake_responder("ring:current", 5075).await.unwrap();
    let context = ClientContext::start(client_config(responder), Arc::new(IgnoreMessages))
        .await
        .unwrap();

    let waiting = {
        let context = context.clone();
        tokio::spawn(async move { context.locate("nobody:home").await })
    };
    assert!(wait_until(Duration::from_secs(1), || context.search().pending_count() == 1).await);

    context.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("locate should end")
        .unwrap();
    assert!(matches!(result, Err(ConnectError::SearchCanceled(ref name)) if name == "nobody:home"));

    // Once canceled, new searches end immediately.
    let err = context.locate("late").await.unwrap_err();
    assert!(matches!(err, ConnectError::SearchCanceled(_)));
}

/// Search, connect and share: two channels on the same server end up on one
/// transport.
#[tokio::test]
async fn test_connect_channel_end_to_end() {
    let (server_addr, server, _stop) = start_acceptor(test_config()).await.unwrap();
    let (responder, _seen) = fake_responder("ring:current", server_addr.port()).await.unwrap();
    let context = ClientContext::start(client_config(responder), Arc::new(IgnoreMessages))
        .await
        .unwrap();

    let first: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let second: Arc<dyn TransportOwner> = RecordingOwner::new(2);

    let (located, a) = tokio::time::timeout(
        Duration::from_secs(3),
        context.connect_channel("ring:current", 0, &first),
    )
    .await
    .expect("connect should finish")
    .unwrap();
    let (_, b) = tokio::time::timeout(
        Duration::from_secs(3),
        context.connect_channel("ring:current", 0, &second),
    )
    .await
    .expect("connect should finish")
    .unwrap();

    assert_eq!(located.server_addr, server_addr);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.state(), TransportState::Active);
    assert_eq!(a.owner_count(), 2);
    assert_eq!(context.registry().len(), 1);
    assert!(wait_until(Duration::from_secs(2), || server.len() == 1).await);

    context.shutdown();
    assert!(a.is_closed());
    assert!(context.registry().is_empty());
}
