use std::sync::Weak;

use pva_core::wire::{command, finish_message, start_message};
use pva_core::{IntrospectionRegistry, WireError};
use pva_core::field::FieldDesc;
use pva_transport::{
    ConnectError, Connector, Role, TransportError, TransportSender, TransportState,
};

use crate::*;

fn connector(config: TransportConfig) -> Connector {
    Connector::new(TransportRegistry::new(), config, Arc::new(IgnoreMessages))
}

/// Concurrent connects to the same address and priority share one
/// connection; the server sees a single client.
#[tokio::test]
async fn test_concurrent_connects_share_transport() {
    let (addr, server, _stop) = start_acceptor(test_config()).await.unwrap();
    let connector = Arc::new(connector(test_config()));

    let owners: Vec<_> = (1..=8).map(RecordingOwner::new).collect();
    let attempts = owners.iter().map(|owner| {
        let connector = connector.clone();
        let owner: Arc<dyn TransportOwner> = owner.clone();
        async move { connector.connect(&owner, addr, 0).await }
    });
    let transports: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .expect("every connect should succeed");

    let first = &transports[0];
    assert!(transports.iter().all(|t| Arc::ptr_eq(t, first)), "transports differ");
    assert_eq!(first.state(), TransportState::Active);
    assert_eq!(first.role(), Role::Client);
    assert_eq!(first.owner_count(), 8);
    assert_eq!(connector.registry().len(), 1);
    assert_eq!(connector.registry().reservation_count(), 0);

    assert!(
        wait_until(Duration::from_secs(2), || server.len() == 1).await,
        "server should hold one transport, has {}",
        server.len()
    );
}

/// Priority is part of the key: same server, different priority, separate
/// connections. The server learns each client's priority.
#[tokio::test]
async fn test_priorities_get_distinct_transports() {
    let (addr, server, _stop) = start_acceptor(test_config()).await.unwrap();
    let connector = connector(test_config());

    let low: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let high: Arc<dyn TransportOwner> = RecordingOwner::new(2);
    let a = connector.connect(&low, addr, 0).await.unwrap();
    let b = connector.connect(&high, addr, 50).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.priority(), 0);
    assert_eq!(b.priority(), 50);
    assert_eq!(connector.registry().len(), 2);

    assert!(wait_until(Duration::from_secs(2), || server.len() == 2).await);
    let mut priorities: Vec<i16> = server.transports().iter().map(|t| t.priority()).collect();
    priorities.sort_unstable();
    assert_eq!(priorities, vec![0, 50]);
}

/// Releasing the last owner closes the transport, tells the remaining
/// owners and removes it from both registries.
#[tokio::test]
async fn test_last_release_closes_transport() {
    let (addr, server, _stop) = start_acceptor(test_config()).await.unwrap();
    let connector = connector(test_config());

    let first = RecordingOwner::new(1);
    let second = RecordingOwner::new(2);
    let first_dyn: Arc<dyn TransportOwner> = first.clone();
    let second_dyn: Arc<dyn TransportOwner> = second.clone();

    let transport = connector.connect(&first_dyn, addr, 0).await.unwrap();
    connector.connect(&second_dyn, addr, 0).await.unwrap();
    assert_eq!(transport.owner_count(), 2);

    transport.release(first.id);
    assert!(!transport.is_closed());
    assert_eq!(RecordingOwner::count(&first.closed), 0);

    transport.release(second.id);
    assert!(transport.is_closed());
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(connector.registry().len(), 0);

    // The server side notices the hang-up.
    assert!(wait_until(Duration::from_secs(2), || server.is_empty()).await);

    // A closed transport cannot be reused; a new connect builds a new one.
    let again = connector.connect(&first_dyn, addr, 0).await.unwrap();
    assert!(!Arc::ptr_eq(&again, &transport));
}

#[tokio::test]
async fn test_close_notifies_owners_once() {
    let (addr, _server, _stop) = start_acceptor(test_config()).await.unwrap();
    let connector = connector(test_config());

    let owner = RecordingOwner::new(7);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&owner_dyn, addr, 0).await.unwrap();

    transport.close();
    transport.close();
    assert_eq!(RecordingOwner::count(&owner.closed), 1);
    assert!(!transport.acquire(&owner_dyn), "closed transport must refuse owners");
}

/// A server that refuses validation makes the connect fail with its reason,
/// and leaves nothing behind.
#[tokio::test]
async fn test_refused_validation() {
    let addr = fake_server(|mut stream| async move {
        serve_handshake(
            &mut stream,
            ValidationStatus::Failed { kind: 1, message: "access denied".into() },
        )
        .await?;
        // Hold the socket until the client hangs up.
        let _ = read_frame(&mut stream).await;
        Ok(())
    })
    .await
    .unwrap();

    let connector = connector(test_config());
    let owner: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let err = connector.connect(&owner, addr, 0).await.unwrap_err();

    match err {
        ConnectError::ValidationRefused { message, .. } => assert_eq!(message, "access denied"),
        other => panic!("expected refusal, got {other:?}"),
    }
    assert!(connector.registry().is_empty());
    assert_eq!(connector.registry().reservation_count(), 0);
}

/// The client replies with its own priority and picks anonymous auth.
#[tokio::test]
async fn test_client_handshake_reply() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let addr = fake_server(|mut stream| async move {
        let reply = serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        let _ = tx.send(reply);
        let _ = read_frame(&mut stream).await;
        Ok(())
    })
    .await
    .unwrap();

    let connector = connector(test_config());
    let owner: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let transport = connector.connect(&owner, addr, 33).await.unwrap();
    assert_eq!(transport.state(), TransportState::Active);
    assert_eq!(transport.peer_receive_buffer_size(), 16_384);

    let reply = rx.await.unwrap();
    assert_eq!(reply.priority, Some(33));
    assert_eq!(reply.auth_methods, vec!["anonymous".to_string()]);
}

/// A peer that never validates times the connect out.
#[tokio::test]
async fn test_validation_timeout() {
    let addr = fake_server(|mut stream| async move {
        let _ = read_frame(&mut stream).await;
        Ok(())
    })
    .await
    .unwrap();

    let config = TransportConfig { validation_timeout_ms: 200, ..test_config() };
    let connector = connector(config);
    let owner: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let err = connector.connect(&owner, addr, 0).await.unwrap_err();
    assert!(matches!(err, ConnectError::ValidationTimeout(a) if a == addr), "{err:?}");
    assert!(connector.registry().is_empty());
}

struct Echo;

impl TransportSender for Echo {
    fn send(
        &self,
        buf: &mut BytesMut,
        order: ByteOrder,
        _introspection: &mut IntrospectionRegistry<FieldDesc>,
    ) -> Result<(), WireError> {
        let start = start_message(buf, command::ECHO, 0, order);
        buf.extend_from_slice(b"ping");
        finish_message(buf, start)
    }
}

/// Send requests are refused until validation completes, then delivered.
#[tokio::test]
async fn test_send_requires_validation() {
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    let addr = fake_server(|mut stream| async move {
        go_rx.await?;
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        let (header, payload) = read_frame(&mut stream).await?;
        let _ = seen_tx.send((header.command, payload));
        Ok(())
    })
    .await
    .unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let transport = Transport::start(
        stream,
        addr,
        0,
        Role::Client,
        &test_config(),
        Arc::new(IgnoreMessages),
        Weak::new(),
    );

    let err = transport.enqueue_send_request(Arc::new(Echo)).unwrap_err();
    assert!(matches!(err, TransportError::NotValidated(_)), "{err:?}");

    go_tx.send(()).unwrap();
    transport.wait_validated(Duration::from_secs(2)).await.unwrap();
    transport.enqueue_send_request(Arc::new(Echo)).unwrap();

    let (cmd, payload) = tokio::time::timeout(Duration::from_secs(2), seen_rx)
        .await
        .expect("server should see the echo")
        .unwrap();
    assert_eq!(cmd, command::ECHO);
    assert_eq!(&payload[..], b"ping");

    transport.close();
    let err = transport.enqueue_send_request(Arc::new(Echo)).unwrap_err();
    assert!(matches!(err, TransportError::Closed(_)), "{err:?}");
}
