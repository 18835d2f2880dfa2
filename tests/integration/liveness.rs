use pva_core::wire::{finish_message, start_message, FLAG_SERVER};
use pva_transport::{Connector, TransportState};

use crate::*;

fn heartbeat_config(interval_ms: u64) -> TransportConfig {
    TransportConfig { heartbeat_interval_ms: interval_ms, ..test_config() }
}

/// A peer that goes quiet is flagged unresponsive once, and recovers on the
/// next message it sends.
#[tokio::test]
async fn test_silent_peer_unresponsive_then_recovers() {
    let (wake_tx, wake_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = fake_server(|mut stream| async move {
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        // Ignore probes until told to speak.
        wake_rx.await?;
        let mut buf = BytesMut::new();
        let start = start_message(&mut buf, command::ECHO, FLAG_SERVER, ByteOrder::Big);
        finish_message(&mut buf, start)?;
        stream.write_all(&buf).await?;
        // Keep the connection up until the client goes away.
        while read_frame(&mut stream).await.is_ok() {}
        Ok(())
    })
    .await
    .unwrap();

    let connector = Connector::new(
        TransportRegistry::new(),
        heartbeat_config(200),
        Arc::new(IgnoreMessages),
    );
    let owner = RecordingOwner::new(1);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&owner_dyn, addr, 0).await.unwrap();
    assert_eq!(transport.state(), TransportState::Active);

    assert!(
        wait_until(Duration::from_secs(3), || RecordingOwner::count(&owner.unresponsive) == 1)
            .await,
        "owner never told about the silence"
    );
    assert_eq!(transport.state(), TransportState::Unresponsive);
    assert!(!transport.is_closed(), "unresponsive is not closed");

    // Still silent: no repeat notification.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(RecordingOwner::count(&owner.unresponsive), 1);

    wake_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || RecordingOwner::count(&owner.responsive) == 1).await,
        "owner never told about recovery"
    );
    assert_eq!(transport.state(), TransportState::Active);
    assert_eq!(RecordingOwner::count(&owner.closed), 0);

    transport.release(owner.id);
    assert!(transport.is_closed());
}

/// Against a real acceptor, probes get answered and the transport stays
/// active well past the unresponsive threshold.
#[tokio::test]
async fn test_echo_keeps_transport_alive() {
    let (addr, _server, _stop) = start_acceptor(heartbeat_config(400)).await.unwrap();
    let connector = Connector::new(
        TransportRegistry::new(),
        heartbeat_config(400),
        Arc::new(IgnoreMessages),
    );
    let owner = RecordingOwner::new(1);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&owner_dyn, addr, 0).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_000)).await;

    assert_eq!(transport.state(), TransportState::Active);
    assert_eq!(RecordingOwner::count(&owner.unresponsive), 0);
}

/// The server end closing the socket closes the client transport and tells
/// its owner.
#[tokio::test]
async fn test_peer_hangup_closes_transport() {
    let (hangup_tx, hangup_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = fake_server(|mut stream| async move {
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        hangup_rx.await?;
        stream.shutdown().await?;
        Ok(())
    })
    .await
    .unwrap();

    let connector =
        Connector::new(TransportRegistry::new(), test_config(), Arc::new(IgnoreMessages));
    let owner = RecordingOwner::new(1);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&owner_dyn, addr, 0).await.unwrap();
    assert_eq!(connector.registry().len(), 1);

    hangup_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || transport.is_closed()).await,
        "transport should close on EOF"
    );
    assert_eq!(RecordingOwner::count(&owner.closed), 1);
    assert!(connector.registry().is_empty());
}

/// Panics in every callback.
struct PanickingOwner;

impl TransportOwner for PanickingOwner {
    fn owner_id(&self) -> OwnerId {
        99
    }

    fn transport_unresponsive(&self, _transport: &Transport) {
        panic!("unresponsive callback failed");
    }

    fn transport_responsive(&self, _transport: &Transport) {
        panic!("responsive callback failed");
    }

    fn transport_closed(&self, _transport: &Transport) {
        panic!("closed callback failed");
    }
}

/// One owner panicking neither stops the transport's tasks nor keeps the
/// other owners from being told.
#[tokio::test]
async fn test_panicking_owner_is_isolated() {
    let (wake_tx, wake_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = fake_server(|mut stream| async move {
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        wake_rx.await?;
        let mut buf = BytesMut::new();
        let start = start_message(&mut buf, command::ECHO, FLAG_SERVER, ByteOrder::Big);
        finish_message(&mut buf, start)?;
        stream.write_all(&buf).await?;
        while read_frame(&mut stream).await.is_ok() {}
        Ok(())
    })
    .await
    .unwrap();

    let connector = Connector::new(
        TransportRegistry::new(),
        heartbeat_config(200),
        Arc::new(IgnoreMessages),
    );
    let panicking: Arc<dyn TransportOwner> = Arc::new(PanickingOwner);
    let owner = RecordingOwner::new(1);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&panicking, addr, 0).await.unwrap();
    connector.connect(&owner_dyn, addr, 0).await.unwrap();
    assert_eq!(transport.owner_count(), 2);

    // Notified from the heartbeat task.
    assert!(
        wait_until(Duration::from_secs(3), || RecordingOwner::count(&owner.unresponsive) == 1)
            .await
    );
    // Notified from the reader task, which must have survived as well.
    wake_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || RecordingOwner::count(&owner.responsive) == 1).await
    );
    assert_eq!(transport.state(), TransportState::Active);

    transport.close();
    assert_eq!(RecordingOwner::count(&owner.closed), 1);
    assert!(connector.registry().is_empty());
}

/// Owners that go away without releasing still let the transport close.
#[tokio::test]
async fn test_dropped_owner_closes_transport() {
    let (addr, server, _stop) = start_acceptor(heartbeat_config(200)).await.unwrap();
    let connector = Connector::new(
        TransportRegistry::new(),
        heartbeat_config(200),
        Arc::new(IgnoreMessages),
    );
    let owner: Arc<dyn TransportOwner> = RecordingOwner::new(1);
    let transport = connector.connect(&owner, addr, 0).await.unwrap();
    assert_eq!(connector.registry().len(), 1);

    drop(owner);
    assert!(
        wait_until(Duration::from_secs(2), || transport.is_closed()).await,
        "transport should close once its only owner is gone"
    );
    assert!(connector.registry().is_empty());
    assert!(wait_until(Duration::from_secs(2), || server.is_empty()).await);
}
