use pva_core::introspection::ONLY_ID_TYPE_CODE;
use pva_core::wire::{finish_message, start_message, FLAG_SERVER, PVA_VERSION};
use pva_transport::{Connector, MessageHandler, TransportState};

use crate::*;

/// Application command the fake server uses for its messages.
const GET_FIELD: u8 = 17;

/// Reads a type description from every message. A leading ONLY_ID tag for
/// an id that was never sent fails with a [`WireError`]; anything else is
/// rejected as uninteresting.
#[derive(Default)]
struct TypeReader {
    handled: AtomicUsize,
}

impl MessageHandler for TypeReader {
    fn handle_message(
        &self,
        transport: &Arc<Transport>,
        header: &MessageHeader,
        mut payload: Bytes,
    ) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if payload.first() != Some(&ONLY_ID_TYPE_CODE) {
            bail!("no type description in command {}", header.command);
        }
        let order = header.byte_order();
        transport.with_introspection(|types| types.deserialize(&mut payload, order))?;
        Ok(())
    }
}

fn app_message(payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    let start = start_message(&mut buf, GET_FIELD, FLAG_SERVER, ByteOrder::Big);
    buf.extend_from_slice(payload);
    finish_message(&mut buf, start)?;
    Ok(buf)
}

async fn connect_with(
    addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
) -> (Connector, Arc<RecordingOwner>, Arc<Transport>) {
    let connector = Connector::new(TransportRegistry::new(), test_config(), handler);
    let owner = RecordingOwner::new(1);
    let owner_dyn: Arc<dyn TransportOwner> = owner.clone();
    let transport = connector.connect(&owner_dyn, addr, 0).await.unwrap();
    assert_eq!(transport.state(), TransportState::Active);
    assert_eq!(connector.registry().len(), 1);
    (connector, owner, transport)
}

/// A header without the PVA magic aborts the connection.
#[tokio::test]
async fn test_bad_magic_closes_transport() {
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = fake_server(|mut stream| async move {
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        go_rx.await?;
        stream.write_all(&[0x00, PVA_VERSION, FLAG_SERVER, GET_FIELD, 0, 0, 0, 0]).await?;
        while read_frame(&mut stream).await.is_ok() {}
        Ok(())
    })
    .await
    .unwrap();

    let (connector, owner, transport) = connect_with(addr, Arc::new(IgnoreMessages)).await;

    go_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || transport.is_closed()).await,
        "transport should close on a bad header"
    );
    assert_eq!(RecordingOwner::count(&owner.closed), 1);
    assert!(connector.registry().is_empty());
}

/// A handler that fails with a wire error closes the connection; other
/// handler errors are only logged.
#[tokio::test]
async fn test_unknown_type_id_closes_transport() {
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = fake_server(|mut stream| async move {
        serve_handshake(&mut stream, ValidationStatus::Ok).await?;
        go_rx.await?;
        stream.write_all(&app_message(&[0x00])?).await?;
        // ONLY_ID for id 5, which was never defined on this connection.
        stream.write_all(&app_message(&[ONLY_ID_TYPE_CODE, 0x00, 0x05])?).await?;
        while read_frame(&mut stream).await.is_ok() {}
        Ok(())
    })
    .await
    .unwrap();

    let reader = Arc::new(TypeReader::default());
    let (connector, owner, transport) = connect_with(addr, reader.clone()).await;

    go_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || transport.is_closed()).await,
        "transport should close on an unknown type id"
    );
    // The first, merely uninteresting message did not end the connection.
    assert_eq!(reader.handled.load(Ordering::SeqCst), 2);
    assert_eq!(RecordingOwner::count(&owner.closed), 1);
    assert!(connector.registry().is_empty());
}
