use std::time::Duration;

use futures_util::stream;
use tidepool_core::protocol::CLOSE_GOING_AWAY;
use tidepool_core::registry::DEFAULT_ROOM;
use tidepool_core::{
    ChannelMessage, Disconnect, RelayConfig, RelayConnection, RelayEndpoint, RoomDirectory,
    TransportError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

struct Client {
    id: tidepool_core::ConnectionId,
    inbound: mpsc::Sender<Result<ChannelMessage, TransportError>>,
    outbound: mpsc::Receiver<ChannelMessage>,
    task: JoinHandle<Disconnect>,
}

fn spawn_client(connection: RelayConnection, outbound: mpsc::Receiver<ChannelMessage>) -> Client {
    let (inbound, rx) = mpsc::channel(16);
    let id = connection.id();
    let task = tokio::spawn(connection.run(ReceiverStream::new(rx)));
    Client {
        id,
        inbound,
        outbound,
        task,
    }
}

fn join(endpoint: &RelayEndpoint, room: &str) -> Client {
    let (connection, outbound) = endpoint.join(room);
    spawn_client(connection, outbound)
}

fn text(value: &str) -> ChannelMessage {
    ChannelMessage::Text(value.to_string())
}

async fn assert_silent(client: &mut Client) {
    let waited = tokio::time::timeout(Duration::from_millis(100), client.outbound.recv()).await;
    assert!(waited.is_err(), "unexpected message: {waited:?}");
}

#[test_timeout::tokio_timeout_test]
async fn ping_reaches_everyone_but_the_sender() {
    let endpoint = RelayEndpoint::new(RoomDirectory::default(), RelayConfig::default());
    let mut one = join(&endpoint, DEFAULT_ROOM);
    let mut two = join(&endpoint, DEFAULT_ROOM);
    let mut three = join(&endpoint, DEFAULT_ROOM);

    two.inbound.send(Ok(text("ping"))).await.unwrap();

    assert_eq!(one.outbound.recv().await, Some(text("ping")));
    assert_eq!(three.outbound.recv().await, Some(text("ping")));
    assert_silent(&mut two).await;
    assert_silent(&mut one).await;
    assert_silent(&mut three).await;
}

#[test_timeout::tokio_timeout_test]
async fn rooms_are_isolated() {
    let endpoint = RelayEndpoint::new(RoomDirectory::default(), RelayConfig::default());
    let lobby_sender = join(&endpoint, "lobby");
    let mut lobby_peer = join(&endpoint, "lobby");
    let mut elsewhere = join(&endpoint, "elsewhere");

    lobby_sender
        .inbound
        .send(Ok(ChannelMessage::Binary(bytes::Bytes::from_static(b"\x01\x02"))))
        .await
        .unwrap();

    assert_eq!(
        lobby_peer.outbound.recv().await,
        Some(ChannelMessage::Binary(bytes::Bytes::from_static(b"\x01\x02")))
    );
    assert_silent(&mut elsewhere).await;
}

#[test_timeout::tokio_timeout_test]
async fn broken_client_is_dropped_while_others_keep_receiving() {
    let rooms = RoomDirectory::default();
    let endpoint = RelayEndpoint::new(rooms.clone(), RelayConfig::default());
    let one = join(&endpoint, DEFAULT_ROOM);
    let two = join(&endpoint, DEFAULT_ROOM);
    let mut three = join(&endpoint, DEFAULT_ROOM);

    // Client one's writer is gone but its read loop is still running.
    let Client {
        id: one_id,
        inbound: _one_inbound,
        outbound: one_outbound,
        task: one_task,
    } = one;
    drop(one_outbound);

    two.inbound.send(Ok(text("offer-ish"))).await.unwrap();
    assert_eq!(three.outbound.recv().await, Some(text("offer-ish")));

    assert!(matches!(one_task.await.unwrap(), Disconnect::Evicted));
    let registry = rooms.room(DEFAULT_ROOM).unwrap();
    assert!(!registry.contains(one_id));
    assert_eq!(registry.len(), 2);

    two.inbound.send(Ok(text("second"))).await.unwrap();
    assert_eq!(three.outbound.recv().await, Some(text("second")));
}

#[test_timeout::tokio_timeout_test]
async fn leaving_clients_are_unregistered() {
    let rooms = RoomDirectory::default();
    let endpoint = RelayEndpoint::new(rooms.clone(), RelayConfig::default());
    let closing = join(&endpoint, "lobby");
    let hanging_up = join(&endpoint, "lobby");
    let failing = join(&endpoint, "lobby");
    assert_eq!(rooms.room("lobby").unwrap().len(), 3);

    closing
        .inbound
        .send(Ok(ChannelMessage::close(1000, "bye")))
        .await
        .unwrap();
    assert!(matches!(closing.task.await.unwrap(), Disconnect::ClientClosed));

    drop(hanging_up.inbound);
    assert!(matches!(hanging_up.task.await.unwrap(), Disconnect::StreamEnded));

    failing
        .inbound
        .send(Err(TransportError::Broken("reset by peer".into())))
        .await
        .unwrap();
    let reason = failing.task.await.unwrap();
    assert!(!reason.is_expected());
    assert!(matches!(reason, Disconnect::Transport(TransportError::Broken(_))));

    assert!(rooms.room("lobby").is_none());
    assert_eq!(rooms.room_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn evicted_connection_leaving_late_spares_the_recreated_room() {
    let rooms = RoomDirectory::default();
    let endpoint = RelayEndpoint::new(rooms.clone(), RelayConfig::default());

    // The evicted connection's loop only runs after the room was recreated.
    let (stale, stale_outbound) = endpoint.join("lobby");
    drop(stale_outbound);
    let survivor = join(&endpoint, "lobby");
    let old_lobby = rooms.room("lobby").unwrap();

    survivor.inbound.send(Ok(text("ping"))).await.unwrap();
    while old_lobby.contains(stale.id()) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    survivor
        .inbound
        .send(Ok(ChannelMessage::close(1000, "bye")))
        .await
        .unwrap();
    assert!(matches!(survivor.task.await.unwrap(), Disconnect::ClientClosed));
    assert!(rooms.room("lobby").is_none());

    let mut newcomer = join(&endpoint, "lobby");
    assert_eq!(newcomer.id, stale.id());

    let reason = stale
        .run(stream::pending::<Result<ChannelMessage, TransportError>>())
        .await;
    assert!(matches!(reason, Disconnect::Evicted));

    let lobby = rooms.room("lobby").unwrap();
    assert!(lobby.contains(newcomer.id));
    assert_eq!(lobby.len(), 1);
    assert_silent(&mut newcomer).await;
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_every_relay_connection() {
    let rooms = RoomDirectory::default();
    let shutdown = CancellationToken::new();
    let endpoint =
        RelayEndpoint::new(rooms.clone(), RelayConfig::default()).with_shutdown(shutdown.clone());
    let mut one = join(&endpoint, "lobby");
    let mut two = join(&endpoint, DEFAULT_ROOM);

    shutdown.cancel();
    for client in [&mut one, &mut two] {
        match client.outbound.recv().await {
            Some(ChannelMessage::Close { code, .. }) => assert_eq!(code, CLOSE_GOING_AWAY),
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
    assert!(matches!(one.task.await.unwrap(), Disconnect::Shutdown));
    assert!(matches!(two.task.await.unwrap(), Disconnect::Shutdown));
    assert_eq!(rooms.room_count(), 0);
}
