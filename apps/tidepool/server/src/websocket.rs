//! Glue between axum WebSockets and the transport-neutral core drivers.

use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::future::ready;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use metrics::counter;
use tidepool_core::{ChannelMessage, Disconnect, MediaEndpoint, RelayEndpoint, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// How long the writer may keep flushing queued frames after the read side
/// finished.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) async fn serve_relay(socket: WebSocket, endpoint: RelayEndpoint, room: String) {
    let (connection, outbound) = endpoint.join(&room);
    let connection_id = connection.id();
    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, outbound, format!("relay:{room}:{connection_id}"));

    let reason = connection.run(inbound(ws_rx)).await;
    record_disconnect("relay", &reason);
    finish_writer(writer).await;
}

pub(crate) async fn serve_media(socket: WebSocket, endpoint: MediaEndpoint, buffer: usize) {
    let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, outbound_rx, "media".to_string());

    let reason = endpoint.serve(inbound(ws_rx), outbound_tx).await;
    record_disconnect("media", &reason);
    finish_writer(writer).await;
}

fn inbound(
    ws_rx: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<ChannelMessage, TransportError>> + Unpin {
    ws_rx.filter_map(|frame| {
        ready(match frame {
            Ok(message) => from_ws(message).map(Ok),
            Err(err) => Some(Err(TransportError::Broken(err.to_string()))),
        })
    })
}

/// Ping and pong are answered by axum itself and never reach the core.
fn from_ws(message: Message) -> Option<ChannelMessage> {
    match message {
        Message::Text(text) => Some(ChannelMessage::Text(text)),
        Message::Binary(data) => Some(ChannelMessage::Binary(Bytes::from(data))),
        Message::Close(frame) => Some(match frame {
            Some(frame) => ChannelMessage::close(frame.code, frame.reason.into_owned()),
            None => ChannelMessage::close(1005, ""),
        }),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_ws(message: ChannelMessage) -> Message {
    match message {
        ChannelMessage::Text(text) => Message::Text(text),
        ChannelMessage::Binary(data) => Message::Binary(data.to_vec()),
        ChannelMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })),
    }
}

fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ChannelMessage>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = message.is_close();
            if ws_tx.send(to_ws(message)).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        debug!(connection = %label, "writer task finished");
    })
}

async fn finish_writer(mut writer: JoinHandle<()>) {
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

fn record_disconnect(surface: &'static str, reason: &Disconnect) {
    let label = match reason {
        Disconnect::ClientClosed => "client_closed",
        Disconnect::StreamEnded => "stream_ended",
        Disconnect::Evicted => "evicted",
        Disconnect::Shutdown => "shutdown",
        Disconnect::Transport(_) => "transport",
        Disconnect::Session(err) => err.metric_label(),
    };
    counter!(
        "tidepool_connections_closed_total",
        1,
        "surface" => surface,
        "reason" => label
    );
    info!(surface, reason = label, "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn close_frames_keep_code_and_reason() {
        let message = to_ws(ChannelMessage::close(1002, "out_of_state"));
        let Message::Close(Some(frame)) = message else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1002);
        assert_eq!(frame.reason, "out_of_state");

        let back = from_ws(Message::Close(Some(frame)));
        assert_eq!(back, Some(ChannelMessage::close(1002, "out_of_state")));
    }

    #[test_timeout::timeout]
    fn control_frames_are_not_forwarded() {
        assert_eq!(from_ws(Message::Ping(vec![1])), None);
        assert_eq!(from_ws(Message::Pong(vec![1])), None);
        assert_eq!(
            from_ws(Message::Binary(vec![7, 8])),
            Some(ChannelMessage::Binary(Bytes::from_static(&[7, 8])))
        );
    }
}
