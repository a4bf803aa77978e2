//! Manages the client WebSocket connection lifecycle for a relay session.

use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use relay_core::{ClientHandle, SessionEnd, TranscriptionMessage};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

/// How long a finished session waits for the client to take its last
/// messages and the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type SocketSink = SplitSink<WebSocket, Message>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Frames read from the socket feed the relay session; its messages are
/// written back as JSON text. When the session ends the socket is closed
/// with a code that reflects why. A client that fell behind is dropped
/// without waiting for it.
#[instrument(name = "relay_session", skip_all, fields(session_id = %Uuid::new_v4()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let _active = state.stats.session_started();
    info!("New relay connection.");

    let (socket_tx, socket_rx) = socket.split();
    let (connection, ClientHandle { frames, outgoing }) = state.relay.connect();

    let reader = tokio::spawn(forward_frames(socket_rx, frames).in_current_span());
    let mut writer = tokio::spawn(pump_messages(socket_tx, outgoing).in_current_span());
    let end = state.relay.run(connection).await;
    reader.abort();

    let socket_tx = if end == SessionEnd::ClientTooSlow {
        writer.abort();
        None
    } else {
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
            Ok(Ok(socket_tx)) => socket_tx,
            Ok(Err(e)) => {
                debug!(error = ?e, "Writer task ended abnormally.");
                None
            }
            Err(_) => {
                warn!("Client did not take its remaining messages in time.");
                writer.abort();
                None
            }
        }
    };

    if let Some(mut socket_tx) = socket_tx {
        let close = socket_tx.send(Message::Close(Some(close_frame(&end))));
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Client socket already closed."),
            Err(_) => debug!("Timed out sending close frame."),
        }
    }
    info!(reason = %end, "Relay connection closed.");
}

/// Reads client frames until the client goes away or the session stops
/// accepting them. Dropping `frames` tells the relay the client disconnected.
async fn forward_frames(mut socket_rx: SplitStream<WebSocket>, frames: mpsc::Sender<Bytes>) {
    while let Some(msg_result) = socket_rx.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => {
                if frames.send(data).await.is_err() {
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                warn!("Ignoring text message; clients must send binary audio frames.")
            }
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                warn!(error = ?e, "Error receiving from client WebSocket.");
                break;
            }
        }
    }
}

/// Writes relay messages to the client until the session drops its sender.
///
/// Hands the sink back for the close frame, or `None` if the socket failed.
async fn pump_messages(
    mut socket_tx: SocketSink,
    mut outgoing: mpsc::Receiver<TranscriptionMessage>,
) -> Option<SocketSink> {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, &msg).await {
            debug!(error = ?e, "Client socket stopped accepting messages.");
            return None;
        }
    }
    Some(socket_tx)
}

/// A helper function to serialize and send a `TranscriptionMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SocketSink,
    msg: &TranscriptionMessage,
) -> Result<()> {
    let serialized = msg.to_json()?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

/// Maps how the session ended onto a WebSocket close code.
fn close_frame(end: &SessionEnd) -> CloseFrame {
    let code = match end {
        SessionEnd::ClientDisconnected | SessionEnd::BackendEnded => close_code::NORMAL,
        SessionEnd::BackendFailed(_) | SessionEnd::Fault(_) => close_code::ERROR,
        SessionEnd::ClientTooSlow => close_code::POLICY,
        SessionEnd::IdleTimeout => close_code::AWAY,
    };
    CloseFrame {
        code,
        reason: String::new().into(),
    }
}
