//! WebSocket transport for the worker connection protocol.
//!
//! This is a thin pump: frames are decoded and handed to
//! [`FleetProtocol`], replies and out-of-band dispatches are written back.
//! All protocol decisions live in `protocol::connection`.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::mpsc;

use crate::api::SharedState;
use crate::protocol::connection::SessionState;
use crate::protocol::message::{Envelope, ServerMessage, WorkerMessage};

pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(connect))
}

async fn connect(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    let mut session = SessionState::default();
    // Attached once the session has identified itself; carries frames
    // pushed by REST handlers and the dispatch path.
    let mut outbound: Option<mpsc::Receiver<Envelope<ServerMessage>>> = None;

    'conn: loop {
        tokio::select! {
            frame = recv_outbound(&mut outbound) => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break 'conn;
                        }
                    }
                    // Sender dropped: this connection was replaced.
                    None => break 'conn,
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break 'conn };
                match message {
                    Message::Text(text) => {
                        if !handle_text(&state, &mut session, &mut outbound, &mut socket, &text)
                            .await
                        {
                            break 'conn;
                        }
                    }
                    Message::Close(_) => break 'conn,
                    // Pings are answered by the library; binary is ignored.
                    _ => {}
                }
            }
        }
    }

    state.protocol.handle_disconnect(&session).await;
}

/// Decode and process one text frame. Returns false when the socket died.
async fn handle_text(
    state: &SharedState,
    session: &mut SessionState,
    outbound: &mut Option<mpsc::Receiver<Envelope<ServerMessage>>>,
    socket: &mut WebSocket,
    text: &str,
) -> bool {
    let envelope: Envelope<WorkerMessage> = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Malformed input gets an error frame; the connection survives.
            tracing::debug!("Malformed worker frame: {e}");
            let err = Envelope::new(ServerMessage::Error {
                message: format!("Malformed message: {e}"),
            });
            return send_frame(socket, &err).await.is_ok();
        }
    };

    let identified_before = session.worker_id.is_some();
    let replies = state.protocol.handle_message(session, envelope).await;
    for reply in replies {
        if send_frame(socket, &reply).await.is_err() {
            return false;
        }
    }

    if !identified_before {
        if let Some(worker_id) = session.worker_id {
            *outbound = Some(state.connections.attach(worker_id).await);
            // Flush commands queued while the worker was away.
            for frame in state.protocol.dispatch_pending(worker_id).await {
                if send_frame(socket, &frame).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

async fn recv_outbound(
    rx: &mut Option<mpsc::Receiver<Envelope<ServerMessage>>>,
) -> Option<Envelope<ServerMessage>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_frame(
    socket: &mut WebSocket,
    frame: &Envelope<ServerMessage>,
) -> std::result::Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}
