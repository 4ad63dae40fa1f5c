use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use kiln_common::ConversionEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::api::{ConvertRequest, SharedState};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a fresh socket may stay silent before its request arrives.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── WebSocket handler ────────────────────────────────────────────────

/// `GET /api/convert/ws`: the first text frame is a [`ConvertRequest`];
/// events then flow back as text frames until the terminal one. Closing
/// the socket cancels the session.
pub async fn convert_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();

    let request = match read_request(&mut receiver).await {
        Ok(request) => request,
        Err(message) => {
            send_event(&mut sender, &ConversionEvent::error(message, None, Some("bad_request"))).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    if let Err(e) = state.orchestrator.check_input(&request.source) {
        send_event(&mut sender, &ConversionEvent::error(e.to_string(), None, Some("input"))).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let Some(permit) = state.admission.try_admit() else {
        tracing::warn!("websocket conversion rejected at capacity");
        send_event(
            &mut sender,
            &ConversionEvent::error("Too many conversions in progress; try again shortly", None, Some("busy")),
        )
        .await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    match state.orchestrator.start(request.source, permit) {
        Ok(handle) => {
            tracing::info!(session_id = %handle.session_id, "websocket conversion started");
            run_socket_loop(sender, receiver, handle.events).await;
        }
        Err(e) => {
            send_event(&mut sender, &ConversionEvent::error(e.to_string(), None, Some("input"))).await;
            let _ = sender.send(Message::Close(None)).await;
        }
    }
}

async fn read_request(receiver: &mut SplitStream<WebSocket>) -> Result<ConvertRequest, String> {
    let deadline = tokio::time::sleep(REQUEST_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Err("No conversion request received".to_string()),
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| format!("Invalid conversion request: {}", e));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err("Socket closed before a request was sent".to_string());
                }
                Some(Ok(_)) => continue,
            },
        }
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ConversionEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to serialize event");
            false
        }
    }
}

/// Forward session events with ping/pong keepalive.
///
/// Stops after the terminal event, when the client closes, or when no Pong
/// arrives within [`PONG_TIMEOUT`]. Returning drops the event receiver,
/// which cancels a session that is still running.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: mpsc::Receiver<ConversionEvent>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::info!("websocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                if !send_event(&mut sender, &event).await || terminal {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        tracing::info!("websocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
