//! WebSocket handler for browser connections.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use skiff_protocol::{BrowserEvent, ClientCommand, ServerEvent};

use crate::api::{ApiError, AppState};
use crate::session::{SessionError, SessionHandle, SessionRegistry, SessionResult};

/// Ping interval for keepalive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound events buffered per connection.
const EVENT_BUFFER_SIZE: usize = 256;

/// WebSocket upgrade handler.
///
/// GET /api/sessions/{session_id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let handle = state.sessions.get_or_spawn(&session_id)?;
    info!("WebSocket upgrade request for session {}", session_id);

    let sessions = state.sessions.clone();
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, sessions, handle)))
}

async fn handle_ws_connection(socket: WebSocket, sessions: SessionRegistry, handle: SessionHandle) {
    let session_id = handle.id().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<BrowserEvent>(EVENT_BUFFER_SIZE);

    let (handle, connection_id) = match attach(&sessions, handle, event_tx).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Could not attach browser to session {}: {}", session_id, e);
            if let Ok(json) = serde_json::to_string(&ServerEvent::error(e.to_string())) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            return;
        }
    };
    info!(
        "Browser connection {} attached to session {}",
        connection_id, session_id
    );

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        let result = match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(command) => handle.send_client(command).await,
                Err(e) => {
                    warn!("Malformed message for session {}: {}", session_id, e);
                    handle
                        .report_protocol_error(format!("malformed message: {e}"))
                        .await
                }
            },
            Ok(Message::Binary(_)) => {
                handle
                    .report_protocol_error("binary frames are not supported")
                    .await
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
            Ok(Message::Close(_)) => {
                info!("Browser closed WebSocket for session {}", session_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for session {}: {}", session_id, e);
                break;
            }
        };

        if let Err(e) = result {
            warn!("Session {} stopped accepting messages: {}", session_id, e);
            break;
        }
    }

    send_task.abort();
    if let Err(e) = handle.detach_browser(connection_id).await {
        debug!("Detach after close for session {}: {}", session_id, e);
    }
    info!("WebSocket connection closed for session {}", session_id);
}

/// Attach to the actor, respawning once if it stopped between lookup and
/// upgrade.
async fn attach(
    sessions: &SessionRegistry,
    handle: SessionHandle,
    events: mpsc::Sender<BrowserEvent>,
) -> SessionResult<(SessionHandle, u64)> {
    match handle.attach_browser(events.clone()).await {
        Ok(id) => Ok((handle, id)),
        Err(SessionError::ActorShutdown) => {
            let handle = sessions.get_or_spawn(handle.id())?;
            let id = handle.attach_browser(events).await?;
            Ok((handle, id))
        }
        Err(e) => Err(e),
    }
}
