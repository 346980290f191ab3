use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::backup::{BackupEvent, BackupManager};

pub fn routes() -> Router<BackupManager> {
    Router::new().route("/", get(websocket_handler))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(manager): State<BackupManager>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, manager))
}

fn status_message(manager: &BackupManager) -> Value {
    json!({
        "type": "status",
        "payload": manager.get_status()
    })
}

fn event_message(event: &BackupEvent) -> Value {
    json!({
        "type": "event",
        "payload": event
    })
}

/// Events after which the published status is worth re-sending.
fn changes_status(event: &BackupEvent) -> bool {
    !matches!(event, BackupEvent::Output { .. } | BackupEvent::ErrorOutput { .. })
}

async fn handle_socket(socket: WebSocket, manager: BackupManager) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = manager.subscribe_events();

    if let Err(e) = sender.send(Message::Text(status_message(&manager).to_string())).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let messages = match event_rx.recv().await {
                Ok(event) => {
                    let mut messages = vec![event_message(&event)];
                    if changes_status(&event) {
                        messages.push(status_message(&manager));
                    }
                    messages
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, skipped {} events", skipped);
                    vec![status_message(&manager)]
                }
                Err(RecvError::Closed) => break,
            };

            for msg in messages {
                if sender.send(Message::Text(msg.to_string())).await.is_err() {
                    return;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => debug!("Ignoring WebSocket message: {}", text),
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    debug!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::JobId;

    #[test]
    fn test_event_message_is_tagged() {
        let job = JobId::new();
        let msg = event_message(&BackupEvent::Output {
            job,
            line: "Compressing Assets".to_string(),
        });
        assert_eq!(msg["type"], "event");
        assert_eq!(msg["payload"]["type"], "output");
        assert_eq!(msg["payload"]["line"], "Compressing Assets");
        assert_eq!(msg["payload"]["job"], job.to_string());
    }

    #[test]
    fn test_only_lifecycle_events_resend_status() {
        let job = JobId::new();
        assert!(!changes_status(&BackupEvent::Output { job, line: String::new() }));
        assert!(!changes_status(&BackupEvent::ErrorOutput { job, line: String::new() }));
        assert!(changes_status(&BackupEvent::PreferencesReset));
        assert!(changes_status(&BackupEvent::SpawnFailed { message: String::new() }));
    }
}
