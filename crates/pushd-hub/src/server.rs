use crate::apps::AppRegistry;
use crate::hub::{AppHub, DispatchError, CLOSE_NORMAL};
use crate::runtime::Outbound;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use pushd_core::protocol::{
    parse_client_message, ClientMessage, DEFAULT_MAX_FRAME_BYTES, PONG_FRAME,
};
use pushd_core::{ConnectionId, ConnectionState};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<AppRegistry>,
    transport: TransportSettings,
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("expected Upgrade: websocket")]
    MissingUpgrade,
    #[error("unknown app {0}")]
    UnknownApp(String),
    #[error("websocket handshake rejected: {0}")]
    Handshake(#[from] WebSocketUpgradeRejection),
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let status = match &self {
            UpgradeError::MissingUpgrade => StatusCode::UPGRADE_REQUIRED,
            UpgradeError::UnknownApp(_) => StatusCode::NOT_FOUND,
            UpgradeError::Handshake(_) => StatusCode::BAD_REQUEST,
        };
        match self {
            UpgradeError::Handshake(rejection) => rejection.into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

pub fn router(registry: Arc<AppRegistry>, transport: TransportSettings) -> Router {
    Router::new()
        .route("/app/:app_key", get(app_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/", get(demo_page))
        .with_state(ServerState {
            registry,
            transport,
        })
}

pub fn validate_upgrade(headers: &HeaderMap) -> Result<(), UpgradeError> {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if upgrade
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    {
        Ok(())
    } else {
        Err(UpgradeError::MissingUpgrade)
    }
}

async fn app_handler(
    Path(app_key): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, UpgradeError> {
    validate_upgrade(&headers)?;
    let app = state
        .registry
        .get_or_create(&app_key)
        .await
        .ok_or_else(|| UpgradeError::UnknownApp(app_key.clone()))?;
    let ws = ws?;
    let transport = state.transport.clone();
    Ok(ws
        .max_message_size(transport.max_frame_bytes.saturating_mul(4))
        .on_upgrade(move |socket| run_connection(app, socket, transport))
        .into_response())
}

async fn demo_page() -> Html<&'static str> {
    Html(DEMO_PAGE)
}

fn queue_reply(tx: &mpsc::Sender<Outbound>, conn_id: &ConnectionId, text: &str) {
    if let Err(err) = tx.try_send(Outbound::Text(text.to_string())) {
        debug!(event = "reply_dropped", conn_id = %conn_id, error = %err);
    }
}

fn outbound_message(outbound: Outbound) -> (Message, bool) {
    match outbound {
        Outbound::Text(text) => (Message::Text(text), false),
        Outbound::Close { code, reason } => (
            Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
            true,
        ),
    }
}

/// Drives one upgraded socket: a writer task drains the outbound queue while
/// this loop reads frames and hands them to the app's hub.
pub async fn run_connection(app: Arc<AppHub>, socket: WebSocket, settings: TransportSettings) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(settings.queue_capacity.max(1));
    let write_timeout = settings.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let (msg, closing) = outbound_message(outbound);
            let sent = tokio::time::timeout(write_timeout, ws_sender.send(msg)).await;
            if !matches!(sent, Ok(Ok(()))) || closing {
                return;
            }
        }
    });

    let accepted = match app.accept(tx.clone()).await {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "accept_failed", app = %app.app_key(), error = %err);
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };
    let conn_id = accepted.conn_id.clone();
    let mut state = match ConnectionState::Connecting.establish() {
        Ok(value) => value,
        Err(err) => {
            app.error(&conn_id, &err);
            ConnectionState::Closed
        }
    };

    while state.accepts_frames() {
        let Some(result) = ws_receiver.next().await else {
            break;
        };
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                app.error(&conn_id, &err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "frame_invalid", conn_id = %conn_id, error = %err);
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if text.len() > settings.max_frame_bytes {
            warn!(event = "frame_too_large", conn_id = %conn_id, size = text.len());
            continue;
        }
        if let Some(response) = accepted.auto_response.respond(&text) {
            queue_reply(&tx, &conn_id, response);
            continue;
        }
        if settings.debug {
            debug!(event = "frame_received", conn_id = %conn_id, raw = %text);
        }

        let message = match parse_client_message(text.as_bytes(), settings.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        match message {
            ClientMessage::Ping => queue_reply(&tx, &conn_id, PONG_FRAME),
            ClientMessage::Pong => {}
            other => {
                let event_name = other.event_name().to_string();
                if let Err(err) = app.dispatch(&conn_id, other).await {
                    warn!(
                        event = "dispatch_failed",
                        conn_id = %conn_id,
                        client_event = %event_name,
                        code = err.code(),
                        error = %err
                    );
                    if matches!(err, DispatchError::ConnectionClosed(_)) {
                        state = state.close();
                    }
                }
            }
        }
    }

    state = state.close();
    app.close(&conn_id, CLOSE_NORMAL, "disconnect").await;
    debug!(event = "connection_state", conn_id = %conn_id, state = %state);
    drop(tx);
    let _ = write_task.await;
}

const DEMO_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>pushd demo</title>
  <script src="https://js.pusher.com/8.2.0/pusher.min.js"></script>
</head>
<body>
  <h1>pushd demo</h1>
  <form id="send">
    <input id="text" placeholder="message" autocomplete="off">
    <button type="submit">send</button>
  </form>
  <ul id="log"></ul>
  <script>
    Pusher.logToConsole = true;
    const pusher = new Pusher("demo", {
      cluster: "",
      wsHost: window.location.hostname,
      wsPort: Number(window.location.port) || 80,
      forceTLS: false,
      enabledTransports: ["ws"],
    });
    const channel = pusher.subscribe("my-channel");
    const log = (line) => {
      const item = document.createElement("li");
      item.textContent = line;
      document.getElementById("log").appendChild(item);
    };
    channel.bind("pusher:subscription_succeeded", () => log("subscribed to my-channel"));
    channel.bind("client-message", (data) => log(JSON.stringify(data)));
    document.getElementById("send").addEventListener("submit", (event) => {
      event.preventDefault();
      const input = document.getElementById("text");
      channel.trigger("client-message", { text: input.value });
      input.value = "";
    });
  </script>
</body>
</html>
"#;
