use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use forma_types::{ArtifactFormat, ClientEvent};

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("forma engine listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/event", get(events))
        .route("/ws", get(chat_ws))
        .route("/artifacts/{name}", get(artifact_download))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "build": crate::build_id(),
        "sessions": state.sessions.count().await,
        "timestampMs": crate::now_ms(),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

/// Global diagnostic tap of the event bus. The chat transport is the
/// WebSocket below; this exists for dashboards and debugging.
async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&ClientEvent::new("server-connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| {
        let filter_id = filter.session_id.clone();
        async move {
            match msg {
                Ok(event) => {
                    if !event_matches_filter(&event, filter_id.as_deref()) {
                        return None;
                    }
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    Some(Ok(Event::default().data(payload)))
                }
                Err(_) => None,
            }
        }
    });
    initial.chain(live)
}

fn event_matches_filter(event: &ClientEvent, session_id: Option<&str>) -> bool {
    match session_id {
        Some(id) => event.session_id() == Some(id),
        None => true,
    }
}

/// Inbound commands on the chat socket.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientCommand {
    Message { message: String },
    Rerun { code: String },
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| chat_ws_stream(socket, state))
}

async fn chat_ws_stream(socket: WebSocket, state: AppState) {
    let session = state.sessions.create().await;
    let session_id = session.id().to_string();
    tracing::info!(%session_id, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(256);

    // Writer task: one place serializes and sends, so bus order is
    // preserved on the wire.
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!("failed to serialize event: {err}");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = outbound_tx
        .send(ClientEvent::new(
            "session-created",
            json!({"sessionID": session_id}),
        ))
        .await;

    // Bus task: forward this session's events in publish order. Dropping
    // the task on disconnect stops emission without touching any spawned
    // interpreter process.
    let bus_task = {
        let mut bus_rx = state.event_bus.subscribe();
        let outbound_tx = outbound_tx.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        if event.session_id() != Some(session_id.as_str()) {
                            continue;
                        }
                        if outbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%session_id, skipped, "event forwarding lagged");
                        continue;
                    }
                }
            }
        })
    };

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(%session_id, "websocket error: {err}");
                break;
            }
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(err) => {
                let _ = outbound_tx
                    .send(ClientEvent::new(
                        "error",
                        json!({
                            "sessionID": session_id,
                            "error": format!("unrecognized command: {err}"),
                        }),
                    ))
                    .await;
                continue;
            }
        };

        // Spawned so the read loop stays responsive while a response
        // streams; executions themselves serialize on the session lock.
        match command {
            ClientCommand::Message { message } => {
                let coordinator = state.coordinator.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = coordinator.run_prompt(&session_id, &message).await {
                        tracing::error!(%session_id, "prompt failed: {err}");
                    }
                });
            }
            ClientCommand::Rerun { code } => {
                let coordinator = state.coordinator.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = coordinator.rerun(&session_id, &code).await {
                        tracing::error!(%session_id, "rerun failed: {err}");
                    }
                });
            }
        }
    }

    tracing::info!(%session_id, "client disconnected");
    bus_task.abort();
    send_task.abort();

    if let Some(slot) = state.sessions.destroy(&session_id).await {
        state
            .coordinator
            .pipeline()
            .artifacts()
            .delete_slot(&slot)
            .await;
    }
}

async fn artifact_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let Some(content_type) = artifact_content_type(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let path = state
        .coordinator
        .pipeline()
        .artifacts()
        .output_dir()
        .join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Only bare filenames with a known export extension are servable; anything
/// that could traverse out of the output directory is rejected.
fn artifact_content_type(name: &str) -> Option<&'static str> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return None;
    }
    let extension = name.rsplit_once('.')?.1;
    ArtifactFormat::ALL
        .into_iter()
        .find(|format| format.extension() == extension)
        .map(|format| match format {
            ArtifactFormat::Model => "model/3mf",
            ArtifactFormat::Mesh => "model/stl",
            ArtifactFormat::Interchange => "application/step",
        })
}
