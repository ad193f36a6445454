use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use lib_common::markets::gpu::Snapshot;
use lib_common::markets::gpu::query;
use serde_json::json;
use tokio::sync::broadcast;

use crate::offers_logic::config::Config;
use crate::offers_logic::model::{ClientMessage, ServerMessage, SnapshotParams, SnapshotView, StatsView};
use crate::offers_logic::state::AppState;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/stats", get(stats_handler))
        .route("/summary", get(summary_handler))
        .route("/catalog", get(catalog_handler))
        .with_state(app_state)
}

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let status = state.engine.status();
    let code = if status.running { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "engine": status, "clients": state.client_count() }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn snapshot_handler(State(state): State<AppState>, Query(params): Query<SnapshotParams>) -> Response {
    let q = match params.to_query() {
        Ok(q) => q,
        Err(e) => return bad_request(e),
    };
    let snapshot = state.engine.get_current();
    let view = SnapshotView {
        sequence: snapshot.sequence,
        loading: snapshot.is_loading(),
        error: snapshot.error.as_deref(),
        metadata: &snapshot.metadata,
        offers: query::run(&snapshot, &q),
    };
    Json(view).into_response()
}

async fn stats_handler(State(state): State<AppState>, Query(params): Query<SnapshotParams>) -> Response {
    let q = match params.to_query() {
        Ok(q) => q,
        Err(e) => return bad_request(e),
    };
    let snapshot = state.engine.get_current();
    Json(StatsView {
        sequence: snapshot.sequence,
        stats: query::stats(query::run(&snapshot, &q)),
    })
    .into_response()
}

async fn summary_handler(State(state): State<AppState>) -> Response {
    match state.engine.summary() {
        Some(summary) => Json(summary).into_response(),
        None => (StatusCode::NO_CONTENT, ()).into_response(),
    }
}

async fn catalog_handler(State(state): State<AppState>) -> Response {
    Json(state.engine.catalog()).into_response()
}

fn encode(msg: &ServerMessage<'_>) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            log::error!("Failed to encode downstream message: {}", e);
            None
        }
    }
}

/// Sequence and error last delivered to one socket.
#[derive(Debug, Default)]
struct Delivered {
    sequence: Option<u64>,
    error: Option<String>,
}

/// Messages that bring a socket from `delivered` up to `snapshot`. New data
/// goes out as a `snapshot`; a new error as an `error` message, on its own
/// when the offers did not change.
fn updates_for<'a>(delivered: &mut Delivered, snapshot: &'a Snapshot) -> Vec<ServerMessage<'a>> {
    let mut out = Vec::new();
    if delivered.sequence != Some(snapshot.sequence) {
        out.push(ServerMessage::Snapshot(snapshot));
    }
    if snapshot.error != delivered.error {
        if let Some(message) = &snapshot.error {
            out.push(ServerMessage::Error { message: message.clone() });
        }
    }
    delivered.sequence = Some(snapshot.sequence);
    delivered.error = snapshot.error.clone();
    out
}

async fn send_updates(socket: &mut WebSocket, delivered: &mut Delivered, snapshot: &Snapshot) -> bool {
    for update in updates_for(delivered, snapshot) {
        if let Some(msg) = encode(&update) {
            if socket.send(msg).await.is_err() {
                return false;
            }
        }
    }
    true
}

async fn handle_client_message(socket: &mut WebSocket, state: &AppState, text: &str) -> bool {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Refresh) => match state.engine.force_refresh() {
            Ok(()) => return true,
            Err(e) => ServerMessage::Error { message: e.to_string() },
        },
        Ok(ClientMessage::SetFilters { filters }) => {
            state.engine.set_filter_params(filters);
            ServerMessage::Status(state.engine.status())
        }
        Err(e) => ServerMessage::Error { message: format!("invalid message: {}", e) },
    };
    match encode(&reply) {
        Some(msg) => socket.send(msg).await.is_ok(),
        None => true,
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let connected = state.add_client();
    log::info!("Client {} connected ({} total)", client_id, connected);

    let mut data_rx = state.snapshots.subscribe();

    // Late joiners get the current snapshot right away; the empty loading
    // snapshot counts as already delivered.
    let mut delivered = Delivered { sequence: Some(0), error: None };
    let current = state.engine.get_current();
    let mut alive = send_updates(&mut socket, &mut delivered, &current).await;

    while alive {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        alive = handle_client_message(&mut socket, &state, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            received = data_rx.recv() => {
                let snapshot: Arc<Snapshot> = match received {
                    Ok(s) => s,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Client {} lagged by {} snapshots, resyncing", client_id, skipped);
                        state.engine.get_current()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                alive = send_updates(&mut socket, &mut delivered, &snapshot).await;
            }
        }
    }

    let remaining = state.remove_client();
    log::info!("Client {} disconnected ({} remaining)", client_id, remaining);
}
