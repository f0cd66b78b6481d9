use std::convert::Infallible;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::coordinator::Coordinator;
use crate::hub::BroadcastHub;
use crate::scanner::DeviceScanner;
use crate::store::{Period, TimeSeriesStore};

const DEFAULT_HISTORY_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub hub: Arc<BroadcastHub>,
    pub scanner: DeviceScanner,
    pub store: TimeSeriesStore,
    pub scan_timeout: f64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    period: Option<String>,
    limit: Option<i64>,
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let scan = warp::path("scan")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_scan);

    let api = warp::path("api");

    let history = api
        .and(warp::path("history"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_history);

    let status = api
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: AppState| warp::reply::json(&state.coordinator.session().status()));

    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_state(state))
        .map(|ws: warp::ws::Ws, state: AppState| ws.on_upgrade(move |socket| handle_viewer(socket, state)));

    scan.or(history).or(status).or(ws)
}

async fn handle_scan(state: AppState) -> Result<impl Reply, Rejection> {
    info!("Scanning for devices...");
    let devices = state.scanner.discover(state.scan_timeout).await;
    Ok(warp::reply::json(&devices))
}

async fn handle_history(query: HistoryQuery, state: AppState) -> Result<impl Reply, Rejection> {
    let period = match query.period.as_deref() {
        None => Period::default(),
        Some(p) => p.parse().unwrap_or_else(|e| {
            warn!("{}, returning raw readings", e);
            Period::Raw
        }),
    };
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    match state.store.history(period, limit).await {
        Ok(points) => Ok(warp::reply::with_status(warp::reply::json(&points), StatusCode::OK)),
        Err(e) => {
            error!("History query failed: {}", e);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"error": e.to_string()})),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

/// One viewer's lifetime: register with the hub, relay its signals out and
/// its commands in, one command at a time.
async fn handle_viewer(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (id, mut rx_signal) = state.hub.register();
    info!("Viewer {} connected ({} watching)", id, state.hub.viewer_count());

    let outbound = tokio::spawn(async move {
        while let Some(signal) = rx_signal.recv().await {
            let text = match serde_json::to_string(&signal) {
                Ok(text) => text,
                Err(e) => {
                    error!("Could not encode {:?}: {}", signal, e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::text(text)).await {
                warn!("Viewer {} send failed: {}", id, e);
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        };
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else { continue; };
        state.coordinator.handle_text(text).await;
    }

    state.hub.unregister(id);
    outbound.abort();
    info!("Viewer {} disconnected", id);
}
