//! Axum operator API over the watchlists and the association table.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lookout_core::WatchEntries;
use lookout_sync::{
    AssociationCheck, Lookout, RosterTracker, WatchAction, Watchlist, WatchlistKind,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "lookout-web";

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<RosterTracker>,
    pub hunted: Arc<Watchlist>,
    pub team: Arc<Watchlist>,
}

impl AppState {
    pub fn new(tracker: Arc<RosterTracker>, hunted: Arc<Watchlist>, team: Arc<Watchlist>) -> Self {
        Self {
            tracker,
            hunted,
            team,
        }
    }

    pub fn from_lookout(lookout: &Lookout) -> Self {
        Self::new(
            lookout.tracker.clone(),
            lookout.hunted.clone(),
            lookout.team.clone(),
        )
    }

    fn watchlist(&self, kind: WatchlistKind) -> &Watchlist {
        match kind {
            WatchlistKind::Hunted => &self.hunted,
            WatchlistKind::Team => &self.team,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WatchRequest {
    #[serde(default)]
    name: String,
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "None".to_string()
}

#[derive(Debug, Serialize)]
struct WatchlistView {
    list: WatchlistKind,
    running: bool,
    entries: WatchEntries,
}

#[derive(Debug, Serialize)]
struct ResultView {
    result: String,
}

#[derive(Debug, Serialize)]
struct CheckView {
    name: String,
    #[serde(flatten)]
    check: AssociationCheck,
    result: String,
}

#[derive(Debug, Deserialize)]
struct PurgeRequest {
    threshold: u32,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/watchlists/{list}", get(watchlist_handler))
        .route("/watchlists/{list}/{action}", post(watch_action_handler))
        .route("/associations/purge", post(purge_handler))
        .route("/associations/{name}", get(check_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

fn parse_list(list: &str) -> Result<WatchlistKind, Response> {
    list.parse::<WatchlistKind>().map_err(|err| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response()
    })
}

async fn watchlist_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(list): AxumPath<String>,
) -> Response {
    let kind = match parse_list(&list) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let watchlist = state.watchlist(kind);
    Json(WatchlistView {
        list: kind,
        running: watchlist.is_running(),
        entries: watchlist.entries().await,
    })
    .into_response()
}

async fn watch_action_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((list, action)): AxumPath<(String, String)>,
    Json(req): Json<WatchRequest>,
) -> Response {
    let kind = match parse_list(&list) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let action = WatchAction::parse(&action);
    match state
        .watchlist(kind)
        .handle(action, req.name.trim(), &req.reason)
        .await
    {
        Ok(result) => {
            info!(list = %kind, ?action, name = %req.name, "watchlist action");
            Json(ResultView { result }).into_response()
        }
        Err(busy) => (
            StatusCode::CONFLICT,
            Json(ResultView {
                result: busy.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn check_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Json<CheckView> {
    let check = state.tracker.check(&name).await;
    Json(CheckView {
        result: check.to_string(),
        name,
        check,
    })
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurgeRequest>,
) -> Json<lookout_sync::PurgeReport> {
    Json(state.tracker.purge(req.threshold).await)
}
