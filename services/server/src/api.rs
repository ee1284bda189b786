//! HTTP API.
//!
//! Versioned under `/v3`. Every handler is a thin translator: parse the
//! path/body, issue one synchronous request on the relevant actor channel,
//! marshal the reply. Config mutations build a new configuration by
//! clone + patch + validate and hand it to the Core's reload channel; no
//! lock is held across the reload.

use crate::conf::Conf;
use crate::path::manager::PathManagerHandle;
use crate::servers::RegistryHandle;
use crate::servers::hls::HlsHandle;
use axum::Router;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Handles the API needs from the rest of the system. Absent front-ends are
/// `None` and answer not-found.
#[derive(Clone)]
pub struct ApiState {
    pub conf: Arc<RwLock<Conf>>,
    pub reload_tx: mpsc::Sender<Conf>,
    pub pm: PathManagerHandle,
    pub rtsp_conns: Option<RegistryHandle>,
    pub rtsp_sessions: Option<RegistryHandle>,
    pub rtsps_conns: Option<RegistryHandle>,
    pub rtsps_sessions: Option<RegistryHandle>,
    pub rtmp_conns: Option<RegistryHandle>,
    pub rtmps_conns: Option<RegistryHandle>,
    pub srt_conns: Option<RegistryHandle>,
    pub webrtc_sessions: Option<RegistryHandle>,
    pub hls_muxers: Option<HlsHandle>,
}

impl ApiState {
    fn conf_snapshot(&self) -> Conf {
        self.conf.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn registry(&self, kind: &str) -> Option<RegistryHandle> {
        match kind {
            "rtspconns" => self.rtsp_conns.clone(),
            "rtspsessions" => self.rtsp_sessions.clone(),
            "rtspsconns" => self.rtsps_conns.clone(),
            "rtspssessions" => self.rtsps_sessions.clone(),
            "rtmpconns" => self.rtmp_conns.clone(),
            "rtmpsconns" => self.rtmps_conns.clone(),
            "srtconns" => self.srt_conns.clone(),
            "webrtcsessions" => self.webrtc_sessions.clone(),
            _ => None,
        }
    }
}

pub struct ApiServer {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ApiServer {
    pub async fn new(
        address: &str,
        state: ApiState,
        parent: &CancellationToken,
    ) -> std::io::Result<ApiServer> {
        let bind = crate::conf::normalize_listen_addr(address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, "API listener opened");

        let token = parent.child_token();
        let app = router(state);
        let shutdown = token.clone();
        let join = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        Ok(ApiServer { token, join })
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v3/config/global/get", get(config_global_get))
        .route("/v3/config/global/patch", patch(config_global_patch))
        .route("/v3/config/pathdefaults/get", get(config_pathdefaults_get))
        .route(
            "/v3/config/pathdefaults/patch",
            patch(config_pathdefaults_patch),
        )
        .route("/v3/config/paths/list", get(config_paths_list))
        .route("/v3/config/paths/get/{*name}", get(config_paths_get))
        .route("/v3/config/paths/add/{*name}", post(config_paths_add))
        .route("/v3/config/paths/patch/{*name}", patch(config_paths_patch))
        .route(
            "/v3/config/paths/replace/{*name}",
            post(config_paths_replace),
        )
        .route(
            "/v3/config/paths/delete/{*name}",
            delete(config_paths_delete),
        )
        .route("/v3/paths/list", get(paths_list))
        .route("/v3/paths/get/{*name}", get(paths_get))
        .route("/v3/hlsmuxers/list", get(hls_muxers_list))
        .route("/v3/hlsmuxers/get/{*name}", get(hls_muxers_get))
        .route("/v3/{kind}/list", get(registry_list))
        .route("/v3/{kind}/get/{id}", get(registry_get))
        .route("/v3/{kind}/kick/{id}", post(registry_kick))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(rename = "itemsPerPage", default = "default_items_per_page")]
    items_per_page: usize,
    #[serde(default)]
    page: usize,
}

fn default_items_per_page() -> usize {
    100
}

#[derive(Serialize)]
struct PagedResponse<T: Serialize> {
    #[serde(rename = "itemCount")]
    item_count: usize,
    #[serde(rename = "pageCount")]
    page_count: usize,
    items: Vec<T>,
}

fn paginate<T: Serialize>(mut items: Vec<T>, query: &PageQuery) -> PagedResponse<T> {
    let item_count = items.len();
    let per_page = query.items_per_page.max(1);
    let page_count = item_count.div_ceil(per_page).max(1);
    let start = query.page.saturating_mul(per_page).min(item_count);
    let end = start.saturating_add(per_page).min(item_count);
    let items = items.drain(start..end).collect();
    PagedResponse {
        item_count,
        page_count,
        items,
    }
}

/// Apply a clone+patch+validate mutation, then hand the result to the Core.
/// The reload itself is asynchronous; only one may be in flight.
async fn apply_conf(
    state: &ApiState,
    mutate: impl FnOnce(&Conf) -> Result<Conf, crate::conf::ConfError>,
) -> Response {
    let current = state.conf_snapshot();
    match mutate(&current) {
        Ok(new_conf) => match state.reload_tx.try_send(new_conf) {
            Ok(()) => StatusCode::OK.into_response(),
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "a reload is already in progress")
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "terminated")
            }
        },
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Config endpoints
// ---------------------------------------------------------------------------

async fn config_global_get(State(state): State<ApiState>) -> Response {
    axum::Json(state.conf_snapshot().global).into_response()
}

async fn config_global_patch(
    State(state): State<ApiState>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    apply_conf(&state, |conf| conf.patch_global(&body)).await
}

async fn config_pathdefaults_get(State(state): State<ApiState>) -> Response {
    axum::Json(state.conf_snapshot().path_defaults).into_response()
}

async fn config_pathdefaults_patch(
    State(state): State<ApiState>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    apply_conf(&state, |conf| conf.patch_path_defaults(&body)).await
}

fn conf_with_name(name: &str, conf: &crate::conf::PathConf) -> Value {
    let mut value = serde_json::to_value(conf).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert("name".to_owned(), Value::String(name.to_owned()));
    }
    value
}

async fn config_paths_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    let conf = state.conf_snapshot();
    let items: Vec<Value> = conf
        .paths
        .iter()
        .map(|(name, pc)| conf_with_name(name, pc))
        .collect();
    axum::Json(paginate(items, &query)).into_response()
}

async fn config_paths_get(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let conf = state.conf_snapshot();
    match conf.paths.get(&name) {
        Some(pc) => axum::Json(conf_with_name(&name, pc)).into_response(),
        None => not_found(),
    }
}

async fn config_paths_add(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    apply_conf(&state, |conf| conf.add_path(&name, body)).await
}

async fn config_paths_patch(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    apply_conf(&state, |conf| conf.patch_path(&name, &body)).await
}

async fn config_paths_replace(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    apply_conf(&state, |conf| conf.replace_path(&name, body)).await
}

async fn config_paths_delete(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    apply_conf(&state, |conf| conf.delete_path(&name)).await
}

// ---------------------------------------------------------------------------
// Runtime path endpoints
// ---------------------------------------------------------------------------

async fn paths_list(State(state): State<ApiState>, Query(query): Query<PageQuery>) -> Response {
    match state.pm.api_paths_list().await {
        Ok(items) => axum::Json(paginate(items, &query)).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "terminated"),
    }
}

async fn paths_get(State(state): State<ApiState>, AxumPath(name): AxumPath<String>) -> Response {
    match state.pm.api_paths_get(&name).await {
        Ok(Some(info)) => axum::Json(info).into_response(),
        Ok(None) => not_found(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "terminated"),
    }
}

// ---------------------------------------------------------------------------
// Connection/session registries
// ---------------------------------------------------------------------------

async fn registry_list(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    match state.registry(&kind) {
        Some(registry) => axum::Json(paginate(registry.list().await, &query)).into_response(),
        None => not_found(),
    }
}

async fn registry_get(
    State(state): State<ApiState>,
    AxumPath((kind, id)): AxumPath<(String, Uuid)>,
) -> Response {
    match state.registry(&kind) {
        Some(registry) => match registry.get(id).await {
            Some(item) => axum::Json(item).into_response(),
            None => not_found(),
        },
        None => not_found(),
    }
}

async fn registry_kick(
    State(state): State<ApiState>,
    AxumPath((kind, id)): AxumPath<(String, Uuid)>,
) -> Response {
    match state.registry(&kind) {
        Some(registry) => {
            if registry.kick(id).await {
                StatusCode::OK.into_response()
            } else {
                not_found()
            }
        }
        None => not_found(),
    }
}

// ---------------------------------------------------------------------------
// HLS muxers
// ---------------------------------------------------------------------------

async fn hls_muxers_list(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Response {
    match &state.hls_muxers {
        Some(hls) => axum::Json(paginate(hls.list().await, &query)).into_response(),
        None => not_found(),
    }
}

async fn hls_muxers_get(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match &state.hls_muxers {
        Some(hls) => match hls.get(&name).await {
            Some(info) => axum::Json(info).into_response(),
            None => not_found(),
        },
        None => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_counts_pages() {
        let query = PageQuery {
            items_per_page: 2,
            page: 0,
        };
        let paged = paginate(vec![1, 2, 3, 4, 5], &query);
        assert_eq!(paged.item_count, 5);
        assert_eq!(paged.page_count, 3);
        assert_eq!(paged.items, vec![1, 2]);

        let query = PageQuery {
            items_per_page: 2,
            page: 2,
        };
        let paged = paginate(vec![1, 2, 3, 4, 5], &query);
        assert_eq!(paged.items, vec![5]);

        let query = PageQuery {
            items_per_page: 2,
            page: 9,
        };
        let paged = paginate(vec![1, 2, 3, 4, 5], &query);
        assert!(paged.items.is_empty());

        let empty = paginate(Vec::<u32>::new(), &query);
        assert_eq!(empty.page_count, 1);
        assert_eq!(empty.item_count, 0);
    }
}
