//! Prometheus text endpoint.
//!
//! Gauges and counters are rebuilt from actor snapshots on every scrape;
//! nothing is accumulated here. Labels follow `{name, state, id}`.

use crate::api::ApiState;
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::fmt::Write as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct MetricsServer {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl MetricsServer {
    pub async fn new(
        address: &str,
        state: ApiState,
        parent: &CancellationToken,
    ) -> std::io::Result<MetricsServer> {
        let bind = crate::conf::normalize_listen_addr(address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, "metrics listener opened");

        let token = parent.child_token();
        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(state);
        let shutdown = token.clone();
        let join = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        Ok(MetricsServer { token, join })
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

async fn scrape(State(state): State<ApiState>) -> impl IntoResponse {
    let mut out = String::new();

    if let Ok(paths) = state.pm.api_paths_list().await {
        for p in paths {
            let path_state = if p.ready { "ready" } else { "notReady" };
            let _ = writeln!(out, "paths{{name=\"{}\",state=\"{}\"}} 1", p.name, path_state);
            let _ = writeln!(
                out,
                "paths_bytes_received{{name=\"{}\"}} {}",
                p.name, p.bytes_received
            );
            let _ = writeln!(
                out,
                "paths_bytes_sent{{name=\"{}\"}} {}",
                p.name, p.bytes_sent
            );
            let _ = writeln!(out, "paths_readers{{name=\"{}\"}} {}", p.name, p.readers.len());
        }
    }

    for (metric, registry) in [
        ("rtsp_conns", &state.rtsp_conns),
        ("rtsp_sessions", &state.rtsp_sessions),
        ("rtsps_conns", &state.rtsps_conns),
        ("rtsps_sessions", &state.rtsps_sessions),
        ("rtmp_conns", &state.rtmp_conns),
        ("rtmps_conns", &state.rtmps_conns),
        ("srt_conns", &state.srt_conns),
        ("webrtc_sessions", &state.webrtc_sessions),
    ] {
        let Some(registry) = registry else { continue };
        for item in registry.list().await {
            let item_state = serde_json::to_value(item.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{metric}{{id=\"{}\",state=\"{}\"}} 1",
                item.id, item_state
            );
            let _ = writeln!(
                out,
                "{metric}_bytes_received{{id=\"{}\"}} {}",
                item.id, item.bytes_received
            );
            let _ = writeln!(
                out,
                "{metric}_bytes_sent{{id=\"{}\"}} {}",
                item.id, item.bytes_sent
            );
        }
    }

    if let Some(hls) = &state.hls_muxers {
        for muxer in hls.list().await {
            let _ = writeln!(out, "hls_muxers{{name=\"{}\"}} 1", muxer.path);
            let _ = writeln!(
                out,
                "hls_muxers_bytes_sent{{name=\"{}\"}} {}",
                muxer.path, muxer.bytes_sent
            );
        }
    }

    ([(axum::http::header::CONTENT_TYPE, "text/plain")], out)
}
