//! HLS front-end.
//!
//! Muxers are created on the first playlist request (or eagerly on path
//! readiness when `hlsAlwaysRemux` is set), register as readers of their
//! path, and self-destroy after `hlsCloseAfterInactivity` without a request.
//! Segmentation is wall-clock driven: units are appended to the current
//! segment, rotated every `hlsSegmentDuration`, with the newest
//! `hlsSegmentCount` segments kept in memory.

use crate::auth::{AccessRequest, AuthAction};
use crate::conf::GlobalConf;
use crate::path::manager::{PathManagerHandle, PathNotify};
use crate::path::PathHandle;
use crate::servers::SharedSession;
use axum::Router;
use axum::extract::{Path as AxumPath, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// API view of one muxer.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHlsMuxer {
    pub path: String,
    pub created: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub bytes_sent: u64,
}

pub enum HlsApiRequest {
    List {
        res: oneshot::Sender<Vec<ApiHlsMuxer>>,
    },
    Get {
        name: String,
        res: oneshot::Sender<Option<ApiHlsMuxer>>,
    },
}

/// Narrow handle the API uses; `None` server → 404 at the call site.
#[derive(Clone)]
pub struct HlsHandle {
    tx: mpsc::Sender<HlsApiRequest>,
    token: CancellationToken,
}

impl HlsHandle {
    pub async fn list(&self) -> Vec<ApiHlsMuxer> {
        let (res, rx) = oneshot::channel();
        tokio::select! {
            _ = self.token.cancelled() => return Vec::new(),
            sent = self.tx.send(HlsApiRequest::List { res }) => {
                if sent.is_err() {
                    return Vec::new();
                }
            }
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get(&self, name: &str) -> Option<ApiHlsMuxer> {
        let (res, rx) = oneshot::channel();
        let name = name.to_owned();
        tokio::select! {
            _ = self.token.cancelled() => return None,
            sent = self.tx.send(HlsApiRequest::Get { name, res }) => sent.ok()?,
        }
        rx.await.ok()?
    }
}

pub struct HlsServer {
    handle: HlsHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl HlsServer {
    pub async fn new(
        conf: &GlobalConf,
        pm: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<HlsServer> {
        let bind = crate::conf::normalize_listen_addr(&conf.hls_address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, protocol = "hls", "listener opened");

        let token = parent.child_token();
        let (api_tx, api_rx) = mpsc::channel(8);
        let (req_tx, req_rx) = mpsc::channel(32);
        let (closed_tx, closed_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        if conf.hls_always_remux {
            pm.subscribe(notify_tx).await;
        }

        let actor = ServerActor {
            pm,
            always_remux: conf.hls_always_remux,
            segment_count: conf.hls_segment_count,
            segment_duration: conf.hls_segment_duration.get(),
            close_after_inactivity: conf.hls_close_after_inactivity.get(),
            muxers: HashMap::new(),
            tracker: TaskTracker::new(),
            api_rx,
            req_rx,
            closed_rx,
            closed_tx,
            notify_rx,
            token: token.clone(),
        };
        let join = tokio::spawn(actor.run());

        let app = Router::new()
            .route("/{*path}", get(handle_get))
            .with_state(HttpState { tx: req_tx });
        let http_token = token.clone();
        tokio::spawn(async move {
            let shutdown = http_token.clone();
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        Ok(HlsServer {
            handle: HlsHandle {
                tx: api_tx,
                token: token.clone(),
            },
            token,
            join,
        })
    }

    pub fn muxers(&self) -> HlsHandle {
        self.handle.clone()
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
    tx: mpsc::Sender<HttpRequest>,
}

enum HttpRequest {
    Playlist {
        name: String,
        res: oneshot::Sender<Result<String, MuxerError>>,
    },
    Segment {
        name: String,
        seq: u64,
        res: oneshot::Sender<Result<Bytes, MuxerError>>,
    },
}

#[derive(Debug)]
enum MuxerError {
    NotFound,
    Unauthorized,
    Unavailable,
}

async fn handle_get(
    AxumPath(path): AxumPath<String>,
    State(state): State<HttpState>,
) -> impl IntoResponse {
    let Some((name, file)) = path.rsplit_once('/') else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if file == "index.m3u8" {
        let (res_tx, res_rx) = oneshot::channel();
        if state
            .tx
            .send(HttpRequest::Playlist {
                name: name.to_owned(),
                res: res_tx,
            })
            .await
            .is_err()
        {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        return match res_rx.await {
            Ok(Ok(playlist)) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                playlist,
            )
                .into_response(),
            Ok(Err(e)) => muxer_error(e).into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    }

    if let Some(seq) = file
        .strip_prefix("seg")
        .and_then(|s| s.strip_suffix(".ts"))
        .and_then(|s| s.parse::<u64>().ok())
    {
        let (res_tx, res_rx) = oneshot::channel();
        if state
            .tx
            .send(HttpRequest::Segment {
                name: name.to_owned(),
                seq,
                res: res_tx,
            })
            .await
            .is_err()
        {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        return match res_rx.await {
            Ok(Ok(data)) => {
                (StatusCode::OK, [(header::CONTENT_TYPE, "video/mp2t")], data).into_response()
            }
            Ok(Err(e)) => muxer_error(e).into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

fn muxer_error(e: MuxerError) -> StatusCode {
    match e {
        MuxerError::NotFound => StatusCode::NOT_FOUND,
        MuxerError::Unauthorized => StatusCode::UNAUTHORIZED,
        MuxerError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ---------------------------------------------------------------------------
// Server actor
// ---------------------------------------------------------------------------

struct MuxerSlot {
    tx: mpsc::Sender<MuxerRequest>,
}

struct ServerActor {
    pm: PathManagerHandle,
    always_remux: bool,
    segment_count: usize,
    segment_duration: Duration,
    close_after_inactivity: Duration,
    muxers: HashMap<String, MuxerSlot>,
    tracker: TaskTracker,
    api_rx: mpsc::Receiver<HlsApiRequest>,
    req_rx: mpsc::Receiver<HttpRequest>,
    closed_rx: mpsc::Receiver<String>,
    closed_tx: mpsc::Sender<String>,
    notify_rx: mpsc::UnboundedReceiver<PathNotify>,
    token: CancellationToken,
}

impl ServerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(req) = self.api_rx.recv() => self.handle_api(req).await,
                req = self.req_rx.recv() => {
                    let Some(req) = req else { break };
                    self.handle_http(req);
                }
                Some(name) = self.closed_rx.recv() => {
                    self.muxers.remove(&name);
                }
                Some(event) = self.notify_rx.recv() => {
                    if let PathNotify::Ready { name } = event {
                        if self.always_remux {
                            self.ensure_muxer(&name, false);
                        }
                    }
                }
            }
        }
        self.tracker.close();
        // keep draining close reports so no muxer blocks on its way out
        loop {
            tokio::select! {
                _ = self.tracker.wait() => break,
                Some(_) = self.closed_rx.recv() => {}
            }
        }
    }

    async fn handle_api(&mut self, req: HlsApiRequest) {
        match req {
            HlsApiRequest::List { res } => {
                let slots: Vec<mpsc::Sender<MuxerRequest>> =
                    self.muxers.values().map(|s| s.tx.clone()).collect();
                tokio::spawn(async move {
                    let mut items = Vec::with_capacity(slots.len());
                    for tx in slots {
                        let (info_tx, info_rx) = oneshot::channel();
                        if tx.send(MuxerRequest::Info { res: info_tx }).await.is_ok() {
                            if let Ok(info) = info_rx.await {
                                items.push(info);
                            }
                        }
                    }
                    items.sort_by(|a, b| a.path.cmp(&b.path));
                    let _ = res.send(items);
                });
            }
            HlsApiRequest::Get { name, res } => match self.muxers.get(&name) {
                Some(slot) => {
                    let tx = slot.tx.clone();
                    tokio::spawn(async move {
                        let (info_tx, info_rx) = oneshot::channel();
                        let info = if tx.send(MuxerRequest::Info { res: info_tx }).await.is_ok() {
                            info_rx.await.ok()
                        } else {
                            None
                        };
                        let _ = res.send(info);
                    });
                }
                None => {
                    let _ = res.send(None);
                }
            },
        }
    }

    fn handle_http(&mut self, req: HttpRequest) {
        match req {
            HttpRequest::Playlist { name, res } => {
                let tx = self.ensure_muxer(&name, true);
                tokio::spawn(async move {
                    let (p_tx, p_rx) = oneshot::channel();
                    if tx.send(MuxerRequest::Playlist { res: p_tx }).await.is_err() {
                        let _ = res.send(Err(MuxerError::NotFound));
                        return;
                    }
                    match p_rx.await {
                        Ok(result) => {
                            let _ = res.send(result);
                        }
                        Err(_) => {
                            let _ = res.send(Err(MuxerError::NotFound));
                        }
                    }
                });
            }
            HttpRequest::Segment { name, seq, res } => match self.muxers.get(&name) {
                Some(slot) => {
                    let tx = slot.tx.clone();
                    tokio::spawn(async move {
                        let (s_tx, s_rx) = oneshot::channel();
                        if tx
                            .send(MuxerRequest::Segment { seq, res: s_tx })
                            .await
                            .is_err()
                        {
                            let _ = res.send(Err(MuxerError::NotFound));
                            return;
                        }
                        match s_rx.await {
                            Ok(result) => {
                                let _ = res.send(result);
                            }
                            Err(_) => {
                                let _ = res.send(Err(MuxerError::NotFound));
                            }
                        }
                    });
                }
                None => {
                    let _ = res.send(Err(MuxerError::NotFound));
                }
            },
        }
    }

    fn ensure_muxer(&mut self, name: &str, ephemeral: bool) -> mpsc::Sender<MuxerRequest> {
        if let Some(slot) = self.muxers.get(name) {
            return slot.tx.clone();
        }
        debug!(path = %name, "creating muxer");
        let (tx, rx) = mpsc::channel(8);
        self.muxers
            .insert(name.to_owned(), MuxerSlot { tx: tx.clone() });
        let muxer = Muxer {
            name: name.to_owned(),
            pm: self.pm.clone(),
            segment_count: self.segment_count,
            segment_duration: self.segment_duration,
            close_after_inactivity: self.close_after_inactivity,
            ephemeral,
            created: Utc::now(),
            last_request: Utc::now(),
            bytes_sent: 0,
            closed: self.closed_tx.clone(),
            token: self.token.child_token(),
        };
        self.tracker.spawn(async move {
            muxer.run(rx).await;
        });
        tx
    }
}

// ---------------------------------------------------------------------------
// Muxer actor
// ---------------------------------------------------------------------------

enum MuxerRequest {
    Playlist {
        res: oneshot::Sender<Result<String, MuxerError>>,
    },
    Segment {
        seq: u64,
        res: oneshot::Sender<Result<Bytes, MuxerError>>,
    },
    Info {
        res: oneshot::Sender<ApiHlsMuxer>,
    },
}

struct Muxer {
    name: String,
    pm: PathManagerHandle,
    segment_count: usize,
    segment_duration: Duration,
    close_after_inactivity: Duration,
    ephemeral: bool,
    created: DateTime<Utc>,
    last_request: DateTime<Utc>,
    bytes_sent: u64,
    closed: mpsc::Sender<String>,
    token: CancellationToken,
}

impl Muxer {
    async fn run(mut self, mut rx: mpsc::Receiver<MuxerRequest>) {
        // register as a reader of the path; this may trigger an on-demand
        // source and block until it is ready
        let shared = SharedSession::new("internal".to_owned(), &self.token);
        let mut access = AccessRequest::internal(&self.name, AuthAction::Read);
        access.protocol = "hls";
        // select on our own scope too: a reload must not wait out an
        // on-demand start
        let admitted = tokio::select! {
            _ = self.token.cancelled() => Err(crate::path::manager::PmError::Terminated),
            res = self.pm.add_reader(access, None, shared.path_session_handle("hls")) => res,
        };
        let (path, stream): (PathHandle, _) = match admitted {
            Ok(ok) => ok,
            Err(e) => {
                debug!(path = %self.name, error = %e, "muxer admission refused");
                // drain pending requests with the refusal before closing
                while let Ok(req) = rx.try_recv() {
                    refuse(req, &e);
                }
                let _ = self.closed.send(self.name.clone()).await;
                return;
            }
        };

        let (units_tx, mut units_rx) = mpsc::channel::<Bytes>(64);
        let mut stream_reader = stream.reader();
        if stream_reader
            .on_any_unit(move |_media, _format, unit| {
                units_tx
                    .try_send(unit.payload)
                    .map_err(|_| "muxer backlogged".into())
            })
            .is_err()
        {
            let _ = self.closed.send(self.name.clone()).await;
            return;
        }
        let drain_token = shared.token.clone();
        let drain = tokio::spawn(stream_reader.run(drain_token));

        let mut segments: VecDeque<(u64, Bytes)> = VecDeque::new();
        let mut current: Vec<u8> = Vec::new();
        let mut next_seq: u64 = 0;
        let mut rotate_at = Instant::now() + self.segment_duration;
        let mut inactive_at = Instant::now() + self.close_after_inactivity;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = shared.token.cancelled() => break,
                unit = units_rx.recv() => {
                    let Some(payload) = unit else { break };
                    current.extend_from_slice(&payload);
                }
                _ = tokio::time::sleep_until(rotate_at) => {
                    rotate_at = Instant::now() + self.segment_duration;
                    if !current.is_empty() {
                        segments.push_back((next_seq, Bytes::from(std::mem::take(&mut current))));
                        next_seq += 1;
                        while segments.len() > self.segment_count {
                            segments.pop_front();
                        }
                    }
                }
                _ = tokio::time::sleep_until(inactive_at) => {
                    if self.ephemeral {
                        debug!(path = %self.name, "muxer inactive, closing");
                        break;
                    }
                    inactive_at = Instant::now() + self.close_after_inactivity;
                }
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    self.last_request = Utc::now();
                    inactive_at = Instant::now() + self.close_after_inactivity;
                    self.answer(req, &segments);
                }
            }
        }

        shared.token.cancel();
        let _ = drain.await;
        path.remove_reader(shared.id);
        let _ = self.closed.send(self.name.clone()).await;
        debug!(path = %self.name, "muxer closed");
    }

    fn answer(&mut self, req: MuxerRequest, segments: &VecDeque<(u64, Bytes)>) {
        match req {
            MuxerRequest::Playlist { res } => {
                let target = self.segment_duration.as_secs().max(1);
                let first_seq = segments.front().map_or(0, |(seq, _)| *seq);
                let mut playlist = format!(
                    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:{first_seq}\n"
                );
                for (seq, _) in segments {
                    playlist.push_str(&format!(
                        "#EXTINF:{}.0,\nseg{seq}.ts\n",
                        self.segment_duration.as_secs().max(1)
                    ));
                }
                self.bytes_sent += playlist.len() as u64;
                let _ = res.send(Ok(playlist));
            }
            MuxerRequest::Segment { seq, res } => {
                match segments.iter().find(|(s, _)| *s == seq) {
                    Some((_, data)) => {
                        self.bytes_sent += data.len() as u64;
                        let _ = res.send(Ok(data.clone()));
                    }
                    None => {
                        let _ = res.send(Err(MuxerError::NotFound));
                    }
                }
            }
            MuxerRequest::Info { res } => {
                let _ = res.send(ApiHlsMuxer {
                    path: self.name.clone(),
                    created: self.created,
                    last_request: self.last_request,
                    bytes_sent: self.bytes_sent,
                });
            }
        }
    }
}

fn refuse(req: MuxerRequest, e: &crate::path::manager::PmError) {
    use crate::path::manager::PmError;
    let err = match e {
        PmError::Auth(_) => MuxerError::Unauthorized,
        PmError::Terminated | PmError::Path(crate::path::PathError::Terminated) => {
            MuxerError::Unavailable
        }
        _ => MuxerError::NotFound,
    };
    match req {
        MuxerRequest::Playlist { res } => {
            let _ = res.send(Err(err));
        }
        MuxerRequest::Segment { res, .. } => {
            let _ = res.send(Err(err));
        }
        MuxerRequest::Info { .. } => {}
    }
}
