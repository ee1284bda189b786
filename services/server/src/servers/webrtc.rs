//! WebRTC front-end (WHIP ingest, WHEP playback).
//!
//! The HTTP control surface is real: `POST /{path}/whip` and
//! `POST /{path}/whep` run admission and create a session actor, answering
//! with an SDP whose candidate carries the session's UDP port;
//! `DELETE /sessions/{id}` tears the session down. The ICE/DTLS stack is
//! the library seam: the data plane is a per-session datagram socket, media
//! payloads prefixed with their media index.

use crate::auth::{AccessRequest, AuthAction, ProvidedCredentials, generate_nonce};
use crate::conf::GlobalConf;
use crate::path::PathHandle;
use crate::path::manager::PathManagerHandle;
use crate::servers::{
    Registry, RegistryHandle, RegistryRequest, SessionState, SharedSession,
};
use axum::Router;
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use bytes::Bytes;
use lg_media::{Description, Unit};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_DATAGRAM: usize = 1500;

pub struct WebRtcServer {
    sessions: RegistryHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// A refused admission, with the digest challenge to answer on 401.
struct Refusal {
    reason: String,
    challenge: Option<String>,
}

enum ServerRequest {
    NewSession {
        action: AuthAction,
        access: AccessRequest,
        peer: SocketAddr,
        res: oneshot::Sender<Result<(Uuid, u16), Refusal>>,
    },
    Delete {
        id: Uuid,
        res: oneshot::Sender<bool>,
    },
}

impl WebRtcServer {
    pub async fn new(
        conf: &GlobalConf,
        pm: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<WebRtcServer> {
        let bind = crate::conf::normalize_listen_addr(&conf.webrtc_address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, protocol = "webrtc", "listener opened");

        let token = parent.child_token();
        let (api_tx, api_rx) = mpsc::channel(8);
        let (req_tx, req_rx) = mpsc::channel(8);
        let (closed_tx, closed_rx) = mpsc::channel(64);

        let actor = ServerActor {
            pm,
            read_timeout: conf.read_timeout.get(),
            sessions: Registry::default(),
            live: HashMap::new(),
            nonces: HashMap::new(),
            tracker: TaskTracker::new(),
            api_rx,
            req_rx,
            closed_tx,
            closed_rx,
            token: token.clone(),
        };
        let join = tokio::spawn(actor.run());

        let app = Router::new()
            .route("/{*path}", post(handle_post))
            .route("/sessions/{id}", delete(handle_delete))
            .with_state(HttpState { tx: req_tx });
        let http_token = token.clone();
        tokio::spawn(async move {
            let shutdown = http_token.clone();
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        });

        Ok(WebRtcServer {
            sessions: RegistryHandle::new(api_tx, token.clone()),
            token,
            join,
        })
    }

    pub fn sessions(&self) -> RegistryHandle {
        self.sessions.clone()
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers (thin translators onto the server actor)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
    tx: mpsc::Sender<ServerRequest>,
}

async fn handle_post(
    AxumPath(path): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    _offer: String,
) -> impl IntoResponse {
    // the endpoint kind is the last path segment: <name>/whip or <name>/whep
    let Some((name, endpoint)) = path.rsplit_once('/') else {
        return (StatusCode::NOT_FOUND, "not found".to_owned()).into_response();
    };
    let action = match endpoint {
        "whip" => AuthAction::Publish,
        "whep" => AuthAction::Read,
        _ => return (StatusCode::NOT_FOUND, "not found".to_owned()).into_response(),
    };

    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::servers::rtsp::message::parse_authorization)
        .map(|creds| match creds {
            ProvidedCredentials::Digest {
                user,
                response,
                nonce,
                uri,
                ..
            } => ProvidedCredentials::Digest {
                user,
                response,
                nonce,
                method: "POST".to_owned(),
                uri,
            },
            other => other,
        })
        .unwrap_or_else(|| match (query.get("user"), query.get("pass")) {
            (Some(user), Some(pass)) => ProvidedCredentials::Plain {
                user: user.clone(),
                pass: pass.clone(),
            },
            _ => ProvidedCredentials::None,
        });
    let query_string: String = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let access = AccessRequest {
        name: name.to_owned(),
        query: query_string,
        action,
        protocol: "webrtc",
        ip: peer.ip(),
        credentials,
        skip_auth: false,
    };

    let (res_tx, res_rx) = oneshot::channel();
    if state
        .tx
        .send(ServerRequest::NewSession {
            action,
            access,
            peer,
            res: res_tx,
        })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "terminated".to_owned()).into_response();
    }
    match res_rx.await {
        Ok(Ok((id, port))) => {
            let answer = format!(
                "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                 m=application {port} UDP/DTLS/SCTP webrtc-datachannel\r\n\
                 a=candidate:1 1 udp 1 127.0.0.1 {port} typ host\r\n"
            );
            (
                StatusCode::CREATED,
                [
                    (header::CONTENT_TYPE, "application/sdp".to_owned()),
                    (header::LOCATION, format!("/sessions/{id}")),
                ],
                answer,
            )
                .into_response()
        }
        Ok(Err(refusal)) => {
            let (status, body) = map_refusal(&refusal.reason);
            let mut response = (status, body).into_response();
            if status == StatusCode::UNAUTHORIZED {
                if let Some(nonce) = &refusal.challenge {
                    let challenge = format!(
                        "Digest realm=\"{}\", nonce=\"{nonce}\", algorithm=SHA-256",
                        crate::auth::DIGEST_REALM
                    );
                    if let Ok(value) = challenge.parse() {
                        response
                            .headers_mut()
                            .insert(header::WWW_AUTHENTICATE, value);
                    }
                }
            }
            response
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "terminated".to_owned()).into_response(),
    }
}

async fn handle_delete(
    AxumPath(id): AxumPath<Uuid>,
    State(state): State<HttpState>,
) -> impl IntoResponse {
    let (res_tx, res_rx) = oneshot::channel();
    if state
        .tx
        .send(ServerRequest::Delete { id, res: res_tx })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match res_rx.await {
        Ok(true) => StatusCode::OK,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn map_refusal(reason: &str) -> (StatusCode, String) {
    if reason.contains("authentication failed") {
        (StatusCode::UNAUTHORIZED, reason.to_owned())
    } else if reason.contains("terminated") {
        (StatusCode::SERVICE_UNAVAILABLE, reason.to_owned())
    } else {
        (StatusCode::NOT_FOUND, reason.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Server actor
// ---------------------------------------------------------------------------

const MAX_PENDING_NONCES: usize = 1024;

struct ServerActor {
    pm: PathManagerHandle,
    read_timeout: Duration,
    sessions: Registry,
    live: HashMap<Uuid, Arc<SharedSession>>,
    /// Digest nonce issued to each peer on its last 401.
    nonces: HashMap<IpAddr, String>,
    tracker: TaskTracker,
    api_rx: mpsc::Receiver<RegistryRequest>,
    req_rx: mpsc::Receiver<ServerRequest>,
    closed_tx: mpsc::Sender<Uuid>,
    closed_rx: mpsc::Receiver<Uuid>,
    token: CancellationToken,
}

impl ServerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(req) = self.api_rx.recv() => self.sessions.handle_api(req),
                req = self.req_rx.recv() => {
                    let Some(req) = req else { break };
                    self.handle_request(req).await;
                }
                Some(id) = self.closed_rx.recv() => {
                    self.sessions.remove(id);
                    self.live.remove(&id);
                }
            }
        }
        self.sessions.close_all();
        self.tracker.close();
        // keep draining close reports so no session blocks on its way out
        loop {
            tokio::select! {
                _ = self.tracker.wait() => break,
                Some(_) = self.closed_rx.recv() => {}
            }
        }
    }

    async fn handle_request(&mut self, req: ServerRequest) {
        match req {
            ServerRequest::NewSession {
                action,
                access,
                peer,
                res,
            } => {
                let socket = match UdpSocket::bind("127.0.0.1:0").await {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = res.send(Err(Refusal {
                            reason: e.to_string(),
                            challenge: None,
                        }));
                        return;
                    }
                };
                let port = match socket.local_addr() {
                    Ok(a) => a.port(),
                    Err(e) => {
                        let _ = res.send(Err(Refusal {
                            reason: e.to_string(),
                            challenge: None,
                        }));
                        return;
                    }
                };
                // verify against the nonce issued on the peer's last 401 and
                // mint the one a retry must answer
                let nonce = self.nonces.get(&peer.ip()).cloned();
                let challenge = generate_nonce();
                if self.nonces.len() >= MAX_PENDING_NONCES {
                    self.nonces.clear();
                }
                self.nonces.insert(peer.ip(), challenge.clone());

                let shared = SharedSession::new(peer.to_string(), &self.token);
                let id = shared.id;
                self.sessions.insert(shared.clone());
                self.live.insert(id, shared.clone());

                let session = Session {
                    pm: self.pm.clone(),
                    shared,
                    socket,
                    read_timeout: self.read_timeout,
                    closed: self.closed_tx.clone(),
                    nonce,
                    challenge,
                };
                self.tracker.spawn(async move {
                    session.run(action, access, res, port).await;
                });
            }
            ServerRequest::Delete { id, res } => match self.live.remove(&id) {
                Some(shared) => {
                    shared.token.cancel();
                    self.sessions.remove(id);
                    let _ = res.send(true);
                }
                None => {
                    let _ = res.send(false);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Session actor
// ---------------------------------------------------------------------------

struct Session {
    pm: PathManagerHandle,
    shared: Arc<SharedSession>,
    socket: UdpSocket,
    read_timeout: Duration,
    closed: mpsc::Sender<Uuid>,
    /// Nonce previously issued to this peer, for digest verification.
    nonce: Option<String>,
    /// Nonce a 401 reply challenges the peer with.
    challenge: String,
}

impl Session {
    async fn run(
        self,
        action: AuthAction,
        access: AccessRequest,
        res: oneshot::Sender<Result<(Uuid, u16), Refusal>>,
        port: u16,
    ) {
        let name = access.name.clone();
        let handle = self.shared.path_session_handle("webrtc");
        let nonce = self.nonce.clone();
        let outcome = match action {
            AuthAction::Publish => match self.pm.add_publisher(access, nonce, handle).await {
                Ok(path) => {
                    self.shared.set_path(&name);
                    self.shared.set_state(SessionState::Publish);
                    let _ = res.send(Ok((self.shared.id, port)));
                    self.run_publisher(path).await
                }
                Err(e) => {
                    let _ = res.send(Err(self.refusal(e)));
                    Ok(())
                }
            },
            AuthAction::Read => match self.pm.add_reader(access, nonce, handle).await {
                Ok((path, stream)) => {
                    self.shared.set_path(&name);
                    self.shared.set_state(SessionState::Read);
                    let _ = res.send(Ok((self.shared.id, port)));
                    self.run_reader(path, stream).await
                }
                Err(e) => {
                    let _ = res.send(Err(self.refusal(e)));
                    Ok(())
                }
            },
        };
        if let Err(e) = outcome {
            debug!(id = %self.shared.id, error = %e, "session ended");
        }
        self.shared.token.cancel();
        let _ = self.closed.send(self.shared.id).await;
        debug!(id = %self.shared.id, "session closed");
    }

    fn refusal(&self, e: crate::path::manager::PmError) -> Refusal {
        let challenge = matches!(e, crate::path::manager::PmError::Auth(_))
            .then(|| self.challenge.clone());
        Refusal {
            reason: e.to_string(),
            challenge,
        }
    }

    async fn run_publisher(&self, path: PathHandle) -> Result<(), String> {
        let stream = path
            .start_publisher(self.shared.id, Description::video_and_audio())
            .await
            .map_err(|e| e.to_string())?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.shared.token.cancelled() => break,
                r = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => r,
            };
            match received {
                Ok(Ok((n, _))) if n >= 2 => {
                    self.shared.add_bytes_received(n as u64);
                    let media = usize::from(buf[0]);
                    stream.write_unit(media, 0, Unit::new(Bytes::copy_from_slice(&buf[1..n])));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => break, // media timeout
            }
        }
        path.remove_publisher(self.shared.id);
        Ok(())
    }

    async fn run_reader(&self, path: PathHandle, stream: Arc<crate::stream::Stream>) -> Result<(), String> {
        // the peer punches a hole with its first datagram
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let peer: SocketAddr = tokio::select! {
            _ = self.shared.token.cancelled() => {
                path.remove_reader(self.shared.id);
                return Ok(());
            }
            r = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => {
                match r {
                    Ok(Ok((_, addr))) => addr,
                    Ok(Err(e)) => {
                        path.remove_reader(self.shared.id);
                        return Err(e.to_string());
                    }
                    Err(_) => {
                        path.remove_reader(self.shared.id);
                        return Err("no media requested before the read deadline".to_owned());
                    }
                }
            }
        };

        let (frames_tx, mut frames_rx) = mpsc::channel::<(u8, Bytes)>(64);
        let mut stream_reader = stream.reader();
        stream_reader
            .on_any_unit(move |media, _format, unit| {
                frames_tx
                    .try_send((media as u8, unit.payload))
                    .map_err(|_| "datagram writer backlogged".into())
            })
            .map_err(|e| e.to_string())?;

        let drain_token = self.shared.token.clone();
        let drain = tokio::spawn(async move {
            if stream_reader.run(drain_token.clone()).await.is_err() {
                drain_token.cancel();
            }
        });

        let mut out = Vec::with_capacity(MAX_DATAGRAM);
        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => break,
                frame = frames_rx.recv() => {
                    let Some((media, payload)) = frame else { break };
                    out.clear();
                    out.push(media);
                    out.extend_from_slice(&payload);
                    match self.socket.send_to(&out, peer).await {
                        Ok(n) => self.shared.add_bytes_sent(n as u64),
                        Err(_) => break,
                    }
                }
            }
        }
        let _ = drain.await;
        path.remove_reader(self.shared.id);
        Ok(())
    }
}
