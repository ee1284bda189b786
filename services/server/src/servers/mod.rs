//! Protocol front-ends.
//!
//! Every front-end follows the same skeleton: one server actor owns the
//! accept listener, the registry of per-connection actors and the API
//! request channels; a sibling accept task performs blocking accepts and
//! forwards sockets over a channel (one error, then exit). Only the wire
//! layer differs between protocols. The shared pieces live here.

pub mod hls;
pub mod rtmp;
pub mod rtsp;
pub mod srt;
pub mod webrtc;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Role of a connection or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Read,
    Publish,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            1 => SessionState::Read,
            2 => SessionState::Publish,
            _ => SessionState::Idle,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Read => 1,
            SessionState::Publish => 2,
        }
    }
}

/// API view of one connection or session, uniform across protocols.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub state: SessionState,
    pub path: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// State shared between a connection task and its registry entry.
///
/// The connection mutates it from its own task; the server actor only reads
/// snapshots, so plain atomics are enough.
pub struct SharedSession {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub token: CancellationToken,
    state: AtomicU8,
    path: std::sync::Mutex<Option<String>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl SharedSession {
    pub fn new(remote_addr: String, parent: &CancellationToken) -> Arc<SharedSession> {
        Arc::new(SharedSession {
            id: Uuid::new_v4(),
            created: Utc::now(),
            remote_addr,
            token: parent.child_token(),
            state: AtomicU8::new(SessionState::Idle.to_u8()),
            path: std::sync::Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    pub fn set_path(&self, path: &str) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.to_owned());
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> ApiSession {
        ApiSession {
            id: self.id,
            created: self.created,
            remote_addr: self.remote_addr.clone(),
            state: self.state(),
            path: self.path.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Weak back-reference for the path layer.
    pub fn path_session_handle(&self, protocol: &'static str) -> crate::path::SessionHandle {
        crate::path::SessionHandle::new(self.id, protocol, self.token.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Requests the API sends to a server actor about its registry.
pub enum RegistryRequest {
    List {
        res: oneshot::Sender<Vec<ApiSession>>,
    },
    Get {
        id: Uuid,
        res: oneshot::Sender<Option<ApiSession>>,
    },
    Kick {
        id: Uuid,
        res: oneshot::Sender<bool>,
    },
}

/// The narrow capability the API and metrics need from any server.
///
/// Absence of a server is modeled as `Option<RegistryHandle>` at the
/// call sites; `None` maps to not-found.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryRequest>,
    token: CancellationToken,
}

impl RegistryHandle {
    pub fn new(tx: mpsc::Sender<RegistryRequest>, token: CancellationToken) -> Self {
        RegistryHandle { tx, token }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryRequest,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            _ = self.token.cancelled() => return None,
            sent = self.tx.send(build(tx)) => sent.ok()?,
        }
        rx.await.ok()
    }

    /// Snapshot of the registry, sorted by creation time.
    pub async fn list(&self) -> Vec<ApiSession> {
        self.request(|res| RegistryRequest::List { res })
            .await
            .unwrap_or_default()
    }

    pub async fn get(&self, id: Uuid) -> Option<ApiSession> {
        self.request(|res| RegistryRequest::Get { id, res }).await?
    }

    /// Remove and close a session. By the time this returns true, the entry
    /// is gone from the registry; socket teardown may still be in flight.
    pub async fn kick(&self, id: Uuid) -> bool {
        self.request(|res| RegistryRequest::Kick { id, res })
            .await
            .unwrap_or(false)
    }
}

/// Per-server map of live sessions. Owned by exactly one server actor.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<Uuid, Arc<SharedSession>>,
}

impl Registry {
    pub fn insert(&mut self, session: Arc<SharedSession>) {
        self.entries.insert(session.id, session);
    }

    pub fn remove(&mut self, id: Uuid) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn close_all(&mut self) {
        for session in self.entries.values() {
            session.token.cancel();
        }
        self.entries.clear();
    }

    pub fn handle_api(&mut self, req: RegistryRequest) {
        match req {
            RegistryRequest::List { res } => {
                let mut items: Vec<ApiSession> =
                    self.entries.values().map(|s| s.snapshot()).collect();
                items.sort_by_key(|s| s.created);
                let _ = res.send(items);
            }
            RegistryRequest::Get { id, res } => {
                let _ = res.send(self.entries.get(&id).map(|s| s.snapshot()));
            }
            RegistryRequest::Kick { id, res } => match self.entries.remove(&id) {
                Some(session) => {
                    debug!(id = %id, "session kicked");
                    session.token.cancel();
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
// Accept loop
// ---------------------------------------------------------------------------

/// Spawn the sibling accept task: blocking accepts forwarded over a channel;
/// on error it reports once and exits.
pub fn spawn_tcp_accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => {
                        if tx.send(pair).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, stopping accept loop");
                        return;
                    }
                }
            }
        }
    })
}

/// Transport object a connection actor drives: any bidirectional byte
/// stream (plain TCP or TLS).
pub trait Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Transport for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kick_removes_exactly_once_then_not_found() {
        let token = CancellationToken::new();
        let mut registry = Registry::default();
        let session = SharedSession::new("1.2.3.4:5".to_owned(), &token);
        let id = session.id;
        registry.insert(session.clone());

        let (res, rx) = oneshot::channel();
        registry.handle_api(RegistryRequest::Kick { id, res });
        assert!(rx.await.unwrap());
        assert!(session.token.is_cancelled());

        let (res, rx) = oneshot::channel();
        registry.handle_api(RegistryRequest::Kick { id, res });
        assert!(!rx.await.unwrap());

        let (res, rx) = oneshot::channel();
        registry.handle_api(RegistryRequest::Get { id, res });
        assert!(rx.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_by_creation_time() {
        let token = CancellationToken::new();
        let mut registry = Registry::default();
        for i in 0..3 {
            let s = SharedSession::new(format!("10.0.0.{i}:1"), &token);
            registry.insert(s);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let (res, rx) = oneshot::channel();
        registry.handle_api(RegistryRequest::List { res });
        let items = rx.await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.windows(2).all(|w| w[0].created <= w[1].created));
    }

    #[test]
    fn shared_session_tracks_state_and_bytes() {
        let token = CancellationToken::new();
        let s = SharedSession::new("1.1.1.1:1".to_owned(), &token);
        assert_eq!(s.state(), SessionState::Idle);
        s.set_state(SessionState::Publish);
        s.set_path("cam");
        s.add_bytes_received(10);
        s.add_bytes_sent(4);
        let snap = s.snapshot();
        assert_eq!(snap.state, SessionState::Publish);
        assert_eq!(snap.path.as_deref(), Some("cam"));
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.bytes_sent, 4);
    }
}
