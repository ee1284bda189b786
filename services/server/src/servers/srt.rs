//! SRT front-end.
//!
//! Datagram transport with the conventional SRT stream-id grammar
//! (`#!::r=<path>,m=<publish|request>,...`). The transport layer is the
//! library seam: a connection is opened by a handshake datagram carrying the
//! stream id and answered with `OK`/`ERR`; media payloads follow prefixed
//! with their media index. The session registry, admission and teardown are
//! the same skeleton as every other front-end.

use crate::auth::{AccessRequest, AuthAction, ProvidedCredentials};
use crate::conf::GlobalConf;
use crate::path::PathHandle;
use crate::path::manager::PathManagerHandle;
use crate::servers::{
    Registry, RegistryHandle, RegistryRequest, SessionState, SharedSession,
};
use bytes::Bytes;
use lg_media::{Description, Unit};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HANDSHAKE_PREFIX: &str = "SRT1 ";
const MAX_DATAGRAM: usize = 1500;

pub struct SrtServer {
    conns: RegistryHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SrtServer {
    pub async fn new(
        conf: &GlobalConf,
        pm: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<SrtServer> {
        let bind = crate::conf::normalize_listen_addr(&conf.srt_address);
        let socket = Arc::new(UdpSocket::bind(&bind).await?);
        info!(address = %bind, protocol = "srt", "listener opened");

        let token = parent.child_token();
        let (datagram_tx, datagram_rx) = mpsc::channel::<(SocketAddr, Bytes)>(64);

        // sibling receive loop: one error, then exit
        let recv_socket = socket.clone();
        let recv_token = token.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = recv_token.cancelled() => return,
                    received = recv_socket.recv_from(&mut buf) => match received {
                        Ok((n, addr)) => {
                            let payload = Bytes::copy_from_slice(&buf[..n]);
                            if datagram_tx.send((addr, payload)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "SRT receive failed, stopping receive loop");
                            return;
                        }
                    }
                }
            }
        });

        let (api_tx, api_rx) = mpsc::channel(8);
        let (closed_tx, closed_rx) = mpsc::channel(64);
        let actor = ServerActor {
            pm,
            socket,
            read_timeout: conf.read_timeout.get(),
            conns: Registry::default(),
            by_addr: HashMap::new(),
            tracker: TaskTracker::new(),
            datagram_rx,
            api_rx,
            closed_tx,
            closed_rx,
            token: token.clone(),
        };
        let join = tokio::spawn(actor.run());
        Ok(SrtServer {
            conns: RegistryHandle::new(api_tx, token.clone()),
            token,
            join,
        })
    }

    pub fn conns(&self) -> RegistryHandle {
        self.conns.clone()
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

struct ConnSlot {
    id: Uuid,
    tx: mpsc::Sender<Bytes>,
}

struct ServerActor {
    pm: PathManagerHandle,
    socket: Arc<UdpSocket>,
    read_timeout: Duration,
    conns: Registry,
    by_addr: HashMap<SocketAddr, ConnSlot>,
    tracker: TaskTracker,
    datagram_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    api_rx: mpsc::Receiver<RegistryRequest>,
    closed_tx: mpsc::Sender<(Uuid, SocketAddr)>,
    closed_rx: mpsc::Receiver<(Uuid, SocketAddr)>,
    token: CancellationToken,
}

impl ServerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                datagram = self.datagram_rx.recv() => {
                    let Some((addr, payload)) = datagram else { break };
                    self.dispatch(addr, payload).await;
                }
                Some(req) = self.api_rx.recv() => self.conns.handle_api(req),
                Some((id, addr)) = self.closed_rx.recv() => {
                    self.conns.remove(id);
                    if self.by_addr.get(&addr).is_some_and(|slot| slot.id == id) {
                        self.by_addr.remove(&addr);
                    }
                }
            }
        }
        self.conns.close_all();
        self.tracker.close();
        // keep draining close reports so no connection blocks on its way out
        loop {
            tokio::select! {
                _ = self.tracker.wait() => break,
                Some(_) = self.closed_rx.recv() => {}
            }
        }
    }

    async fn dispatch(&mut self, addr: SocketAddr, payload: Bytes) {
        if let Some(slot) = self.by_addr.get(&addr) {
            // per-conn queue; a stalled conn drops datagrams, not the server
            let _ = slot.tx.try_send(payload);
            return;
        }

        let Ok(text) = std::str::from_utf8(&payload) else {
            return;
        };
        let Some(streamid) = text.strip_prefix(HANDSHAKE_PREFIX) else {
            return;
        };
        let Some(streamid) = parse_stream_id(streamid.trim_end()) else {
            let _ = self.socket.send_to(b"ERR invalid stream id", addr).await;
            return;
        };

        let shared = SharedSession::new(addr.to_string(), &self.token);
        debug!(id = %shared.id, remote = %addr, protocol = "srt", "connection opened");
        self.conns.insert(shared.clone());
        let (tx, rx) = mpsc::channel(64);
        self.by_addr.insert(
            addr,
            ConnSlot {
                id: shared.id,
                tx,
            },
        );

        let conn = Conn {
            pm: self.pm.clone(),
            socket: self.socket.clone(),
            shared,
            addr,
            read_timeout: self.read_timeout,
            closed: self.closed_tx.clone(),
        };
        self.tracker.spawn(async move {
            conn.run(streamid, rx).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Stream id grammar
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct StreamId {
    action: AuthAction,
    path: String,
    query: String,
    user: String,
    pass: String,
}

fn parse_stream_id(s: &str) -> Option<StreamId> {
    let rest = s.strip_prefix("#!::")?;
    let mut path = String::new();
    let mut mode = String::new();
    let mut query = String::new();
    let mut user = String::new();
    let mut pass = String::new();
    for pair in rest.split(',') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "r" => path = value.to_owned(),
            "m" => mode = value.to_owned(),
            "q" => query = value.to_owned(),
            "u" => user = value.to_owned(),
            "s" => pass = value.to_owned(),
            _ => {}
        }
    }
    if path.is_empty() {
        return None;
    }
    let action = match mode.as_str() {
        "publish" => AuthAction::Publish,
        "request" | "" => AuthAction::Read,
        _ => return None,
    };
    Some(StreamId {
        action,
        path,
        query,
        user,
        pass,
    })
}

// ---------------------------------------------------------------------------
// Connection actor
// ---------------------------------------------------------------------------

struct Conn {
    pm: PathManagerHandle,
    socket: Arc<UdpSocket>,
    shared: Arc<SharedSession>,
    addr: SocketAddr,
    read_timeout: Duration,
    closed: mpsc::Sender<(Uuid, SocketAddr)>,
}

impl Conn {
    async fn run(self, streamid: StreamId, mut rx: mpsc::Receiver<Bytes>) {
        let credentials = if streamid.user.is_empty() {
            ProvidedCredentials::None
        } else {
            ProvidedCredentials::Plain {
                user: streamid.user.clone(),
                pass: streamid.pass.clone(),
            }
        };
        let access = AccessRequest {
            name: streamid.path.clone(),
            query: streamid.query.clone(),
            action: streamid.action,
            protocol: "srt",
            ip: self.addr.ip(),
            credentials,
            skip_auth: false,
        };
        let session = self.shared.path_session_handle("srt");

        let outcome = match streamid.action {
            AuthAction::Publish => self.run_publisher(access, session, &mut rx).await,
            AuthAction::Read => self.run_reader(access, session, &mut rx).await,
        };
        if let Err(reason) = outcome {
            debug!(id = %self.shared.id, reason = %reason, "SRT admission refused");
            let _ = self
                .socket
                .send_to(format!("ERR {reason}").as_bytes(), self.addr)
                .await;
        }
        self.shared.token.cancel();
        let _ = self.closed.send((self.shared.id, self.addr)).await;
        debug!(id = %self.shared.id, "connection closed");
    }

    async fn run_publisher(
        &self,
        access: AccessRequest,
        session: crate::path::SessionHandle,
        rx: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), String> {
        let name = access.name.clone();
        let path: PathHandle = self
            .pm
            .add_publisher(access, None, session)
            .await
            .map_err(|e| e.to_string())?;
        let stream = path
            .start_publisher(self.shared.id, Description::video_and_audio())
            .await
            .map_err(|e| e.to_string())?;
        self.shared.set_path(&name);
        self.shared.set_state(SessionState::Publish);
        let _ = self.socket.send_to(b"OK", self.addr).await;
        self.shared.add_bytes_sent(2);

        loop {
            let datagram = tokio::select! {
                _ = self.shared.token.cancelled() => break,
                d = tokio::time::timeout(self.read_timeout, rx.recv()) => match d {
                    Ok(Some(d)) => d,
                    Ok(None) => break,
                    Err(_) => {
                        debug!(id = %self.shared.id, "SRT publisher timed out");
                        break;
                    }
                },
            };
            self.shared.add_bytes_received(datagram.len() as u64);
            if datagram.len() < 2 {
                continue;
            }
            let media = usize::from(datagram[0]);
            stream.write_unit(media, 0, Unit::new(datagram.slice(1..)));
        }
        path.remove_publisher(self.shared.id);
        Ok(())
    }

    async fn run_reader(
        &self,
        access: AccessRequest,
        session: crate::path::SessionHandle,
        rx: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), String> {
        let name = access.name.clone();
        let (path, stream) = self
            .pm
            .add_reader(access, None, session)
            .await
            .map_err(|e| e.to_string())?;
        self.shared.set_path(&name);
        self.shared.set_state(SessionState::Read);
        let _ = self.socket.send_to(b"OK", self.addr).await;
        self.shared.add_bytes_sent(2);

        let (frames_tx, mut frames_rx) = mpsc::channel::<(u8, Bytes)>(64);
        let mut stream_reader = stream.reader();
        stream_reader
            .on_any_unit(move |media, _format, unit| {
                frames_tx
                    .try_send((media as u8, unit.payload))
                    .map_err(|_| "datagram writer backlogged".into())
            })
            .map_err(|e| e.to_string())?;

        let socket = self.socket.clone();
        let addr = self.addr;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = Vec::with_capacity(MAX_DATAGRAM);
            while let Some((media, payload)) = frames_rx.recv().await {
                buf.clear();
                buf.push(media);
                buf.extend_from_slice(&payload);
                match socket.send_to(&buf, addr).await {
                    Ok(n) => shared.add_bytes_sent(n as u64),
                    Err(_) => {
                        shared.token.cancel();
                        return;
                    }
                }
            }
        });

        let drain_token = self.shared.token.clone();
        let drain = tokio::spawn(async move {
            if stream_reader.run(drain_token.clone()).await.is_err() {
                drain_token.cancel();
            }
        });

        // consume keepalives until the session ends
        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => break,
                d = rx.recv() => match d {
                    Some(d) => self.shared.add_bytes_received(d.len() as u64),
                    None => break,
                },
            }
        }
        let _ = drain.await;
        path.remove_reader(self.shared.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_grammar() {
        let id = parse_stream_id("#!::r=live/cam,m=publish,u=admin,s=pw,q=a=b").unwrap();
        assert_eq!(id.action, AuthAction::Publish);
        assert_eq!(id.path, "live/cam");
        assert_eq!(id.user, "admin");
        assert_eq!(id.pass, "pw");
        assert_eq!(id.query, "a=b");

        let id = parse_stream_id("#!::r=cam").unwrap();
        assert_eq!(id.action, AuthAction::Read);

        assert!(parse_stream_id("#!::m=publish").is_none());
        assert!(parse_stream_id("#!::r=cam,m=sideways").is_none());
        assert!(parse_stream_id("r=cam").is_none());
    }
}
