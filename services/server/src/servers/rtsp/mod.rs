//! RTSP front-end (plain and TLS variants).
//!
//! One server actor owns the conn and session registries; each accepted
//! socket gets a connection actor. The wire dialect is the RTSP/1.0 subset
//! in [`message`]: OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD,
//! GET_PARAMETER, TEARDOWN, with TCP-interleaved media frames. Every
//! admission goes through the path manager; media flows through the path's
//! stream.

pub mod message;

use crate::auth::{AccessRequest, AuthAction, ProvidedCredentials, generate_nonce};
use crate::conf::GlobalConf;
use crate::path::manager::{PathManagerHandle, PmError};
use crate::path::{DescribeResult, PathError, PathHandle};
use crate::servers::{
    Registry, RegistryHandle, RegistryRequest, SessionState, SharedSession, Transport,
    spawn_tcp_accept_loop,
};
use crate::stream::Stream;
use bytes::Bytes;
use lg_media::{Description, Unit, sdp};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

type BoxTransport = Box<dyn Transport>;
type SharedWriter = Arc<Mutex<WriteHalf<BoxTransport>>>;

enum ServerEvent {
    RegisterSession(Arc<SharedSession>),
    ConnClosed {
        conn_id: Uuid,
        session_id: Option<Uuid>,
    },
}

/// RTSP (or RTSPS, when constructed with a TLS acceptor) server actor.
pub struct RtspServer {
    conns: RegistryHandle,
    sessions: RegistryHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RtspServer {
    pub async fn new(
        conf: &GlobalConf,
        address: &str,
        tls: Option<TlsAcceptor>,
        pm: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<RtspServer> {
        let label: &'static str = if tls.is_some() { "rtsps" } else { "rtsp" };
        let bind = crate::conf::normalize_listen_addr(address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, protocol = label, "listener opened");

        let token = parent.child_token();
        let (accept_tx, accept_rx) = mpsc::channel(8);
        spawn_tcp_accept_loop(listener, accept_tx, token.clone());

        let (conn_api_tx, conn_api_rx) = mpsc::channel(8);
        let (sess_api_tx, sess_api_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(64);

        let actor = ServerActor {
            label,
            pm,
            tls,
            read_timeout: conf.read_timeout.get(),
            write_timeout: conf.write_timeout.get(),
            conns: Registry::default(),
            sessions: Registry::default(),
            tracker: TaskTracker::new(),
            accept_rx,
            conn_api_rx,
            sess_api_rx,
            events_tx,
            events_rx,
            token: token.clone(),
        };
        let join = tokio::spawn(actor.run());

        Ok(RtspServer {
            conns: RegistryHandle::new(conn_api_tx, token.clone()),
            sessions: RegistryHandle::new(sess_api_tx, token.clone()),
            token,
            join,
        })
    }

    pub fn conns(&self) -> RegistryHandle {
        self.conns.clone()
    }

    pub fn sessions(&self) -> RegistryHandle {
        self.sessions.clone()
    }

    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

struct ServerActor {
    label: &'static str,
    pm: PathManagerHandle,
    tls: Option<TlsAcceptor>,
    read_timeout: Duration,
    write_timeout: Duration,
    conns: Registry,
    sessions: Registry,
    tracker: TaskTracker,
    accept_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    conn_api_rx: mpsc::Receiver<RegistryRequest>,
    sess_api_rx: mpsc::Receiver<RegistryRequest>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: mpsc::Receiver<ServerEvent>,
    token: CancellationToken,
}

impl ServerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.accept_rx.recv() => {
                    let Some((stream, addr)) = accepted else { break };
                    self.accept(stream, addr);
                }
                Some(req) = self.conn_api_rx.recv() => self.conns.handle_api(req),
                Some(req) = self.sess_api_rx.recv() => self.sessions.handle_api(req),
                Some(event) = self.events_rx.recv() => match event {
                    ServerEvent::RegisterSession(session) => self.sessions.insert(session),
                    ServerEvent::ConnClosed { conn_id, session_id } => {
                        self.conns.remove(conn_id);
                        if let Some(id) = session_id {
                            self.sessions.remove(id);
                        }
                    }
                },
            }
        }
        self.conns.close_all();
        self.sessions.close_all();
        self.tracker.close();
        // keep draining close reports so no connection blocks on its way out
        loop {
            tokio::select! {
                _ = self.tracker.wait() => break,
                Some(_) = self.events_rx.recv() => {}
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let shared = SharedSession::new(addr.to_string(), &self.token);
        debug!(id = %shared.id, remote = %addr, protocol = self.label, "connection opened");
        self.conns.insert(shared.clone());

        let conn = Conn {
            label: self.label,
            pm: self.pm.clone(),
            shared,
            events: self.events_tx.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            nonce: None,
            path: None,
            session: None,
            publish_desc: None,
            publish_stream: None,
            read_stream: None,
        };
        let tls = self.tls.clone();
        self.tracker.spawn(async move {
            conn.run(stream, tls).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Connection actor
// ---------------------------------------------------------------------------

struct Conn {
    label: &'static str,
    pm: PathManagerHandle,
    shared: Arc<SharedSession>,
    events: mpsc::Sender<ServerEvent>,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Digest nonce issued on the last 401.
    nonce: Option<String>,
    path: Option<PathHandle>,
    session: Option<Arc<SharedSession>>,
    publish_desc: Option<Description>,
    publish_stream: Option<Arc<Stream>>,
    read_stream: Option<Arc<Stream>>,
}

impl Conn {
    async fn run(mut self, tcp: TcpStream, tls: Option<TlsAcceptor>) {
        let transport: BoxTransport = match tls {
            None => Box::new(tcp),
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(stream) => Box::new(stream),
                Err(e) => {
                    debug!(id = %self.shared.id, error = %e, "TLS handshake failed");
                    self.finish().await;
                    return;
                }
            },
        };
        let (rd, wr) = tokio::io::split(transport);
        let mut reader = BufReader::new(rd);
        let writer: SharedWriter = Arc::new(Mutex::new(wr));

        loop {
            let message = tokio::select! {
                _ = self.shared.token.cancelled() => break,
                _ = session_cancelled(&self.session) => break,
                m = self.read_next(&mut reader) => m,
            };
            let Some(message) = message else { break };
            if !self.handle_message(message, &writer).await {
                break;
            }
        }
        self.finish().await;
    }

    async fn read_next(
        &self,
        reader: &mut BufReader<ReadHalf<BoxTransport>>,
    ) -> Option<message::RtspMessage> {
        // role-less connections must speak up before the read deadline;
        // established readers may stay silent between keepalives
        let result = if self.session.is_none() {
            match tokio::time::timeout(self.read_timeout, message::read_message(reader)).await {
                Ok(r) => r,
                Err(_) => {
                    debug!(id = %self.shared.id, "read deadline expired");
                    return None;
                }
            }
        } else {
            message::read_message(reader).await
        };
        match result {
            Ok((msg, n)) => {
                self.shared.add_bytes_received(n);
                Some(msg)
            }
            Err(e) => {
                debug!(id = %self.shared.id, error = %e, "connection read ended");
                None
            }
        }
    }

    async fn handle_message(
        &mut self,
        msg: message::RtspMessage,
        writer: &SharedWriter,
    ) -> bool {
        match msg {
            message::RtspMessage::Frame { channel, payload } => {
                if let Some(stream) = &self.publish_stream {
                    stream.write_unit(usize::from(channel / 2), 0, Unit::new(payload));
                }
                true
            }
            message::RtspMessage::Request(req) => self.handle_request(req, writer).await,
            message::RtspMessage::Response(_) => {
                // we never issue requests towards clients
                true
            }
        }
    }

    async fn handle_request(&mut self, req: message::Request, writer: &SharedWriter) -> bool {
        let cseq = req.header("CSeq").unwrap_or("0").to_owned();
        match req.method.as_str() {
            "OPTIONS" => {
                let mut res = ok_response(&cseq);
                res.headers.insert(
                    "public".to_owned(),
                    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, GET_PARAMETER, TEARDOWN"
                        .to_owned(),
                );
                self.send(writer, res).await
            }
            "DESCRIBE" => self.handle_describe(&req, &cseq, writer).await,
            "ANNOUNCE" => self.handle_announce(&req, &cseq, writer).await,
            "SETUP" => self.handle_setup(&req, &cseq, writer).await,
            "PLAY" => self.handle_play(&cseq, writer).await,
            "RECORD" => self.handle_record(&cseq, writer).await,
            "GET_PARAMETER" => self.send(writer, ok_response(&cseq)).await,
            "TEARDOWN" => {
                let _ = self.send(writer, ok_response(&cseq)).await;
                false
            }
            other => {
                debug!(method = %other, "unhandled RTSP method");
                self.send(writer, response(405, "Method Not Allowed", &cseq))
                    .await
            }
        }
    }

    async fn handle_describe(
        &mut self,
        req: &message::Request,
        cseq: &str,
        writer: &SharedWriter,
    ) -> bool {
        let Some((path_name, query, _)) = message::parse_uri(&req.uri) else {
            return self.send(writer, response(400, "Bad Request", cseq)).await;
        };
        let access = self.access_request(req, &path_name, &query, AuthAction::Read);
        match self.pm.describe(access, self.nonce.clone()).await {
            Ok(DescribeResult::Stream(stream)) => {
                let body = sdp::marshal(stream.description());
                let mut res = ok_response(cseq);
                res.headers
                    .insert("content-type".to_owned(), "application/sdp".to_owned());
                res.headers
                    .insert("content-base".to_owned(), format!("{}/", req.uri));
                res.body = Bytes::from(body);
                self.send(writer, res).await
            }
            Ok(DescribeResult::Redirect(target)) => {
                let mut res = response(302, "Found", cseq);
                res.headers
                    .insert("location".to_owned(), redirect_location(&req.uri, &target));
                self.send(writer, res).await
            }
            Err(e) => {
                let res = self.error_response(e, cseq);
                self.send(writer, res).await
            }
        }
    }

    async fn handle_announce(
        &mut self,
        req: &message::Request,
        cseq: &str,
        writer: &SharedWriter,
    ) -> bool {
        let Some((path_name, query, _)) = message::parse_uri(&req.uri) else {
            return self.send(writer, response(400, "Bad Request", cseq)).await;
        };
        let body = String::from_utf8_lossy(&req.body);
        let Ok(desc) = sdp::unmarshal(&body) else {
            return self.send(writer, response(400, "Bad Request", cseq)).await;
        };

        let session = self.ensure_session().await;
        let access = self.access_request(req, &path_name, &query, AuthAction::Publish);
        match self
            .pm
            .add_publisher(
                access,
                self.nonce.clone(),
                session.path_session_handle(self.label),
            )
            .await
        {
            Ok(path) => {
                session.set_path(&path_name);
                self.shared.set_path(&path_name);
                self.path = Some(path);
                self.publish_desc = Some(desc);
                self.send(writer, ok_response(cseq)).await
            }
            Err(e) => {
                let res = self.error_response(e, cseq);
                self.send(writer, res).await
            }
        }
    }

    async fn handle_setup(
        &mut self,
        req: &message::Request,
        cseq: &str,
        writer: &SharedWriter,
    ) -> bool {
        let Some((path_name, query, track)) = message::parse_uri(&req.uri) else {
            return self.send(writer, response(400, "Bad Request", cseq)).await;
        };

        // publisher tracks were announced beforehand; nothing to admit
        if self.publish_desc.is_none() && self.read_stream.is_none() {
            let session = self.ensure_session().await;
            let access = self.access_request(req, &path_name, &query, AuthAction::Read);
            match self
                .pm
                .add_reader(
                    access,
                    self.nonce.clone(),
                    session.path_session_handle(self.label),
                )
                .await
            {
                Ok((path, stream)) => {
                    session.set_path(&path_name);
                    self.shared.set_path(&path_name);
                    self.path = Some(path);
                    self.read_stream = Some(stream);
                }
                Err(e) => {
                    let res = self.error_response(e, cseq);
                    return self.send(writer, res).await;
                }
            }
        }

        let session_id = self
            .session
            .as_ref()
            .map(|s| s.id.to_string())
            .unwrap_or_default();
        let channel = track.unwrap_or(0) * 2;
        let mut res = ok_response(cseq);
        res.headers.insert("session".to_owned(), session_id);
        res.headers.insert(
            "transport".to_owned(),
            format!("RTP/AVP/TCP;unicast;interleaved={channel}-{}", channel + 1),
        );
        self.send(writer, res).await
    }

    async fn handle_play(&mut self, cseq: &str, writer: &SharedWriter) -> bool {
        let (Some(stream), Some(session)) = (&self.read_stream, &self.session) else {
            return self
                .send(writer, response(455, "Method Not Valid in This State", cseq))
                .await;
        };

        let (frames_tx, mut frames_rx) = mpsc::channel::<(u8, Bytes)>(64);
        let mut stream_reader = stream.reader();
        let subscribe = stream_reader.on_any_unit(move |media, _format, unit| {
            let channel = (media * 2) as u8;
            frames_tx
                .try_send((channel, unit.payload))
                .map_err(|_| "frame writer backlogged".into())
        });
        if subscribe.is_err() {
            return self
                .send(writer, response(500, "Internal Server Error", cseq))
                .await;
        }

        // writer task: serializes interleaved frames onto the shared socket
        let frame_writer = writer.clone();
        let frame_shared = session.clone();
        let write_timeout = self.write_timeout;
        tokio::spawn(async move {
            while let Some((channel, payload)) = frames_rx.recv().await {
                let buf = message::serialize_frame(channel, &payload);
                let mut wr = frame_writer.lock().await;
                match tokio::time::timeout(write_timeout, wr.write_all(&buf)).await {
                    Ok(Ok(())) => frame_shared.add_bytes_sent(buf.len() as u64),
                    _ => {
                        frame_shared.token.cancel();
                        return;
                    }
                }
            }
        });

        // drain task: a terminal outcome closes the session
        let drain_token = session.token.clone();
        let session_id = session.id;
        let name = self.path.as_ref().map(|p| p.name().to_owned());
        tokio::spawn(async move {
            let outcome = stream_reader.run(drain_token.clone()).await;
            if let Err(e) = outcome {
                debug!(session = %session_id, path = ?name, error = %e, "reader drain ended");
                drain_token.cancel();
            }
        });

        session.set_state(SessionState::Read);
        self.shared.set_state(SessionState::Read);
        self.send(writer, ok_response(cseq)).await
    }

    async fn handle_record(&mut self, cseq: &str, writer: &SharedWriter) -> bool {
        let (Some(path), Some(desc), Some(session)) = (
            self.path.clone(),
            self.publish_desc.clone(),
            self.session.clone(),
        ) else {
            return self
                .send(writer, response(455, "Method Not Valid in This State", cseq))
                .await;
        };
        match path.start_publisher(session.id, desc).await {
            Ok(stream) => {
                self.publish_stream = Some(stream);
                session.set_state(SessionState::Publish);
                self.shared.set_state(SessionState::Publish);
                self.send(writer, ok_response(cseq)).await
            }
            Err(_) => {
                self.send(writer, response(503, "Service Unavailable", cseq))
                    .await
            }
        }
    }

    /// Create and register the per-connection RTSP session on first use.
    async fn ensure_session(&mut self) -> Arc<SharedSession> {
        if let Some(session) = &self.session {
            return session.clone();
        }
        let session = SharedSession::new(self.shared.remote_addr.clone(), &self.shared.token);
        let _ = self
            .events
            .send(ServerEvent::RegisterSession(session.clone()))
            .await;
        self.session = Some(session.clone());
        session
    }

    fn access_request(
        &self,
        req: &message::Request,
        path_name: &str,
        query: &str,
        action: AuthAction,
    ) -> AccessRequest {
        let credentials = req
            .header("Authorization")
            .and_then(message::parse_authorization)
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
                    method: req.method.clone(),
                    uri,
                },
                other => other,
            })
            .unwrap_or(ProvidedCredentials::None);
        let ip = self
            .shared
            .remote_addr
            .parse::<SocketAddr>()
            .map(|a| a.ip())
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        AccessRequest {
            name: path_name.to_owned(),
            query: query.to_owned(),
            action,
            protocol: self.label,
            ip,
            credentials,
            skip_auth: false,
        }
    }

    fn error_response(&mut self, e: PmError, cseq: &str) -> message::Response {
        match e {
            PmError::Auth(_) => {
                let nonce = generate_nonce();
                let mut res = response(401, "Unauthorized", cseq);
                res.headers.insert(
                    "www-authenticate".to_owned(),
                    format!(
                        "Digest realm=\"{}\", nonce=\"{nonce}\", algorithm=SHA-256",
                        crate::auth::DIGEST_REALM
                    ),
                );
                self.nonce = Some(nonce);
                res
            }
            PmError::NotConfigured(_)
            | PmError::InvalidName(_)
            | PmError::Path(PathError::NoOnePublishing(_)) => response(404, "Not Found", cseq),
            PmError::Path(PathError::Busy(_) | PathError::StaticSourceInUse(_)) => {
                response(403, "Forbidden", cseq)
            }
            PmError::Path(PathError::Terminated) | PmError::Terminated => {
                response(503, "Service Unavailable", cseq)
            }
        }
    }

    async fn send(&self, writer: &SharedWriter, res: message::Response) -> bool {
        let buf = message::serialize_response(&res);
        let mut wr = writer.lock().await;
        match tokio::time::timeout(self.write_timeout, wr.write_all(&buf)).await {
            Ok(Ok(())) => {
                self.shared.add_bytes_sent(buf.len() as u64);
                true
            }
            _ => false,
        }
    }

    async fn finish(self) {
        if let Some(path) = &self.path {
            if let Some(session) = &self.session {
                if self.publish_stream.is_some() || self.publish_desc.is_some() {
                    path.remove_publisher(session.id);
                } else {
                    path.remove_reader(session.id);
                }
            }
        }
        if let Some(session) = &self.session {
            session.token.cancel();
        }
        let _ = self
            .events
            .send(ServerEvent::ConnClosed {
                conn_id: self.shared.id,
                session_id: self.session.as_ref().map(|s| s.id),
            })
            .await;
        debug!(id = %self.shared.id, "connection closed");
    }
}

async fn session_cancelled(session: &Option<Arc<SharedSession>>) {
    match session {
        Some(s) => s.token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn ok_response(cseq: &str) -> message::Response {
    response(200, "OK", cseq)
}

fn response(status: u16, reason: &str, cseq: &str) -> message::Response {
    let mut res = message::Response::new(status, reason);
    res.headers.insert("cseq".to_owned(), cseq.to_owned());
    res
}

fn redirect_location(request_uri: &str, target: &str) -> String {
    if target.starts_with("rtsp://") || target.starts_with("rtsps://") {
        return target.to_owned();
    }
    // swap the path component of the requested URI
    if let Some(scheme_end) = request_uri.find("://") {
        if let Some(path_start) = request_uri[scheme_end + 3..].find('/') {
            let base = &request_uri[..scheme_end + 3 + path_start];
            return format!("{base}/{target}");
        }
    }
    format!("/{target}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_location_swaps_path() {
        assert_eq!(
            redirect_location("rtsp://h:8554/cam", "backup"),
            "rtsp://h:8554/backup"
        );
        assert_eq!(
            redirect_location("rtsp://h/cam", "rtsp://other/x"),
            "rtsp://other/x"
        );
    }
}
