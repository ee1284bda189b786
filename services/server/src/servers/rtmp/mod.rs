//! RTMP front-end (plain and TLS variants).
//!
//! Same server-actor skeleton as every other front-end; the wire layer is
//! the compact RTMP subset in [`wire`]. A connection is admitted as a
//! publisher on `publish` and as a reader on `play`; audio/video messages
//! are carried opaquely as stream units (video → media 0, audio → media 1).

pub mod wire;

use crate::auth::{AccessRequest, AuthAction, ProvidedCredentials};
use crate::conf::GlobalConf;
use crate::path::manager::PathManagerHandle;
use crate::path::PathHandle;
use crate::servers::{
    Registry, RegistryHandle, RegistryRequest, SessionState, SharedSession, Transport,
    spawn_tcp_accept_loop,
};
use crate::stream::Stream;
use bytes::Bytes;
use lg_media::{Description, Unit};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;
use wire::{Amf0, MessageReader, RtmpMessage};

type BoxTransport = Box<dyn Transport>;
type SharedWriter = Arc<Mutex<WriteHalf<BoxTransport>>>;

pub struct RtmpServer {
    conns: RegistryHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RtmpServer {
    pub async fn new(
        conf: &GlobalConf,
        address: &str,
        tls: Option<TlsAcceptor>,
        pm: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<RtmpServer> {
        let label: &'static str = if tls.is_some() { "rtmps" } else { "rtmp" };
        let bind = crate::conf::normalize_listen_addr(address);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, protocol = label, "listener opened");

        let token = parent.child_token();
        let (accept_tx, accept_rx) = mpsc::channel(8);
        spawn_tcp_accept_loop(listener, accept_tx, token.clone());
        let (api_tx, api_rx) = mpsc::channel(8);
        let (closed_tx, closed_rx) = mpsc::channel(64);

        let actor = ServerActor {
            label,
            pm,
            tls,
            read_timeout: conf.read_timeout.get(),
            write_timeout: conf.write_timeout.get(),
            conns: Registry::default(),
            tracker: TaskTracker::new(),
            accept_rx,
            api_rx,
            closed_tx,
            closed_rx,
            token: token.clone(),
        };
        let join = tokio::spawn(actor.run());
        Ok(RtmpServer {
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

struct ServerActor {
    label: &'static str,
    pm: PathManagerHandle,
    tls: Option<TlsAcceptor>,
    read_timeout: Duration,
    write_timeout: Duration,
    conns: Registry,
    tracker: TaskTracker,
    accept_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    api_rx: mpsc::Receiver<RegistryRequest>,
    closed_tx: mpsc::Sender<Uuid>,
    closed_rx: mpsc::Receiver<Uuid>,
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
                Some(req) = self.api_rx.recv() => self.conns.handle_api(req),
                Some(id) = self.closed_rx.recv() => self.conns.remove(id),
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

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let shared = SharedSession::new(addr.to_string(), &self.token);
        debug!(id = %shared.id, remote = %addr, protocol = self.label, "connection opened");
        self.conns.insert(shared.clone());

        let conn = Conn {
            label: self.label,
            pm: self.pm.clone(),
            shared,
            closed: self.closed_tx.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            app: String::new(),
            path: None,
            publish_stream: None,
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
    closed: mpsc::Sender<Uuid>,
    read_timeout: Duration,
    write_timeout: Duration,
    app: String,
    path: Option<PathHandle>,
    publish_stream: Option<Arc<Stream>>,
}

impl Conn {
    async fn run(mut self, tcp: TcpStream, tls: Option<TlsAcceptor>) {
        let mut transport: BoxTransport = match tls {
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

        let handshake =
            tokio::time::timeout(self.read_timeout, wire::handshake_server(&mut transport)).await;
        match handshake {
            Ok(Ok((rx, tx))) => {
                self.shared.add_bytes_received(rx);
                self.shared.add_bytes_sent(tx);
            }
            other => {
                debug!(id = %self.shared.id, "RTMP handshake failed: {other:?}");
                self.finish().await;
                return;
            }
        }

        let (rd, wr) = tokio::io::split(transport);
        let mut reader = BufReader::new(rd);
        let writer: SharedWriter = Arc::new(Mutex::new(wr));
        let mut messages = MessageReader::default();

        loop {
            let next = tokio::select! {
                _ = self.shared.token.cancelled() => break,
                m = messages.read_message(&mut reader) => m,
            };
            match next {
                Ok((msg, n)) => {
                    self.shared.add_bytes_received(n);
                    if !self.handle_message(msg, &writer).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(id = %self.shared.id, error = %e, "connection read ended");
                    break;
                }
            }
        }
        self.finish().await;
    }

    async fn handle_message(&mut self, msg: RtmpMessage, writer: &SharedWriter) -> bool {
        match msg.type_id {
            wire::MSG_AUDIO => {
                if let Some(stream) = &self.publish_stream {
                    stream.write_unit(1, 0, Unit::new(msg.payload));
                }
                true
            }
            wire::MSG_VIDEO => {
                if let Some(stream) = &self.publish_stream {
                    stream.write_unit(0, 0, Unit::new(msg.payload));
                }
                true
            }
            wire::MSG_COMMAND_AMF0 => {
                let Ok(values) = wire::amf0_read_all(&msg.payload) else {
                    return false;
                };
                self.handle_command(&values, writer).await
            }
            _ => true,
        }
    }

    async fn handle_command(&mut self, values: &[Amf0], writer: &SharedWriter) -> bool {
        let Some(Amf0::String(command)) = values.first() else {
            return false;
        };
        let tid = match values.get(1) {
            Some(Amf0::Number(n)) => *n,
            _ => 0.0,
        };
        match command.as_str() {
            "connect" => {
                if let Some(Amf0::Object(fields)) = values.get(2) {
                    if let Some((_, Amf0::String(app))) =
                        fields.iter().find(|(k, _)| k == "app")
                    {
                        self.app = app.trim_matches('/').to_owned();
                    }
                }
                let reply = wire::amf0_write(&[
                    Amf0::String("_result".to_owned()),
                    Amf0::Number(tid),
                    Amf0::Object(vec![]),
                    Amf0::Object(vec![(
                        "code".to_owned(),
                        Amf0::String("NetConnection.Connect.Success".to_owned()),
                    )]),
                ]);
                self.send_command(writer, reply).await
            }
            "createStream" => {
                let reply = wire::amf0_write(&[
                    Amf0::String("_result".to_owned()),
                    Amf0::Number(tid),
                    Amf0::Null,
                    Amf0::Number(1.0),
                ]);
                self.send_command(writer, reply).await
            }
            "publish" => {
                let Some(Amf0::String(key)) = values.get(3) else {
                    return false;
                };
                self.handle_publish(key, tid, writer).await
            }
            "play" => {
                let Some(Amf0::String(key)) = values.get(3) else {
                    return false;
                };
                self.handle_play(key, tid, writer).await
            }
            "deleteStream" | "closeStream" => false,
            _ => true,
        }
    }

    async fn handle_publish(&mut self, key: &str, tid: f64, writer: &SharedWriter) -> bool {
        let (name, query) = split_key(&self.app, key);
        let access = self.access_request(&name, &query, AuthAction::Publish);
        let session = self.shared.path_session_handle(self.label);
        let path = match self.pm.add_publisher(access, None, session).await {
            Ok(path) => path,
            Err(e) => {
                debug!(id = %self.shared.id, path = %name, error = %e, "publish refused");
                let status = status_command("onStatus", tid, "NetStream.Publish.BadName");
                let _ = self.send_command(writer, status).await;
                return false;
            }
        };
        match path
            .start_publisher(self.shared.id, Description::video_and_audio())
            .await
        {
            Ok(stream) => {
                self.publish_stream = Some(stream);
                self.path = Some(path);
                self.shared.set_path(&name);
                self.shared.set_state(SessionState::Publish);
                let status = status_command("onStatus", tid, "NetStream.Publish.Start");
                self.send_command(writer, status).await
            }
            Err(_) => false,
        }
    }

    async fn handle_play(&mut self, key: &str, tid: f64, writer: &SharedWriter) -> bool {
        let (name, query) = split_key(&self.app, key);
        let access = self.access_request(&name, &query, AuthAction::Read);
        let session = self.shared.path_session_handle(self.label);
        let (path, stream) = match self.pm.add_reader(access, None, session).await {
            Ok(ok) => ok,
            Err(e) => {
                debug!(id = %self.shared.id, path = %name, error = %e, "play refused");
                let status = status_command("onStatus", tid, "NetStream.Play.StreamNotFound");
                let _ = self.send_command(writer, status).await;
                return false;
            }
        };
        self.path = Some(path);
        self.shared.set_path(&name);

        let (frames_tx, mut frames_rx) = mpsc::channel::<(u8, Bytes)>(64);
        let mut stream_reader = stream.reader();
        let subscribe = stream_reader.on_any_unit(move |media, _format, unit| {
            let type_id = if media == 1 {
                wire::MSG_AUDIO
            } else {
                wire::MSG_VIDEO
            };
            frames_tx
                .try_send((type_id, unit.payload))
                .map_err(|_| "frame writer backlogged".into())
        });
        if subscribe.is_err() {
            return false;
        }

        let frame_writer = writer.clone();
        let frame_shared = self.shared.clone();
        let write_timeout = self.write_timeout;
        tokio::spawn(async move {
            while let Some((type_id, payload)) = frames_rx.recv().await {
                let msg = RtmpMessage {
                    type_id,
                    stream_id: 1,
                    payload,
                };
                let buf = wire::serialize_message(4, &msg);
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

        let drain_token = self.shared.token.clone();
        tokio::spawn(async move {
            if stream_reader.run(drain_token.clone()).await.is_err() {
                drain_token.cancel();
            }
        });

        self.shared.set_state(SessionState::Read);
        let status = status_command("onStatus", tid, "NetStream.Play.Start");
        self.send_command(writer, status).await
    }

    fn access_request(&self, name: &str, query: &str, action: AuthAction) -> AccessRequest {
        let ip = self
            .shared
            .remote_addr
            .parse::<SocketAddr>()
            .map(|a| a.ip())
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        AccessRequest {
            name: name.to_owned(),
            query: query.to_owned(),
            action,
            protocol: self.label,
            ip,
            credentials: credentials_from_query(query),
            skip_auth: false,
        }
    }

    async fn send_command(&self, writer: &SharedWriter, payload: Vec<u8>) -> bool {
        let msg = RtmpMessage {
            type_id: wire::MSG_COMMAND_AMF0,
            stream_id: 0,
            payload: Bytes::from(payload),
        };
        let buf = wire::serialize_message(3, &msg);
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
            if self.publish_stream.is_some() {
                path.remove_publisher(self.shared.id);
            } else {
                path.remove_reader(self.shared.id);
            }
        }
        self.shared.token.cancel();
        let _ = self.closed.send(self.shared.id).await;
        debug!(id = %self.shared.id, "connection closed");
    }
}

/// Join app and stream key into a path name, splitting off the query.
fn split_key(app: &str, key: &str) -> (String, String) {
    let (key, query) = match key.split_once('?') {
        Some((k, q)) => (k, q.to_owned()),
        None => (key, String::new()),
    };
    let key = key.trim_matches('/');
    let name = if app.is_empty() {
        key.to_owned()
    } else if key.is_empty() {
        app.to_owned()
    } else {
        format!("{app}/{key}")
    };
    (name, query)
}

/// RTMP carries credentials in the stream-key query string.
fn credentials_from_query(query: &str) -> ProvidedCredentials {
    let mut user = None;
    let mut pass = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("user", v)) => user = Some(v.to_owned()),
            Some(("pass", v)) => pass = Some(v.to_owned()),
            _ => {}
        }
    }
    match (user, pass) {
        (Some(user), Some(pass)) => ProvidedCredentials::Plain { user, pass },
        _ => ProvidedCredentials::None,
    }
}

fn status_command(name: &str, tid: f64, code: &str) -> Vec<u8> {
    wire::amf0_write(&[
        Amf0::String(name.to_owned()),
        Amf0::Number(tid),
        Amf0::Null,
        Amf0::Object(vec![(
            "code".to_owned(),
            Amf0::String(code.to_owned()),
        )]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_splitting_joins_app_and_key() {
        assert_eq!(
            split_key("live", "cam1"),
            ("live/cam1".to_owned(), String::new())
        );
        assert_eq!(split_key("", "cam1"), ("cam1".to_owned(), String::new()));
        assert_eq!(split_key("live", ""), ("live".to_owned(), String::new()));
        assert_eq!(
            split_key("live", "cam1?user=u&pass=p"),
            ("live/cam1".to_owned(), "user=u&pass=p".to_owned())
        );
    }

    #[test]
    fn query_credentials() {
        match credentials_from_query("user=u&pass=p") {
            ProvidedCredentials::Plain { user, pass } => {
                assert_eq!(user, "u");
                assert_eq!(pass, "p");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            credentials_from_query("user=u"),
            ProvidedCredentials::None
        ));
    }
}
