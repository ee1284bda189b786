//! Per-path state machine.
//!
//! A `Path` is an actor owning the stream, the source (publisher, static
//! pull, or on-demand command) and the weak back-references to its readers.
//! All mutation happens inside [`PathActor::run`]; callers interact through
//! [`PathHandle`] request/reply messages. Readiness always traverses
//! not-ready → ready → not-ready, and every ready→not-ready edge evicts the
//! readers attached to the dying stream.

pub mod manager;
pub mod source;

use crate::conf::PathConf;
use crate::externalcmd::{Cmd, CmdPool};
use crate::stream::Stream;
use chrono::{DateTime, Utc};
use lg_media::Description;
use source::StaticSource;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Weak back-reference to a protocol session: stable id plus the session's
/// cancellation scope. Closing the handle cancels the session; ownership
/// stays with the protocol server.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub protocol: &'static str,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: Uuid, protocol: &'static str, token: CancellationToken) -> Self {
        SessionHandle {
            id,
            protocol,
            token,
        }
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("no one is publishing to path '{0}'")]
    NoOnePublishing(String),
    #[error("another client is already publishing to path '{0}'")]
    Busy(String),
    #[error("path '{0}' is assigned to a static source")]
    StaticSourceInUse(String),
    #[error("terminated")]
    Terminated,
}

/// Reply to a DESCRIBE-style admission.
pub enum DescribeResult {
    Stream(Arc<Stream>),
    Redirect(String),
}

/// Global knobs a path needs besides its own configuration.
#[derive(Debug, Clone)]
pub struct PathGlobals {
    pub write_queue_size: usize,
    pub rtsp_port: u16,
}

/// API view of a source or reader attached to a path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiPathSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// API view of one path.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPath {
    pub name: String,
    pub conf_name: String,
    pub source: Option<ApiPathSource>,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub tracks: Vec<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub readers: Vec<ApiPathSource>,
}

// ---------------------------------------------------------------------------
// Actor protocol
// ---------------------------------------------------------------------------

pub(crate) enum PathRequest {
    Describe {
        res: oneshot::Sender<Result<DescribeResult, PathError>>,
    },
    AddPublisher {
        session: SessionHandle,
        res: oneshot::Sender<Result<(), PathError>>,
    },
    StartPublisher {
        session_id: Uuid,
        desc: Description,
        res: oneshot::Sender<Result<Arc<Stream>, PathError>>,
    },
    StopPublisher {
        session_id: Uuid,
    },
    RemovePublisher {
        session_id: Uuid,
    },
    AddReader {
        session: SessionHandle,
        res: oneshot::Sender<Result<Arc<Stream>, PathError>>,
    },
    RemoveReader {
        session_id: Uuid,
    },
    SourceReady {
        desc: Description,
        res: oneshot::Sender<Result<Arc<Stream>, PathError>>,
    },
    SourceNotReady,
    HotUpdate {
        conf_name: String,
        conf: Box<PathConf>,
    },
    ApiInfo {
        res: oneshot::Sender<ApiPath>,
    },
}

/// Events a path reports to its manager.
pub(crate) enum PathEvent {
    Ready { name: String },
    NotReady { name: String },
    Closed { name: String, path_id: Uuid },
}

/// Cloneable handle to a path actor.
#[derive(Clone, Debug)]
pub struct PathHandle {
    name: Arc<str>,
    pub(crate) path_id: Uuid,
    tx: mpsc::Sender<PathRequest>,
    pub(crate) token: CancellationToken,
}

impl PathHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PathRequest,
    ) -> Result<T, PathError> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            _ = self.token.cancelled() => return Err(PathError::Terminated),
            sent = self.tx.send(build(tx)) => {
                sent.map_err(|_| PathError::Terminated)?;
            }
        }
        rx.await.map_err(|_| PathError::Terminated)
    }

    fn notify(&self, req: PathRequest) {
        let _ = self.tx.try_send(req);
    }

    pub(crate) async fn describe(&self) -> Result<DescribeResult, PathError> {
        self.request(|res| PathRequest::Describe { res }).await?
    }

    pub(crate) async fn add_publisher(&self, session: SessionHandle) -> Result<(), PathError> {
        self.request(|res| PathRequest::AddPublisher { session, res })
            .await?
    }

    pub(crate) async fn add_reader(
        &self,
        session: SessionHandle,
    ) -> Result<Arc<Stream>, PathError> {
        self.request(|res| PathRequest::AddReader { session, res })
            .await?
    }

    /// Attach the media description and switch the path to ready. Only valid
    /// from the currently-admitted publisher session.
    pub async fn start_publisher(
        &self,
        session_id: Uuid,
        desc: Description,
    ) -> Result<Arc<Stream>, PathError> {
        self.request(|res| PathRequest::StartPublisher {
            session_id,
            desc,
            res,
        })
        .await?
    }

    pub fn stop_publisher(&self, session_id: Uuid) {
        self.notify(PathRequest::StopPublisher { session_id });
    }

    pub fn remove_publisher(&self, session_id: Uuid) {
        self.notify(PathRequest::RemovePublisher { session_id });
    }

    pub fn remove_reader(&self, session_id: Uuid) {
        self.notify(PathRequest::RemoveReader { session_id });
    }

    pub(crate) async fn source_ready(&self, desc: Description) -> Result<Arc<Stream>, PathError> {
        self.request(|res| PathRequest::SourceReady { desc, res })
            .await?
    }

    pub(crate) fn source_not_ready(&self) {
        self.notify(PathRequest::SourceNotReady);
    }

    pub(crate) async fn api_info(&self) -> Result<ApiPath, PathError> {
        self.request(|res| PathRequest::ApiInfo { res }).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum SourceState {
    None,
    Publisher(SessionHandle),
    Static,
}

/// On-demand source sub-state. The set is exhaustive; timers belong to the
/// states that wait.
enum OnDemand {
    Idle,
    Starting { deadline: Instant },
    Ready,
    Draining { deadline: Instant },
    Retrying { deadline: Instant },
}

enum Pending {
    Describe {
        res: oneshot::Sender<Result<DescribeResult, PathError>>,
    },
    Reader {
        session: SessionHandle,
        res: oneshot::Sender<Result<Arc<Stream>, PathError>>,
    },
}

pub(crate) struct PathActor {
    name: String,
    path_id: Uuid,
    conf_name: String,
    conf: PathConf,
    /// Submatches captured by a regex-bound configuration; `$G1`..`$Gn` in
    /// the source URL and hook command lines expand to them.
    matches: Vec<String>,
    dynamic: bool,
    globals: PathGlobals,

    source: SourceState,
    stream: Option<Arc<Stream>>,
    ready_time: Option<DateTime<Utc>>,
    readers: HashMap<Uuid, SessionHandle>,
    pending: Vec<Pending>,
    on_demand: OnDemand,

    static_source: Option<StaticSource>,
    on_init_cmd: Option<Cmd>,
    on_demand_cmd: Option<Cmd>,
    on_ready_cmd: Option<Cmd>,
    on_read_cmds: HashMap<Uuid, Cmd>,
    cmd_pool: Arc<CmdPool>,

    events: mpsc::UnboundedSender<PathEvent>,
    rx: mpsc::Receiver<PathRequest>,
    /// Clone of our own mailbox sender, handed to the static source.
    tx_self: mpsc::Sender<PathRequest>,
    token: CancellationToken,
}

pub(crate) struct PathSpawn {
    pub handle: PathHandle,
    pub join: tokio::task::JoinHandle<()>,
}

impl PathActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        name: String,
        conf_name: String,
        conf: PathConf,
        matches: Vec<String>,
        dynamic: bool,
        globals: PathGlobals,
        cmd_pool: Arc<CmdPool>,
        events: mpsc::UnboundedSender<PathEvent>,
        parent: &CancellationToken,
    ) -> PathSpawn {
        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(64);
        let path_id = Uuid::new_v4();
        let handle = PathHandle {
            name: Arc::from(name.as_str()),
            path_id,
            tx: tx.clone(),
            token: token.clone(),
        };
        let conf = expand_matches(conf, &matches);
        let actor = PathActor {
            name,
            path_id,
            conf_name,
            conf,
            matches,
            dynamic,
            globals,
            source: SourceState::None,
            stream: None,
            ready_time: None,
            readers: HashMap::new(),
            pending: Vec::new(),
            on_demand: OnDemand::Idle,
            static_source: None,
            on_init_cmd: None,
            on_demand_cmd: None,
            on_ready_cmd: None,
            on_read_cmds: HashMap::new(),
            cmd_pool,
            events,
            rx,
            tx_self: tx,
            token,
        };
        let join = tokio::spawn(actor.run());
        PathSpawn { handle, join }
    }

    fn hook_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("RTSP_PORT".to_owned(), self.globals.rtsp_port.to_string());
        env.insert("MTX_PATH".to_owned(), self.name.clone());
        env
    }

    async fn run(mut self) {
        info!(path = %self.name, conf = %self.conf_name, "path created");

        if !self.conf.run_on_init.is_empty() {
            self.on_init_cmd = Some(Cmd::new(
                &self.cmd_pool,
                &self.conf.run_on_init,
                self.conf.run_on_init_restart,
                self.hook_env(),
                None,
            ));
        }
        // an eager static source starts with the path
        if self.conf.has_static_source() && !self.conf.source_on_demand {
            self.start_static_source();
        }

        loop {
            let deadline = match &self.on_demand {
                OnDemand::Starting { deadline }
                | OnDemand::Draining { deadline }
                | OnDemand::Retrying { deadline } => Some(*deadline),
                OnDemand::Idle | OnDemand::Ready => None,
            };

            tokio::select! {
                _ = self.token.cancelled() => break,
                req = self.rx.recv() => {
                    let Some(req) = req else { break };
                    self.handle_request(req);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => {
                    self.handle_timer();
                }
            }

            if self.should_self_destruct() {
                debug!(path = %self.name, "path is idle, destroying it");
                break;
            }
        }
        self.shutdown().await;
    }

    fn handle_request(&mut self, req: PathRequest) {
        match req {
            PathRequest::Describe { res } => match &self.stream {
                Some(stream) => {
                    let _ = res.send(Ok(DescribeResult::Stream(stream.clone())));
                }
                None => {
                    if self.start_on_demand_if_possible() {
                        self.pending.push(Pending::Describe { res });
                    } else if !self.conf.fallback.is_empty() {
                        let _ = res.send(Ok(DescribeResult::Redirect(self.conf.fallback.clone())));
                    } else {
                        let _ = res.send(Err(PathError::NoOnePublishing(self.name.clone())));
                    }
                }
            },

            PathRequest::AddPublisher { session, res } => {
                if self.conf.has_static_source() {
                    let _ = res.send(Err(PathError::StaticSourceInUse(self.name.clone())));
                    return;
                }
                if let SourceState::Publisher(existing) = &self.source {
                    if self.conf.disable_publisher_override {
                        let _ = res.send(Err(PathError::Busy(self.name.clone())));
                        return;
                    }
                    let old = existing.clone();
                    info!(path = %self.name, old = %old.id, new = %session.id,
                        "closing existing publisher");
                    old.close();
                    self.set_not_ready();
                }
                self.source = SourceState::Publisher(session);
                let _ = res.send(Ok(()));
            }

            PathRequest::StartPublisher {
                session_id,
                desc,
                res,
            } => {
                let current = matches!(&self.source,
                    SourceState::Publisher(s) if s.id == session_id);
                if !current {
                    let _ = res.send(Err(PathError::Terminated));
                    return;
                }
                let stream = self.set_ready(desc, "publisher", session_id.to_string());
                let _ = res.send(Ok(stream));
            }

            PathRequest::StopPublisher { session_id } => {
                if matches!(&self.source, SourceState::Publisher(s) if s.id == session_id)
                    && self.stream.is_some()
                {
                    self.set_not_ready();
                }
            }

            PathRequest::RemovePublisher { session_id } => {
                if matches!(&self.source, SourceState::Publisher(s) if s.id == session_id) {
                    if self.stream.is_some() {
                        self.set_not_ready();
                    }
                    self.source = SourceState::None;
                }
            }

            PathRequest::AddReader { session, res } => match &self.stream {
                Some(stream) => {
                    let stream = stream.clone();
                    self.insert_reader(session);
                    let _ = res.send(Ok(stream));
                }
                None => {
                    if self.start_on_demand_if_possible() {
                        self.pending.push(Pending::Reader { session, res });
                    } else {
                        let _ = res.send(Err(PathError::NoOnePublishing(self.name.clone())));
                    }
                }
            },

            PathRequest::RemoveReader { session_id } => {
                self.readers.remove(&session_id);
                if let Some(cmd) = self.on_read_cmds.remove(&session_id) {
                    cmd.close();
                }
                self.pending.retain(|p| {
                    !matches!(p, Pending::Reader { session, .. } if session.id == session_id)
                });
                if self.readers.is_empty() && self.on_demand_active() {
                    self.on_demand = OnDemand::Draining {
                        deadline: Instant::now() + self.conf.source_on_demand_close_after.get(),
                    };
                }
            }

            PathRequest::SourceReady { desc, res } => {
                if let Some(stream) = &self.stream {
                    let _ = res.send(Ok(stream.clone()));
                } else {
                    let stream = self.set_ready(desc, "staticSource", self.name.clone());
                    let _ = res.send(Ok(stream));
                }
            }

            PathRequest::SourceNotReady => {
                // the pull task has exited; drop its handle so a relaunch
                // can start fresh
                self.static_source = None;
                if matches!(self.source, SourceState::Static) && self.stream.is_some() {
                    self.set_not_ready();
                }
                if self.conf.source_on_demand {
                    // next reader restarts the source
                    self.stop_on_demand_source();
                    self.fail_pending(|name| PathError::NoOnePublishing(name));
                    self.on_demand = OnDemand::Idle;
                } else {
                    self.on_demand = OnDemand::Retrying {
                        deadline: Instant::now() + self.conf.source_retry_pause.get(),
                    };
                }
                self.source = SourceState::None;
            }

            PathRequest::HotUpdate { conf_name, conf } => {
                debug!(path = %self.name, conf = %conf_name, "path configuration hot-updated");
                self.conf_name = conf_name;
                self.conf = expand_matches(*conf, &self.matches);
            }

            PathRequest::ApiInfo { res } => {
                let _ = res.send(self.api_info());
            }
        }
    }

    fn handle_timer(&mut self) {
        match &self.on_demand {
            OnDemand::Starting { .. } => {
                warn!(path = %self.name, "on-demand source did not become ready in time");
                self.stop_on_demand_source();
                self.fail_pending(PathError::NoOnePublishing);
                self.on_demand = OnDemand::Idle;
            }
            OnDemand::Draining { .. } => {
                debug!(path = %self.name, "no readers, stopping on-demand source");
                self.stop_on_demand_source();
                if self.stream.is_some() {
                    self.set_not_ready();
                }
                self.source = SourceState::None;
                self.on_demand = OnDemand::Idle;
            }
            OnDemand::Retrying { .. } => {
                self.on_demand = OnDemand::Idle;
                self.start_static_source();
            }
            OnDemand::Idle | OnDemand::Ready => {}
        }
    }

    /// True while an on-demand source is running because of this machine.
    fn on_demand_active(&self) -> bool {
        self.conf.can_start_on_demand()
            && matches!(
                self.on_demand,
                OnDemand::Starting { .. } | OnDemand::Ready | OnDemand::Draining { .. }
            )
    }

    /// Launch the on-demand source if configured and not already running.
    /// Returns true when the caller should park its request.
    fn start_on_demand_if_possible(&mut self) -> bool {
        match self.on_demand {
            OnDemand::Starting { .. } => return true,
            OnDemand::Ready | OnDemand::Draining { .. } => {
                if self.stream.is_some() {
                    // a reader arrived while draining; the source is still up
                    self.on_demand = OnDemand::Ready;
                } else {
                    // the source is up but lost its stream; wait for it to
                    // come back under a fresh start deadline
                    self.on_demand = OnDemand::Starting {
                        deadline: Instant::now()
                            + self.conf.source_on_demand_start_timeout.get(),
                    };
                }
                return true;
            }
            OnDemand::Retrying { .. } => {
                // an eager static source is between retries; readers cannot
                // wait on it
                return false;
            }
            OnDemand::Idle => {}
        }
        if !self.conf.can_start_on_demand() {
            // a plain publisher path may still be waiting for its publisher
            return false;
        }
        let deadline = Instant::now() + self.conf.source_on_demand_start_timeout.get();
        if self.conf.has_static_source() {
            self.start_static_source();
        } else {
            debug!(path = %self.name, cmd = %self.conf.run_on_demand, "starting on-demand command");
            self.on_demand_cmd = Some(Cmd::new(
                &self.cmd_pool,
                &self.conf.run_on_demand,
                self.conf.run_on_demand_restart,
                self.hook_env(),
                None,
            ));
        }
        self.on_demand = OnDemand::Starting { deadline };
        true
    }

    fn start_static_source(&mut self) {
        if self.static_source.is_some() {
            return;
        }
        self.source = SourceState::Static;
        self.static_source = Some(StaticSource::spawn(
            self.conf.source.clone(),
            self.handle_for_source(),
            self.conf.source_retry_pause.get(),
            &self.token,
        ));
    }

    fn handle_for_source(&self) -> PathHandle {
        // a second handle over the same mailbox, used by the source task
        PathHandle {
            name: Arc::from(self.name.as_str()),
            path_id: self.path_id,
            tx: self.tx_self.clone(),
            token: self.token.clone(),
        }
    }

    fn stop_on_demand_source(&mut self) {
        if let Some(cmd) = self.on_demand_cmd.take() {
            cmd.close();
        }
        if let Some(src) = self.static_source.take() {
            src.close();
        }
    }

    fn insert_reader(&mut self, session: SessionHandle) {
        if !self.conf.run_on_read.is_empty() {
            let mut env = self.hook_env();
            env.insert("MTX_READER_ID".to_owned(), session.id.to_string());
            let cmd = Cmd::new(&self.cmd_pool, &self.conf.run_on_read, false, env, None);
            self.on_read_cmds.insert(session.id, cmd);
        }
        self.readers.insert(session.id, session);
        if matches!(self.on_demand, OnDemand::Draining { .. }) {
            self.on_demand = OnDemand::Ready;
        }
    }

    fn set_ready(&mut self, desc: Description, kind: &str, source_id: String) -> Arc<Stream> {
        debug_assert!(self.stream.is_none());
        let stream = Stream::new(desc, self.globals.write_queue_size);
        self.stream = Some(stream.clone());
        self.ready_time = Some(Utc::now());
        info!(path = %self.name, source = kind, id = %source_id, "path is ready");

        if !self.conf.run_on_ready.is_empty() {
            let mut env = self.hook_env();
            env.insert("MTX_SOURCE_ID".to_owned(), source_id);
            self.on_ready_cmd = Some(Cmd::new(
                &self.cmd_pool,
                &self.conf.run_on_ready,
                false,
                env,
                None,
            ));
        }

        // answer everyone parked on readiness
        for pending in self.pending.drain(..).collect::<Vec<_>>() {
            match pending {
                Pending::Describe { res } => {
                    let _ = res.send(Ok(DescribeResult::Stream(stream.clone())));
                }
                Pending::Reader { session, res } => {
                    self.insert_reader(session);
                    let _ = res.send(Ok(stream.clone()));
                }
            }
        }

        // answered DESCRIBEs are not readers yet; without one the source
        // drains unless a SETUP lands inside the close-after window
        if self.conf.can_start_on_demand() {
            self.on_demand = if self.readers.is_empty() {
                OnDemand::Draining {
                    deadline: Instant::now() + self.conf.source_on_demand_close_after.get(),
                }
            } else {
                OnDemand::Ready
            };
        }

        let _ = self.events.send(PathEvent::Ready {
            name: self.name.clone(),
        });
        stream
    }

    fn set_not_ready(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        info!(path = %self.name, "path is not ready");
        // close every reader before destroying the stream
        for reader in self.readers.values() {
            reader.close();
        }
        self.readers.clear();
        for (_, cmd) in self.on_read_cmds.drain() {
            cmd.close();
        }
        stream.close();
        self.ready_time = None;
        if let Some(cmd) = self.on_ready_cmd.take() {
            cmd.close();
        }
        // with the readers gone, a still-running on-demand source drains
        // unless a caller immediately moves the machine elsewhere
        if self.on_demand_active() {
            self.on_demand = OnDemand::Draining {
                deadline: Instant::now() + self.conf.source_on_demand_close_after.get(),
            };
        }
        let _ = self.events.send(PathEvent::NotReady {
            name: self.name.clone(),
        });
    }

    fn fail_pending(&mut self, make: impl Fn(String) -> PathError) {
        for pending in self.pending.drain(..) {
            match pending {
                Pending::Describe { res } => {
                    let _ = res.send(Err(make(self.name.clone())));
                }
                Pending::Reader { res, .. } => {
                    let _ = res.send(Err(make(self.name.clone())));
                }
            }
        }
    }

    /// A dynamically-created path with nothing attached and nothing keeping a
    /// source alive removes itself.
    fn should_self_destruct(&self) -> bool {
        self.dynamic
            && self.readers.is_empty()
            && self.pending.is_empty()
            && self.stream.is_none()
            && matches!(self.source, SourceState::None)
            && matches!(self.on_demand, OnDemand::Idle)
            && self.static_source.is_none()
            && self.conf.run_on_init.is_empty()
    }

    fn api_info(&self) -> ApiPath {
        let source = match &self.source {
            SourceState::None => None,
            SourceState::Publisher(s) => Some(ApiPathSource {
                kind: format!("{}Session", s.protocol),
                id: s.id.to_string(),
            }),
            SourceState::Static => Some(ApiPathSource {
                kind: "staticSource".to_owned(),
                id: String::new(),
            }),
        };
        let tracks = self
            .stream
            .as_ref()
            .map(|s| {
                s.description()
                    .medias
                    .iter()
                    .flat_map(|m| m.formats.iter().map(|f| f.name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        ApiPath {
            name: self.name.clone(),
            conf_name: self.conf_name.clone(),
            source,
            ready: self.stream.is_some(),
            ready_time: self.ready_time,
            tracks,
            bytes_received: self.stream.as_ref().map_or(0, |s| s.bytes_received()),
            bytes_sent: self.stream.as_ref().map_or(0, |s| s.bytes_sent()),
            readers: self
                .readers
                .values()
                .map(|r| ApiPathSource {
                    kind: format!("{}Session", r.protocol),
                    id: r.id.to_string(),
                })
                .collect(),
        }
    }

    async fn shutdown(mut self) {
        self.set_not_ready();
        self.fail_pending(|_| PathError::Terminated);
        self.stop_on_demand_source();
        if let Some(src) = self.static_source.take() {
            src.close();
        }
        if let Some(cmd) = self.on_init_cmd.take() {
            cmd.close();
        }
        if let SourceState::Publisher(publisher) = &self.source {
            publisher.close();
        }
        self.token.cancel();
        let _ = self.events.send(PathEvent::Closed {
            name: self.name.clone(),
            path_id: self.path_id,
        });
        info!(path = %self.name, "path destroyed");
    }
}

/// Expand `$G1`..`$Gn` in the fields that may reference regex submatches.
fn expand_matches(mut conf: PathConf, matches: &[String]) -> PathConf {
    if matches.len() < 2 {
        return conf;
    }
    let expand = |s: &mut String| {
        for (i, group) in matches.iter().enumerate().skip(1) {
            *s = s.replace(&format!("$G{i}"), group);
        }
    };
    expand(&mut conf.source);
    expand(&mut conf.run_on_init);
    expand(&mut conf.run_on_demand);
    expand(&mut conf.run_on_ready);
    expand(&mut conf.run_on_read);
    conf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_groups_expand_into_source_and_hooks() {
        let conf = PathConf {
            source: "rtsp://upstream/$G1".to_owned(),
            run_on_demand: "fetch $G1 $G2".to_owned(),
            ..PathConf::default()
        };
        let matches = vec![
            "cam_garden_low".to_owned(),
            "garden".to_owned(),
            "low".to_owned(),
        ];
        let expanded = expand_matches(conf, &matches);
        assert_eq!(expanded.source, "rtsp://upstream/garden");
        assert_eq!(expanded.run_on_demand, "fetch garden low");
    }

    #[test]
    fn expansion_is_a_no_op_without_groups() {
        let conf = PathConf {
            source: "rtsp://upstream/$G1".to_owned(),
            ..PathConf::default()
        };
        let expanded = expand_matches(conf, &["whole".to_owned()]);
        assert_eq!(expanded.source, "rtsp://upstream/$G1");
    }
}
