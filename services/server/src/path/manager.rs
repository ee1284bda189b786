//! Path registry and admission router.
//!
//! A single-task actor owning every [`PathActor`]: all map mutation happens
//! inside its select loop, so the path map needs no lock. Admission requests
//! resolve the path configuration here, then authentication and the
//! synchronous path exchange run in a per-request task so an external auth
//! round-trip never stalls the dispatcher.

use super::{
    ApiPath, DescribeResult, PathActor, PathEvent, PathGlobals, PathHandle, PathSpawn,
    SessionHandle,
};
use crate::auth::{self, AccessRequest, AuthError};
use crate::conf::{Conf, PathConf, is_valid_path_name};
use crate::externalcmd::CmdPool;
use crate::path::PathError;
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PmError {
    #[error("path '{0}' is not configured")]
    NotConfigured(String),
    #[error("invalid path name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("terminated")]
    Terminated,
}

/// Readiness notifications delivered to subscribed front-ends (HLS).
#[derive(Debug, Clone)]
pub enum PathNotify {
    Ready { name: String },
    NotReady { name: String },
}

enum PmRequest {
    Describe {
        req: AccessRequest,
        nonce: Option<String>,
        res: oneshot::Sender<Result<DescribeResult, PmError>>,
    },
    AddPublisher {
        req: AccessRequest,
        nonce: Option<String>,
        session: SessionHandle,
        res: oneshot::Sender<Result<PathHandle, PmError>>,
    },
    AddReader {
        req: AccessRequest,
        nonce: Option<String>,
        session: SessionHandle,
        res: oneshot::Sender<Result<(PathHandle, Arc<Stream>), PmError>>,
    },
    ApiList {
        res: oneshot::Sender<Vec<ApiPath>>,
    },
    ApiGet {
        name: String,
        res: oneshot::Sender<Option<ApiPath>>,
    },
    Reload {
        conf: Box<Conf>,
        res: oneshot::Sender<()>,
    },
    Subscribe {
        tx: mpsc::UnboundedSender<PathNotify>,
    },
}

/// Cloneable handle to the path manager, held by every front-end and the API.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::Sender<PmRequest>,
    token: CancellationToken,
}

impl PathManagerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PmRequest,
    ) -> Result<T, PmError> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            _ = self.token.cancelled() => return Err(PmError::Terminated),
            sent = self.tx.send(build(tx)) => {
                sent.map_err(|_| PmError::Terminated)?;
            }
        }
        rx.await.map_err(|_| PmError::Terminated)
    }

    pub async fn describe(
        &self,
        req: AccessRequest,
        nonce: Option<String>,
    ) -> Result<DescribeResult, PmError> {
        self.request(|res| PmRequest::Describe { req, nonce, res })
            .await?
    }

    pub async fn add_publisher(
        &self,
        req: AccessRequest,
        nonce: Option<String>,
        session: SessionHandle,
    ) -> Result<PathHandle, PmError> {
        self.request(|res| PmRequest::AddPublisher {
            req,
            nonce,
            session,
            res,
        })
        .await?
    }

    pub async fn add_reader(
        &self,
        req: AccessRequest,
        nonce: Option<String>,
        session: SessionHandle,
    ) -> Result<(PathHandle, Arc<Stream>), PmError> {
        self.request(|res| PmRequest::AddReader {
            req,
            nonce,
            session,
            res,
        })
        .await?
    }

    pub async fn api_paths_list(&self) -> Result<Vec<ApiPath>, PmError> {
        self.request(|res| PmRequest::ApiList { res }).await
    }

    pub async fn api_paths_get(&self, name: &str) -> Result<Option<ApiPath>, PmError> {
        let name = name.to_owned();
        self.request(|res| PmRequest::ApiGet { name, res }).await
    }

    pub async fn reload(&self, conf: Conf) -> Result<(), PmError> {
        self.request(|res| PmRequest::Reload {
            conf: Box::new(conf),
            res,
        })
        .await
    }

    /// Subscribe to path readiness notifications.
    pub async fn subscribe(&self, tx: mpsc::UnboundedSender<PathNotify>) {
        let _ = self.tx.send(PmRequest::Subscribe { tx }).await;
    }
}

/// Owner of the path manager actor; held by the Core.
pub struct PathManager {
    handle: PathManagerHandle,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl PathManager {
    pub fn new(conf: Conf, parent: &CancellationToken) -> PathManager {
        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = PathManagerHandle {
            tx,
            token: token.clone(),
        };
        let globals = PathGlobals {
            write_queue_size: conf.global.write_queue_size,
            rtsp_port: conf.global.rtsp_port(),
        };
        let mut actor = ManagerActor {
            conf,
            globals,
            paths: HashMap::new(),
            subscribers: Vec::new(),
            cmd_pool: Arc::new(CmdPool::new()),
            http_client: reqwest::Client::new(),
            events_tx,
            events_rx,
            rx,
            token: token.clone(),
        };
        let join = tokio::spawn(async move {
            actor.create_eager_paths();
            actor.run().await;
        });
        PathManager {
            handle,
            token,
            join,
        }
    }

    pub fn handle(&self) -> PathManagerHandle {
        self.handle.clone()
    }

    /// Cancel the whole path tree and wait for it to unwind.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

// ---------------------------------------------------------------------------
// Actor internals
// ---------------------------------------------------------------------------

struct LivePath {
    handle: PathHandle,
    join: JoinHandle<()>,
    conf_name: String,
    conf: PathConf,
}

struct ManagerActor {
    conf: Conf,
    globals: PathGlobals,
    paths: HashMap<String, LivePath>,
    subscribers: Vec<mpsc::UnboundedSender<PathNotify>>,
    cmd_pool: Arc<CmdPool>,
    http_client: reqwest::Client,
    events_tx: mpsc::UnboundedSender<PathEvent>,
    events_rx: mpsc::UnboundedReceiver<PathEvent>,
    rx: mpsc::Receiver<PmRequest>,
    token: CancellationToken,
}

impl ManagerActor {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                req = self.rx.recv() => {
                    let Some(req) = req else { break };
                    self.handle_request(req).await;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.shutdown().await;
    }

    async fn handle_request(&mut self, req: PmRequest) {
        match req {
            PmRequest::Describe { req, nonce, res } => {
                match self.resolve(&req) {
                    Ok((path, path_conf)) => {
                        let auth = self.auth_context(path_conf);
                        tokio::spawn(async move {
                            let result = async {
                                auth.check(&req, nonce.as_deref()).await?;
                                Ok(path.describe().await?)
                            }
                            .await;
                            let _ = res.send(result);
                        });
                    }
                    Err(e) => {
                        let _ = res.send(Err(e));
                    }
                }
            }
            PmRequest::AddPublisher {
                req,
                nonce,
                session,
                res,
            } => match self.resolve(&req) {
                Ok((path, path_conf)) => {
                    let auth = self.auth_context(path_conf);
                    tokio::spawn(async move {
                        let result = async {
                            auth.check(&req, nonce.as_deref()).await?;
                            path.add_publisher(session).await?;
                            Ok(path)
                        }
                        .await;
                        let _ = res.send(result);
                    });
                }
                Err(e) => {
                    let _ = res.send(Err(e));
                }
            },
            PmRequest::AddReader {
                req,
                nonce,
                session,
                res,
            } => match self.resolve(&req) {
                Ok((path, path_conf)) => {
                    let auth = self.auth_context(path_conf);
                    tokio::spawn(async move {
                        let result = async {
                            auth.check(&req, nonce.as_deref()).await?;
                            let stream = path.add_reader(session).await?;
                            Ok((path, stream))
                        }
                        .await;
                        let _ = res.send(result);
                    });
                }
                Err(e) => {
                    let _ = res.send(Err(e));
                }
            },
            PmRequest::ApiList { res } => {
                let handles: Vec<PathHandle> =
                    self.paths.values().map(|p| p.handle.clone()).collect();
                tokio::spawn(async move {
                    let mut items = Vec::with_capacity(handles.len());
                    for handle in handles {
                        if let Ok(info) = handle.api_info().await {
                            items.push(info);
                        }
                    }
                    items.sort_by(|a, b| a.name.cmp(&b.name));
                    let _ = res.send(items);
                });
            }
            PmRequest::ApiGet { name, res } => match self.paths.get(&name) {
                Some(path) => {
                    let handle = path.handle.clone();
                    tokio::spawn(async move {
                        let _ = res.send(handle.api_info().await.ok());
                    });
                }
                None => {
                    let _ = res.send(None);
                }
            },
            PmRequest::Reload { conf, res } => {
                self.reload(*conf).await;
                let _ = res.send(());
            }
            PmRequest::Subscribe { tx } => {
                self.subscribers.push(tx);
            }
        }
    }

    fn handle_event(&mut self, event: PathEvent) {
        match event {
            PathEvent::Ready { name } => self.notify(PathNotify::Ready { name }),
            PathEvent::NotReady { name } => self.notify(PathNotify::NotReady { name }),
            PathEvent::Closed { name, path_id } => {
                if let Some(live) = self.paths.get(&name) {
                    if live.handle.path_id == path_id {
                        self.paths.remove(&name);
                    }
                }
            }
        }
    }

    fn notify(&mut self, event: PathNotify) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Locate or lazily create the path for an admission request. Returns
    /// the path handle plus the configuration the auth predicate must use.
    fn resolve(&mut self, req: &AccessRequest) -> Result<(PathHandle, PathConf), PmError> {
        if !is_valid_path_name(&req.name) {
            return Err(PmError::InvalidName(req.name.clone()));
        }
        if let Some(live) = self.paths.get(&req.name) {
            return Ok((live.handle.clone(), live.conf.clone()));
        }
        let (conf_name, path_conf, matches) = self
            .conf
            .find_path_conf(&req.name)
            .ok_or_else(|| PmError::NotConfigured(req.name.clone()))?;
        let dynamic = conf_name != req.name;
        let handle = self.create_path(
            req.name.clone(),
            conf_name,
            path_conf.clone(),
            matches,
            dynamic,
        );
        Ok((handle, path_conf))
    }

    fn create_path(
        &mut self,
        name: String,
        conf_name: String,
        conf: PathConf,
        matches: Vec<String>,
        dynamic: bool,
    ) -> PathHandle {
        let PathSpawn { handle, join } = PathActor::spawn(
            name.clone(),
            conf_name.clone(),
            conf.clone(),
            matches,
            dynamic,
            self.globals.clone(),
            self.cmd_pool.clone(),
            self.events_tx.clone(),
            &self.token,
        );
        self.paths.insert(
            name,
            LivePath {
                handle: handle.clone(),
                join,
                conf_name,
                conf,
            },
        );
        handle
    }

    /// Create a path for every literal (non-regex, non-catch-all)
    /// configuration that has none yet.
    fn create_eager_paths(&mut self) {
        let eager: Vec<(String, PathConf)> = self
            .conf
            .paths
            .iter()
            .filter(|(name, _)| {
                !name.starts_with('~')
                    && *name != "all"
                    && *name != "all_others"
                    && !self.paths.contains_key(*name)
            })
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();
        for (name, conf) in eager {
            self.create_path(name.clone(), name, conf, Vec::new(), false);
        }
    }

    /// Apply a new configuration: hot-update, keep, or close-and-wait each
    /// live path, then create what the new config demands.
    async fn reload(&mut self, new_conf: Conf) {
        self.globals = PathGlobals {
            write_queue_size: new_conf.global.write_queue_size,
            rtsp_port: new_conf.global.rtsp_port(),
        };

        let mut to_close: Vec<String> = Vec::new();
        for (name, live) in &mut self.paths {
            match new_conf.find_path_conf(name) {
                None => to_close.push(name.clone()),
                Some((new_conf_name, new_path_conf, _)) => {
                    if new_conf_name == live.conf_name && new_path_conf == live.conf {
                        continue;
                    }
                    if crate::conf::path_conf_can_be_hot_updated(&live.conf, &new_path_conf) {
                        debug!(path = %name, conf = %new_conf_name, "hot-updating path");
                        live.conf_name = new_conf_name.clone();
                        live.conf = new_path_conf.clone();
                        let _ = live.handle.tx.try_send(super::PathRequest::HotUpdate {
                            conf_name: new_conf_name,
                            conf: Box::new(new_path_conf),
                        });
                    } else {
                        to_close.push(name.clone());
                    }
                }
            }
        }

        // close first and wait, to avoid source-port conflicts with the
        // replacements created below
        for name in to_close {
            if let Some(live) = self.paths.remove(&name) {
                info!(path = %name, "closing path for reload");
                live.handle.token.cancel();
                let _ = live.join.await;
            }
        }

        self.conf = new_conf;
        self.create_eager_paths();
    }

    async fn shutdown(&mut self) {
        for (_, live) in self.paths.drain() {
            live.handle.token.cancel();
            let _ = live.join.await;
        }
        self.cmd_pool.close().await;
        // drain remaining path events so joins above cannot leave stragglers
        while self.events_rx.try_recv().is_ok() {}
    }

    fn auth_context(&self, path_conf: PathConf) -> AuthContext {
        AuthContext {
            client: self.http_client.clone(),
            external_url: self.conf.global.external_authentication_url.clone(),
            path_conf,
        }
    }
}

/// Everything an admission task needs to run the auth predicate outside the
/// manager loop.
struct AuthContext {
    client: reqwest::Client,
    external_url: String,
    path_conf: PathConf,
}

impl AuthContext {
    async fn check(&self, req: &AccessRequest, nonce: Option<&str>) -> Result<(), PmError> {
        auth::authenticate(&self.client, &self.external_url, &self.path_conf, req, nonce)
            .await
            .map_err(PmError::Auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthAction, ProvidedCredentials};
    use lg_media::Description;
    use std::time::Duration;
    use uuid::Uuid;

    fn manager(yaml: &str) -> (PathManager, CancellationToken) {
        let conf = Conf::parse(yaml).unwrap();
        let root = CancellationToken::new();
        (PathManager::new(conf, &root), root)
    }

    fn session(protocol: &'static str) -> SessionHandle {
        SessionHandle::new(Uuid::new_v4(), protocol, CancellationToken::new())
    }

    #[tokio::test]
    async fn publisher_then_reader_flow() {
        let (pm, _root) = manager("paths:\n  all_others:\n");
        let handle = pm.handle();

        let publisher = session("rtsp");
        let path = handle
            .add_publisher(
                AccessRequest::internal("mypath", AuthAction::Publish),
                None,
                publisher.clone(),
            )
            .await
            .unwrap();
        let stream = path
            .start_publisher(publisher.id, Description::single_video())
            .await
            .unwrap();
        assert!(!stream.is_closed());

        let reader = session("rtsp");
        let (path2, stream2) = handle
            .add_reader(
                AccessRequest::internal("mypath", AuthAction::Read),
                None,
                reader.clone(),
            )
            .await
            .unwrap();
        assert_eq!(path2.name(), "mypath");
        assert!(Arc::ptr_eq(&stream, &stream2));

        let info = handle.api_paths_get("mypath").await.unwrap().unwrap();
        assert!(info.ready);
        assert_eq!(info.conf_name, "all_others");
        assert_eq!(info.readers.len(), 1);

        pm.close().await;
    }

    #[tokio::test]
    async fn reader_without_publisher_is_rejected_and_path_removed() {
        let (pm, _root) = manager("paths:\n  all_others:\n");
        let handle = pm.handle();

        let err = handle
            .add_reader(
                AccessRequest::internal("ghost", AuthAction::Read),
                None,
                session("rtsp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PmError::Path(PathError::NoOnePublishing(_))));

        // the dynamically-created path destroys itself
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.api_paths_get("ghost").await.unwrap().is_none());
        assert!(handle.api_paths_list().await.unwrap().is_empty());

        pm.close().await;
    }

    #[tokio::test]
    async fn unconfigured_path_is_refused() {
        let (pm, _root) = manager("paths:\n  only:\n");
        let err = pm
            .handle()
            .add_reader(
                AccessRequest::internal("other", AuthAction::Read),
                None,
                session("rtsp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PmError::NotConfigured(_)));
        pm.close().await;
    }

    #[tokio::test]
    async fn publisher_override_preempts_or_rejects() {
        let (pm, _root) = manager("paths:\n  all_others:\n");
        let handle = pm.handle();

        let first = session("rtsp");
        let path = handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                first.clone(),
            )
            .await
            .unwrap();
        path.start_publisher(first.id, Description::single_video())
            .await
            .unwrap();

        // override enabled by default: second publisher wins
        let second = session("rtmp");
        handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                second.clone(),
            )
            .await
            .unwrap();
        assert!(first.token.is_cancelled(), "first publisher must be closed");

        pm.close().await;

        let (pm, _root) =
            manager("paths:\n  all_others:\n    disablePublisherOverride: true\n");
        let handle = pm.handle();
        let first = session("rtsp");
        handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                first.clone(),
            )
            .await
            .unwrap();
        let err = handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                session("rtmp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PmError::Path(PathError::Busy(_))));
        assert!(!first.token.is_cancelled());
        pm.close().await;
    }

    #[tokio::test]
    async fn readers_are_evicted_when_publisher_leaves() {
        let (pm, _root) = manager("paths:\n  all_others:\n");
        let handle = pm.handle();

        let publisher = session("rtsp");
        let path = handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                publisher.clone(),
            )
            .await
            .unwrap();
        path.start_publisher(publisher.id, Description::single_video())
            .await
            .unwrap();

        let reader = session("hls");
        let (_, stream) = handle
            .add_reader(
                AccessRequest::internal("cam", AuthAction::Read),
                None,
                reader.clone(),
            )
            .await
            .unwrap();

        path.remove_publisher(publisher.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reader.token.is_cancelled(), "reader must be closed");
        assert!(stream.is_closed(), "stream must be destroyed");

        pm.close().await;
    }

    #[tokio::test]
    async fn auth_rejects_bad_credentials() {
        let (pm, _root) = manager(
            "paths:\n  all_others:\n    readUser: admin\n    readPass: secret\n",
        );
        let handle = pm.handle();

        let mut req = AccessRequest::internal("cam", AuthAction::Read);
        req.skip_auth = false;
        req.credentials = ProvidedCredentials::Plain {
            user: "admin".to_owned(),
            pass: "wrong".to_owned(),
        };
        let err = handle
            .add_reader(req, None, session("rtsp"))
            .await
            .unwrap_err();
        assert!(matches!(err, PmError::Auth(_)));
        pm.close().await;
    }

    #[tokio::test]
    async fn reload_is_idempotent_for_identical_conf() {
        let yaml = "paths:\n  fixed:\n  all_others:\n";
        let (pm, _root) = manager(yaml);
        let handle = pm.handle();

        let before = handle.api_paths_get("fixed").await.unwrap().unwrap();
        handle.reload(Conf::parse(yaml).unwrap()).await.unwrap();
        let after = handle.api_paths_get("fixed").await.unwrap().unwrap();
        // same creation: nothing was recreated, readiness state preserved
        assert_eq!(before.name, after.name);
        assert_eq!(before.conf_name, after.conf_name);
        assert!(handle.api_paths_get("fixed").await.unwrap().is_some());
        pm.close().await;
    }

    #[tokio::test]
    async fn reload_rebinds_conf_name_without_dropping_stream() {
        let (pm, _root) = manager("paths:\n  all_others:\n");
        let handle = pm.handle();

        let publisher = session("rtmp");
        let path = handle
            .add_publisher(
                AccessRequest::internal("undefined_stream", AuthAction::Publish),
                None,
                publisher.clone(),
            )
            .await
            .unwrap();
        let stream = path
            .start_publisher(publisher.id, Description::video_and_audio())
            .await
            .unwrap();

        let info = handle
            .api_paths_get("undefined_stream")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.conf_name, "all_others");

        // add an exact configuration differing only in a hot-reloadable field
        let base = Conf::parse("paths:\n  all_others:\n").unwrap();
        let with_exact = base
            .add_path("undefined_stream", serde_json::json!({"record": true}))
            .unwrap();
        handle.reload(with_exact).await.unwrap();

        let info = handle
            .api_paths_get("undefined_stream")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.conf_name, "undefined_stream");
        assert!(info.ready, "stream must survive the rebind");
        assert!(!stream.is_closed());

        // deleting the exact configuration reverts to the catch-all
        handle.reload(base).await.unwrap();
        let info = handle
            .api_paths_get("undefined_stream")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.conf_name, "all_others");
        assert!(!stream.is_closed());

        pm.close().await;
    }

    #[tokio::test]
    async fn reload_closes_paths_of_removed_confs() {
        let (pm, _root) = manager("paths:\n  fixed:\n");
        let handle = pm.handle();
        assert!(handle.api_paths_get("fixed").await.unwrap().is_some());

        handle.reload(Conf::parse("").unwrap()).await.unwrap();
        assert!(handle.api_paths_get("fixed").await.unwrap().is_none());
        pm.close().await;
    }

    #[tokio::test]
    async fn cold_conf_change_recreates_path() {
        let (pm, _root) = manager("paths:\n  cam:\n");
        let handle = pm.handle();

        let publisher = session("rtsp");
        let path = handle
            .add_publisher(
                AccessRequest::internal("cam", AuthAction::Publish),
                None,
                publisher.clone(),
            )
            .await
            .unwrap();
        path.start_publisher(publisher.id, Description::single_video())
            .await
            .unwrap();

        // disablePublisherOverride is not hot-reloadable
        let new_conf =
            Conf::parse("paths:\n  cam:\n    disablePublisherOverride: true\n").unwrap();
        handle.reload(new_conf).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(publisher.token.is_cancelled(), "publisher closed with old path");
        let info = handle.api_paths_get("cam").await.unwrap().unwrap();
        assert!(!info.ready, "recreated path starts not ready");
        pm.close().await;
    }

    #[tokio::test]
    async fn on_demand_start_timeout_rejects_reader() {
        let (pm, _root) = manager(
            "paths:\n  cam:\n    runOnDemand: sleep 60\n    sourceOnDemandStartTimeout: 200ms\n",
        );
        let handle = pm.handle();

        let started = std::time::Instant::now();
        let err = handle
            .add_reader(
                AccessRequest::internal("cam", AuthAction::Read),
                None,
                session("rtsp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PmError::Path(PathError::NoOnePublishing(_))));
        assert!(started.elapsed() >= Duration::from_millis(200));
        pm.close().await;
    }

    #[tokio::test]
    async fn describe_returns_fallback_redirect() {
        let (pm, _root) = manager("paths:\n  cam:\n    fallback: backup\n");
        let res = pm
            .handle()
            .describe(AccessRequest::internal("cam", AuthAction::Read), None)
            .await
            .unwrap();
        assert!(matches!(res, DescribeResult::Redirect(ref target) if target == "backup"));
        pm.close().await;
    }
}
