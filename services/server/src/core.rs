//! Core: subsystem lifecycle and hot reload.
//!
//! The Core owns every subsystem. On reload it computes, once, a chain of
//! boolean close flags: a subsystem is closed iff the configuration fields
//! feeding its constructor changed, and closing the path manager implies
//! closing everything that holds a handle to it. Affected subsystems are
//! closed (and awaited) before their successors are constructed; the rest
//! stay live. The two reload triggers (file watcher and API) serialize
//! through one channel.

use crate::api::{ApiServer, ApiState};
use crate::conf::{Conf, GlobalConf};
use crate::confwatcher::ConfWatcher;
use crate::metrics::MetricsServer;
use crate::path::manager::PathManager;
use crate::servers::hls::HlsServer;
use crate::servers::rtmp::RtmpServer;
use crate::servers::rtsp::RtspServer;
use crate::servers::srt::SrtServer;
use crate::servers::webrtc::WebRtcServer;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Conf(#[from] crate::conf::ConfError),
    #[error("TLS: {0}")]
    Tls(#[from] crate::tls::TlsError),
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
    #[error("config watcher: {0}")]
    Watcher(#[from] notify::Error),
}

pub struct Core {
    conf: Conf,
    conf_path: Option<PathBuf>,
    shared_conf: Arc<RwLock<Conf>>,
    token: CancellationToken,
    reload_tx: mpsc::Sender<Conf>,
    reload_rx: mpsc::Receiver<Conf>,
    file_changed_rx: mpsc::Receiver<()>,
    _watcher: Option<ConfWatcher>,

    pm: Option<PathManager>,
    rtsp: Option<RtspServer>,
    rtsps: Option<RtspServer>,
    rtmp: Option<RtmpServer>,
    rtmps: Option<RtmpServer>,
    srt: Option<SrtServer>,
    webrtc: Option<WebRtcServer>,
    hls: Option<HlsServer>,
    api: Option<ApiServer>,
    metrics: Option<MetricsServer>,
}

impl Core {
    pub async fn new(conf: Conf, conf_path: Option<PathBuf>) -> Result<Core, CoreError> {
        let token = CancellationToken::new();
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let (file_changed_tx, file_changed_rx) = mpsc::channel(1);

        let watcher = match &conf_path {
            Some(path) => Some(ConfWatcher::new(path, file_changed_tx, &token)?),
            None => None,
        };

        let mut core = Core {
            shared_conf: Arc::new(RwLock::new(conf.clone())),
            conf,
            conf_path,
            token,
            reload_tx,
            reload_rx,
            file_changed_rx,
            _watcher: watcher,
            pm: None,
            rtsp: None,
            rtsps: None,
            rtmp: None,
            rtmps: None,
            srt: None,
            webrtc: None,
            hls: None,
            api: None,
            metrics: None,
        };
        core.create_missing(true).await?;
        Ok(core)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Reload entry point used by the API.
    pub fn reload_sender(&self) -> mpsc::Sender<Conf> {
        self.reload_tx.clone()
    }

    /// Serve reload triggers until the process scope is cancelled.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                new_conf = self.reload_rx.recv() => {
                    let Some(new_conf) = new_conf else { break };
                    info!("reloading configuration (API request)");
                    self.apply(new_conf).await;
                }
                changed = self.file_changed_rx.recv() => {
                    if changed.is_none() {
                        continue;
                    }
                    let Some(path) = self.conf_path.clone() else { continue };
                    match Conf::load(&path) {
                        Ok(new_conf) => {
                            info!("reloading configuration (file changed)");
                            self.apply(new_conf).await;
                        }
                        // a bad file leaves the running system untouched
                        Err(e) => error!(error = %e, "configuration reload failed"),
                    }
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.token.cancel();
        self.close_subsystems(true, true, true, true, true, true, true, true, true, true)
            .await;
        info!("server stopped");
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    async fn apply(&mut self, new_conf: Conf) {
        let old = &self.conf.global;
        let new = &new_conf.global;

        // the close flags, computed once per reload
        let close_pm = pm_inputs(old) != pm_inputs(new);
        let close_rtsp = close_pm || rtsp_inputs(old) != rtsp_inputs(new);
        let close_rtsps = close_pm || rtsps_inputs(old) != rtsps_inputs(new);
        let close_rtmp = close_pm || rtmp_inputs(old) != rtmp_inputs(new);
        let close_rtmps = close_pm || rtmps_inputs(old) != rtmps_inputs(new);
        let close_srt = close_pm || srt_inputs(old) != srt_inputs(new);
        let close_webrtc = close_pm || webrtc_inputs(old) != webrtc_inputs(new);
        let close_hls = close_pm || hls_inputs(old) != hls_inputs(new);
        let any_front_end = close_rtsp
            || close_rtsps
            || close_rtmp
            || close_rtmps
            || close_srt
            || close_webrtc
            || close_hls;
        let close_api = close_pm || any_front_end || api_inputs(old) != api_inputs(new);
        let close_metrics = close_pm || any_front_end || metrics_inputs(old) != metrics_inputs(new);

        self.close_subsystems(
            close_metrics,
            close_api,
            close_hls,
            close_webrtc,
            close_srt,
            close_rtmps,
            close_rtmp,
            close_rtsps,
            close_rtsp,
            close_pm,
        )
        .await;

        if !close_pm {
            if let Some(pm) = &self.pm {
                if let Err(e) = pm.handle().reload(new_conf.clone()).await {
                    warn!(error = %e, "path manager reload failed");
                }
            }
        }

        *self
            .shared_conf
            .write()
            .unwrap_or_else(|e| e.into_inner()) = new_conf.clone();
        self.conf = new_conf;

        if let Err(e) = self.create_missing(false).await {
            error!(error = %e, "failed to create subsystems after reload");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn close_subsystems(
        &mut self,
        metrics: bool,
        api: bool,
        hls: bool,
        webrtc: bool,
        srt: bool,
        rtmps: bool,
        rtmp: bool,
        rtsps: bool,
        rtsp: bool,
        pm: bool,
    ) {
        // children before parents; each close waits for its actor tree
        if metrics {
            if let Some(s) = self.metrics.take() {
                s.close().await;
            }
        }
        if api {
            if let Some(s) = self.api.take() {
                s.close().await;
            }
        }
        if hls {
            if let Some(s) = self.hls.take() {
                s.close().await;
            }
        }
        if webrtc {
            if let Some(s) = self.webrtc.take() {
                s.close().await;
            }
        }
        if srt {
            if let Some(s) = self.srt.take() {
                s.close().await;
            }
        }
        if rtmps {
            if let Some(s) = self.rtmps.take() {
                s.close().await;
            }
        }
        if rtmp {
            if let Some(s) = self.rtmp.take() {
                s.close().await;
            }
        }
        if rtsps {
            if let Some(s) = self.rtsps.take() {
                s.close().await;
            }
        }
        if rtsp {
            if let Some(s) = self.rtsp.take() {
                s.close().await;
            }
        }
        if pm {
            if let Some(s) = self.pm.take() {
                s.close().await;
            }
        }
    }

    /// Construct every subsystem the current config needs and that is not
    /// already live. At startup a failure is fatal; on reload it is logged
    /// by the caller.
    async fn create_missing(&mut self, _startup: bool) -> Result<(), CoreError> {
        let global = self.conf.global.clone();

        if self.pm.is_none() {
            self.pm = Some(PathManager::new(self.conf.clone(), &self.token));
        }
        let pm = self.pm.as_ref().expect("path manager just created").handle();

        if global.rtsp && self.rtsp.is_none() {
            self.rtsp = Some(
                RtspServer::new(&global, &global.rtsp_address, None, pm.clone(), &self.token)
                    .await?,
            );
        }
        if global.rtsp && !global.rtsps_address.is_empty() && self.rtsps.is_none() {
            let acceptor = crate::tls::load_acceptor(&global.server_cert, &global.server_key)?;
            self.rtsps = Some(
                RtspServer::new(
                    &global,
                    &global.rtsps_address,
                    Some(acceptor),
                    pm.clone(),
                    &self.token,
                )
                .await?,
            );
        }
        if global.rtmp && self.rtmp.is_none() {
            self.rtmp = Some(
                RtmpServer::new(&global, &global.rtmp_address, None, pm.clone(), &self.token)
                    .await?,
            );
        }
        if global.rtmp && !global.rtmps_address.is_empty() && self.rtmps.is_none() {
            let acceptor = crate::tls::load_acceptor(&global.server_cert, &global.server_key)?;
            self.rtmps = Some(
                RtmpServer::new(
                    &global,
                    &global.rtmps_address,
                    Some(acceptor),
                    pm.clone(),
                    &self.token,
                )
                .await?,
            );
        }
        if global.srt && self.srt.is_none() {
            self.srt = Some(SrtServer::new(&global, pm.clone(), &self.token).await?);
        }
        if global.webrtc && self.webrtc.is_none() {
            self.webrtc = Some(WebRtcServer::new(&global, pm.clone(), &self.token).await?);
        }
        if global.hls && self.hls.is_none() {
            self.hls = Some(HlsServer::new(&global, pm.clone(), &self.token).await?);
        }
        if global.api && self.api.is_none() {
            let state = self.api_state();
            self.api = Some(ApiServer::new(&global.api_address, state, &self.token).await?);
        }
        if global.metrics && self.metrics.is_none() {
            let state = self.api_state();
            self.metrics =
                Some(MetricsServer::new(&global.metrics_address, state, &self.token).await?);
        }
        Ok(())
    }

    fn api_state(&self) -> ApiState {
        ApiState {
            conf: self.shared_conf.clone(),
            reload_tx: self.reload_tx.clone(),
            pm: self.pm.as_ref().expect("path manager outlives the API").handle(),
            rtsp_conns: self.rtsp.as_ref().map(RtspServer::conns),
            rtsp_sessions: self.rtsp.as_ref().map(RtspServer::sessions),
            rtsps_conns: self.rtsps.as_ref().map(RtspServer::conns),
            rtsps_sessions: self.rtsps.as_ref().map(RtspServer::sessions),
            rtmp_conns: self.rtmp.as_ref().map(RtmpServer::conns),
            rtmps_conns: self.rtmps.as_ref().map(RtmpServer::conns),
            srt_conns: self.srt.as_ref().map(SrtServer::conns),
            webrtc_sessions: self.webrtc.as_ref().map(WebRtcServer::sessions),
            hls_muxers: self.hls.as_ref().map(HlsServer::muxers),
        }
    }
}

// ---------------------------------------------------------------------------
// Constructor input projections
// ---------------------------------------------------------------------------

fn pm_inputs(c: &GlobalConf) -> (usize, String, u16) {
    (
        c.write_queue_size,
        c.external_authentication_url.clone(),
        c.rtsp_port(),
    )
}

fn rtsp_inputs(c: &GlobalConf) -> (bool, String, crate::conf::duration::Dur, crate::conf::duration::Dur) {
    (c.rtsp, c.rtsp_address.clone(), c.read_timeout, c.write_timeout)
}

fn rtsps_inputs(c: &GlobalConf) -> (bool, String, String, String) {
    (
        c.rtsp,
        c.rtsps_address.clone(),
        c.server_key.clone(),
        c.server_cert.clone(),
    )
}

fn rtmp_inputs(c: &GlobalConf) -> (bool, String, crate::conf::duration::Dur, crate::conf::duration::Dur) {
    (c.rtmp, c.rtmp_address.clone(), c.read_timeout, c.write_timeout)
}

fn rtmps_inputs(c: &GlobalConf) -> (bool, String, String, String) {
    (
        c.rtmp,
        c.rtmps_address.clone(),
        c.server_key.clone(),
        c.server_cert.clone(),
    )
}

fn srt_inputs(c: &GlobalConf) -> (bool, String, crate::conf::duration::Dur) {
    (c.srt, c.srt_address.clone(), c.read_timeout)
}

fn webrtc_inputs(c: &GlobalConf) -> (bool, String, crate::conf::duration::Dur) {
    (c.webrtc, c.webrtc_address.clone(), c.read_timeout)
}

fn hls_inputs(
    c: &GlobalConf,
) -> (
    bool,
    String,
    bool,
    usize,
    crate::conf::duration::Dur,
    crate::conf::duration::Dur,
) {
    (
        c.hls,
        c.hls_address.clone(),
        c.hls_always_remux,
        c.hls_segment_count,
        c.hls_segment_duration,
        c.hls_close_after_inactivity,
    )
}

fn api_inputs(c: &GlobalConf) -> (bool, String) {
    (c.api, c.api_address.clone())
}

fn metrics_inputs(c: &GlobalConf) -> (bool, String) {
    (c.metrics, c.metrics_address.clone())
}
