// lg-test-utils: shared helpers for the integration suites.
//
// Provides wire-level RTSP/RTMP/SRT test clients speaking the server's
// dialects, a config generator that keeps every listener on a
// caller-chosen port range, and polling helpers.

pub mod rtmp_client;
pub mod rtsp_client;
pub mod srt_client;

pub use rtmp_client::RtmpTestPublisher;
pub use rtsp_client::RtspTestClient;
pub use srt_client::SrtTestClient;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An in-process server under test.
pub struct TestServer {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Parse `yaml`, boot the full core, and drive its reload loop in the
    /// background.
    pub async fn start(yaml: &str) -> TestServer {
        let conf = server::conf::Conf::parse(yaml).expect("test config must parse");
        let core = server::core::Core::new(conf, None)
            .await
            .expect("test server must start");
        let token = core.token();
        let join = tokio::spawn(async move {
            let mut core = core;
            core.run().await;
            core.close().await;
        });
        TestServer { token, join }
    }

    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

/// Build a full config document whose listeners occupy `base_port..base_port+7`:
/// API, RTSP, RTMP, SRT, WebRTC, HLS, metrics. `paths_yaml` is appended
/// verbatim under `paths:`.
pub fn test_conf_yaml(base_port: u16, paths_yaml: &str) -> String {
    format!(
        "logLevel: error\n\
         api: true\n\
         apiAddress: 127.0.0.1:{api}\n\
         metrics: true\n\
         metricsAddress: 127.0.0.1:{metrics}\n\
         rtsp: true\n\
         rtspAddress: 127.0.0.1:{rtsp}\n\
         rtmp: true\n\
         rtmpAddress: 127.0.0.1:{rtmp}\n\
         srt: true\n\
         srtAddress: 127.0.0.1:{srt}\n\
         webrtc: true\n\
         webrtcAddress: 127.0.0.1:{webrtc}\n\
         hls: true\n\
         hlsAddress: 127.0.0.1:{hls}\n\
         paths:\n{paths}",
        api = base_port,
        rtsp = base_port + 1,
        rtmp = base_port + 2,
        srt = base_port + 3,
        webrtc = base_port + 4,
        hls = base_port + 5,
        metrics = base_port + 6,
        paths = paths_yaml,
    )
}

/// Poll `check` until it returns true or `timeout` elapses. Panics on
/// timeout with `what` in the message.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
