//! Static pull source.
//!
//! A task owned by one path that pulls a remote RTSP stream and feeds it
//! into the path's stream. Pre-ready connection failures are retried here
//! with the configured pause; once the source has been ready, a failure is
//! reported to the path, which decides whether and when to relaunch.

use super::PathHandle;
use crate::path::PathError;
use crate::servers::rtsp::message::{
    self, Request, RtspMessage, read_message, serialize_request,
};
use lg_media::{Unit, sdp};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle owned by the path actor; close() stops the pull task.
pub(crate) struct StaticSource {
    token: CancellationToken,
}

impl StaticSource {
    pub(crate) fn spawn(
        url: String,
        path: PathHandle,
        retry_pause: Duration,
        parent: &CancellationToken,
    ) -> StaticSource {
        let token = parent.child_token();
        let task_token = token.clone();
        tokio::spawn(async move {
            run(task_token, url, path, retry_pause).await;
        });
        StaticSource { token }
    }

    pub(crate) fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for StaticSource {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum Attempt {
    /// Failed before becoming ready; retried here.
    NeverReady(String),
    /// Failed after the path saw the source ready; the path takes over.
    AfterReady(String),
    /// The owning path is gone.
    PathGone,
}

async fn run(token: CancellationToken, url: String, path: PathHandle, retry_pause: Duration) {
    loop {
        let attempt = tokio::select! {
            _ = token.cancelled() => return,
            outcome = pull_once(&token, &url, &path) => outcome,
        };
        match attempt {
            Attempt::PathGone => return,
            Attempt::AfterReady(reason) => {
                warn!(source = %url, reason = %reason, "static source disconnected");
                path.source_not_ready();
                return;
            }
            Attempt::NeverReady(reason) => {
                debug!(source = %url, reason = %reason, "static source connect failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(retry_pause) => {}
                }
            }
        }
    }
}

async fn pull_once(token: &CancellationToken, url: &str, path: &PathHandle) -> Attempt {
    let Some((host, source_path)) = parse_source_url(url) else {
        // validation should have caught this; do not spin on it
        warn!(source = %url, "invalid static source URL");
        return Attempt::PathGone;
    };

    let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&host)).await;
    let tcp = match connected {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => return Attempt::NeverReady(e.to_string()),
        Err(_) => return Attempt::NeverReady("connect timeout".to_owned()),
    };
    let (rd, mut wr) = tcp.into_split();
    let mut reader = BufReader::new(rd);

    let base_uri = format!("rtsp://{host}/{source_path}");
    let mut cseq = 0u32;

    // DESCRIBE
    let desc = {
        let res = match exchange(&mut reader, &mut wr, &base_uri, "DESCRIBE", &mut cseq, None).await
        {
            Ok(res) => res,
            Err(e) => return Attempt::NeverReady(e),
        };
        if res.status != 200 {
            return Attempt::NeverReady(format!("DESCRIBE returned {}", res.status));
        }
        match sdp::unmarshal(&String::from_utf8_lossy(&res.body)) {
            Ok(desc) => desc,
            Err(e) => return Attempt::NeverReady(format!("invalid SDP: {e}")),
        }
    };

    // SETUP each track, then PLAY
    for track in 0..desc.medias.len() {
        let uri = format!("{base_uri}/trackID={track}");
        match exchange(&mut reader, &mut wr, &uri, "SETUP", &mut cseq, None).await {
            Ok(res) if res.status == 200 => {}
            Ok(res) => return Attempt::NeverReady(format!("SETUP returned {}", res.status)),
            Err(e) => return Attempt::NeverReady(e),
        }
    }
    match exchange(&mut reader, &mut wr, &base_uri, "PLAY", &mut cseq, None).await {
        Ok(res) if res.status == 200 => {}
        Ok(res) => return Attempt::NeverReady(format!("PLAY returned {}", res.status)),
        Err(e) => return Attempt::NeverReady(e),
    }

    // the handshake succeeded: attach to the path
    let stream = match path.source_ready(desc).await {
        Ok(stream) => stream,
        Err(PathError::Terminated) => return Attempt::PathGone,
        Err(e) => return Attempt::NeverReady(e.to_string()),
    };
    info!(source = %url, path = %path.name(), "static source connected");

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return Attempt::PathGone,
            m = read_message(&mut reader) => m,
        };
        match message {
            Ok((RtspMessage::Frame { channel, payload }, _)) => {
                stream.write_unit(usize::from(channel / 2), 0, Unit::new(payload));
            }
            Ok(_) => {}
            Err(e) => return Attempt::AfterReady(e.to_string()),
        }
    }
}

async fn exchange(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    uri: &str,
    method: &str,
    cseq: &mut u32,
    body: Option<&[u8]>,
) -> Result<message::Response, String> {
    *cseq += 1;
    let mut req = Request::new(method, uri);
    req.headers.insert("cseq".to_owned(), cseq.to_string());
    if let Some(body) = body {
        req.body = bytes::Bytes::copy_from_slice(body);
    }
    let buf = serialize_request(&req);
    writer.write_all(&buf).await.map_err(|e| e.to_string())?;

    let deadline = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match read_message(reader).await {
                Ok((RtspMessage::Response(res), _)) => return Ok(res),
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
    });
    match deadline.await {
        Ok(result) => result,
        Err(_) => Err(format!("{method} response timeout")),
    }
}

/// Split `rtsp://host[:port]/path` into (host:port, path).
fn parse_source_url(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("rtsp://")
        .or_else(|| url.strip_prefix("rtsps://"))?;
    let (host, path) = rest.split_once('/')?;
    if host.is_empty() || path.is_empty() {
        return None;
    }
    let host = if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:8554")
    };
    Some((host, path.trim_end_matches('/').to_owned()))
}
