//! Configuration file watcher.
//!
//! Filesystem events on the config path are debounced and forwarded as
//! reload triggers; they serialize with API-originated reloads through the
//! Core's single reload channel.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConfWatcher {
    // kept alive for the watch registration
    _watcher: RecommendedWatcher,
}

impl ConfWatcher {
    /// Watch `path`; on every (debounced) change, emit one `()` on
    /// `changed_tx`.
    pub fn new(
        path: &Path,
        changed_tx: mpsc::Sender<()>,
        token: &CancellationToken,
    ) -> notify::Result<ConfWatcher> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = raw_tx.blocking_send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watcher error"),
            }
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        debug!(path = %path.display(), "watching configuration file");

        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = raw_rx.recv() => {
                        if event.is_none() {
                            return;
                        }
                        // swallow the burst a single editor save produces
                        loop {
                            match tokio::time::timeout(DEBOUNCE, raw_rx.recv()).await {
                                Ok(Some(())) => continue,
                                Ok(None) => return,
                                Err(_) => break,
                            }
                        }
                        if changed_tx.send(()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ConfWatcher { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn emits_one_trigger_per_save_burst() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livegate.yml");
        std::fs::write(&path, "paths:\n  all_others:\n").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let _watcher = ConfWatcher::new(&path, tx, &token).unwrap();

        // two writes in quick succession: one trigger
        for _ in 0..2 {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            writeln!(f, "# touched").unwrap();
        }

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(got.is_ok(), "expected a reload trigger");
        // no second trigger queued behind it
        let extra = tokio::time::timeout(Duration::from_millis(800), rx.recv()).await;
        assert!(extra.is_err(), "burst should debounce to one trigger");
    }
}
