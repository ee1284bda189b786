//! External command hooks.
//!
//! Paths run configured commands on lifecycle edges (`run_on_init`,
//! `run_on_demand`, `run_on_ready`, `run_on_read`). Every command is a child
//! process scoped to its owner: cancelling the owner kills the child. The
//! pool's close waits for all children to be reaped.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const RESTART_PAUSE: Duration = Duration::from_secs(1);

type OnExit = Box<dyn Fn(i32) + Send + Sync>;

/// Supervisor scope for every spawned hook.
pub struct CmdPool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl CmdPool {
    pub fn new() -> Self {
        CmdPool {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Cancel every child and wait for all of them to be reaped.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for CmdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one running (and possibly restarting) hook command.
pub struct Cmd {
    token: CancellationToken,
}

impl Cmd {
    /// Spawn `cmdline` with `env` added to the environment. With `restart`,
    /// the command is relaunched after it exits, until closed.
    pub fn new(
        pool: &CmdPool,
        cmdline: &str,
        restart: bool,
        env: HashMap<String, String>,
        on_exit: Option<OnExit>,
    ) -> Cmd {
        let token = pool.token.child_token();
        let cmdline = expand_placeholders(cmdline, &env);
        let run_token = token.clone();
        pool.tracker.spawn(async move {
            run_loop(run_token, cmdline, restart, env, on_exit).await;
        });
        Cmd { token }
    }

    /// Stop the command (and its restart loop). Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Replace `%ENV_VAR` placeholders in the command line with hook environment
/// values.
fn expand_placeholders(cmdline: &str, env: &HashMap<String, String>) -> String {
    let mut out = cmdline.to_owned();
    for (key, value) in env {
        out = out.replace(&format!("%{key}"), value);
    }
    out
}

async fn run_loop(
    token: CancellationToken,
    cmdline: String,
    restart: bool,
    env: HashMap<String, String>,
    on_exit: Option<OnExit>,
) {
    loop {
        let mut parts = cmdline.split_whitespace();
        let Some(program) = parts.next() else {
            warn!("empty hook command line");
            return;
        };
        let spawned = Command::new(program)
            .args(parts)
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                warn!(cmd = %cmdline, error = %e, "hook command failed to start");
                if let Some(cb) = &on_exit {
                    cb(-1);
                }
                return;
            }
        };
        debug!(cmd = %cmdline, "hook command started");

        tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "hook command already gone");
                }
                let _ = child.wait().await;
                debug!(cmd = %cmdline, "hook command stopped");
                return;
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                debug!(cmd = %cmdline, code, "hook command exited");
                if let Some(cb) = &on_exit {
                    cb(code);
                }
                if !restart {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[tokio::test]
    async fn command_runs_and_reports_exit() {
        let pool = CmdPool::new();
        let code = Arc::new(AtomicI32::new(i32::MIN));
        let code2 = code.clone();
        let _cmd = Cmd::new(
            &pool,
            "true",
            false,
            HashMap::new(),
            Some(Box::new(move |c| code2.store(c, Ordering::SeqCst))),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(code.load(Ordering::SeqCst), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn close_kills_long_running_child() {
        let pool = CmdPool::new();
        let cmd = Cmd::new(&pool, "sleep 60", false, HashMap::new(), None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cmd.close();
        // close() must reap everything promptly
        tokio::time::timeout(Duration::from_secs(2), pool.close())
            .await
            .expect("pool close should not hang on a killed child");
    }

    #[tokio::test]
    async fn placeholders_are_expanded() {
        let mut env = HashMap::new();
        env.insert("MTX_PATH".to_owned(), "cam1".to_owned());
        assert_eq!(
            expand_placeholders("echo %MTX_PATH", &env),
            "echo cam1".to_owned()
        );
    }
}
