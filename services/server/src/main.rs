// livegate: multi-protocol live media server.

use clap::Parser;
use server::conf::Conf;
use server::core::Core;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "livegate", version, about = "Multi-protocol live media server")]
struct Args {
    /// Path to the configuration file.
    #[arg(default_value = "livegate.yml")]
    conf_path: PathBuf,
}

fn main() {
    let args = Args::parse();

    let conf = match Conf::load(&args.conf_path) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(conf.global.log_level.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "livegate starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    runtime.block_on(async move {
        let core = match Core::new(conf, Some(args.conf_path)).await {
            Ok(core) => core,
            Err(e) => {
                eprintln!("FATAL: {e}");
                std::process::exit(1);
            }
        };
        run_until_signal(core).await;
    });
}

async fn run_until_signal(mut core: Core) {
    let token = core.token();

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing the SIGTERM handler cannot fail");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = core.run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down (SIGINT)"),
        _ = terminate => info!("shutting down (SIGTERM)"),
    }
    token.cancel();
    core.close().await;
}
