use anyhow::{bail, Context, Error, Result};
use clap::Parser;
use closer::Closer;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// path to the config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// write the process id here, removed again on shutdown
    #[arg(long, value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// seconds the drain step takes on shutdown
    #[arg(long, default_value_t = 1)]
    drain: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // load config from path
    let config = config::Config::load(args.config)?;

    // init tracing
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level().into())
        .from_env_lossy();
    let _ = FmtSubscriber::builder().with_env_filter(filter).try_init();

    if config.signals.is_empty() {
        bail!("no shutdown signals configured");
    }
    let shutdown = Closer::with_signals(&config.signals)?;
    closer::install(shutdown.clone())?;

    register_cleanup(&shutdown, args.pid_file, Duration::from_secs(args.drain))?;

    info!(
        pid = std::process::id(),
        signals = ?config.signals,
        "wait for shutdown signal"
    );

    match config.timeout() {
        Some(timeout) => {
            if let Err(e) = shutdown.wait_timeout(timeout).await {
                warn!(error = %e, "shutdown incomplete");
            }
        }
        None => shutdown.wait().await,
    }

    info!("shutdown complete");
    Ok(())
}

/// Write the pid file and register its removal, plus the drain step.
/// Removal fails, and is only logged, when the file is already gone.
fn register_cleanup(shutdown: &Closer, pid_file: Option<PathBuf>, drain: Duration) -> Result<()> {
    if let Some(path) = pid_file {
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("write pid file {}", path.display()))?;
        shutdown.add_blocking(move || {
            debug!(path = %path.display(), "remove pid file");
            std::fs::remove_file(&path)
        });
    }

    shutdown.add_named("drain", move || async move {
        debug!(secs = drain.as_secs(), "drain in flight work");
        tokio::time::sleep(drain).await;
        Ok::<_, Error>(())
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("closer-{}-{}.pid", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_cleanup_removes_pid_file() {
        let shutdown = Closer::new();
        let path = pid_path("removed");

        register_cleanup(&shutdown, Some(path.clone()), Duration::ZERO).unwrap();
        assert!(path.exists());
        assert_eq!(shutdown.pending(), 2);

        shutdown.close_all().await;
        assert!(shutdown.is_closed());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_block_shutdown() {
        let shutdown = Closer::new();
        let path = pid_path("missing");

        register_cleanup(&shutdown, Some(path.clone()), Duration::ZERO).unwrap();
        std::fs::remove_file(&path).unwrap();

        tokio::time::timeout(Duration::from_secs(2), shutdown.close_all())
            .await
            .expect("close completes with a failed action");
        assert!(shutdown.is_closed());
    }
}
