use clap::Parser;
use kdht_core::config::NodeConfig;
use kdht_core::Node;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kdht-server", about = "Kademlia-style DHT node")]
struct Args {
    /// Path to a config file (without extension; `config` crate resolves
    /// `.yaml`/`.yml`/etc). Missing file is not an error — defaults apply.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref()).map_err(|e| e.to_string())?;

    let node = Node::bind(config).await.map_err(|e| e.to_string())?;
    tracing::info!(node_id = %node.node_id(), "kdht node started");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .map_err(|e| e.to_string())?;

    let shutdown_requested = async {
        while !shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    };

    // Race the Ctrl+C poll against the correlator's own task: a fatal
    // protocol-invariant panic (time warp, message-to-ourselves) aborts that
    // task, and this process should exit non-zero rather than keep serving
    // from a dead correlator.
    tokio::select! {
        _ = shutdown_requested => {
            tracing::info!("shutdown requested, exiting");
            Ok(())
        }
        join_result = node.join() => match join_result {
            Ok(()) => {
                tracing::error!("net correlator exited unexpectedly");
                Err("net correlator exited unexpectedly".to_string())
            }
            Err(err) => {
                tracing::error!(%err, "net correlator panicked");
                Err(format!("net correlator panicked: {err}"))
            }
        },
    }
}
