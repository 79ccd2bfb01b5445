//! Fractal node binary
//!
//! Runs a bootstrap or a worker, configured from `FRACTAL_*` environment
//! variables.

use fractal_node::config::{split_host_port, DEFAULT_LOG_FILTER};
use fractal_node::{BootstrapNode, EventLog, NodeConfig, Role, WorkerNode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fractal_logging::init_tracing(DEFAULT_LOG_FILTER);

    let config = NodeConfig::from_env()?;
    let (_, port) = split_host_port(&config.listen_addr)?;
    let name = match config.role {
        Role::Bootstrap => format!("bootstrap-{port}"),
        Role::Worker => format!("worker-{port}"),
    };

    // Logging itself cannot proceed without its files.
    let (log, writers) = match &config.log_dir {
        Some(dir) => {
            let (log, writers) = EventLog::open(dir, &name).await?;
            (log, Some(writers))
        }
        None => (EventLog::silent(), None),
    };

    tracing::info!("Starting {name} on {}", config.listen_addr);

    match config.role {
        Role::Bootstrap => {
            let running = BootstrapNode::spawn(&config, log).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            running.stop().await;
        }
        Role::Worker => {
            let running = WorkerNode::spawn(&config, log.clone()).await?;
            match running.node().join().await {
                Ok(me) => tracing::info!("Joined as {me}"),
                Err(e) => {
                    log.error(format!("could not join: {e}"));
                    running.stop().await;
                    if let Some(writers) = writers {
                        writers.finish().await?;
                    }
                    return Err(e.into());
                }
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            if let Err(e) = running.node().leave().await {
                log.error(format!("leave failed: {e}"));
            }
            running.stop().await;
        }
    }

    if let Some(writers) = writers {
        writers.finish().await?;
    }
    Ok(())
}
