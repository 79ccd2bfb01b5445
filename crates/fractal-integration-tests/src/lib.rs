//! Helpers for running several Fractal nodes in one process.
//!
//! Every node binds `127.0.0.1:0` and keeps its logs in memory, so tests can
//! run in parallel without clashing over ports or files.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use fractal_node::config::{ComputeConfig, JoinConfig, TransportConfig};
use fractal_node::{BootstrapNode, EventLog, NodeConfig, Result, Role, Running, WorkerNode};
use fractal_protocol::{Job, Point};

/// Config for a loopback node with short timeouts and no log files.
pub fn loopback_config(role: Role, bootstrap: SocketAddr) -> NodeConfig {
    NodeConfig {
        role,
        listen_addr: "127.0.0.1:0".to_string(),
        bootstrap_addr: bootstrap.to_string(),
        log_dir: None,
        jobs_file: None,
        transport: TransportConfig {
            dial_timeout: Duration::from_millis(500),
            accept_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_secs(2),
            ..TransportConfig::default()
        },
        join: JoinConfig {
            timeout: Some(Duration::from_secs(3)),
            attempts: 3,
        },
        evict_on_quit: false,
        compute: ComputeConfig {
            batch: 50,
            interval: Duration::from_millis(10),
        },
    }
}

pub async fn start_bootstrap(catalog: Vec<Job>) -> Result<Running<BootstrapNode>> {
    let unused: SocketAddr = ([127, 0, 0, 1], 0).into();
    let running =
        BootstrapNode::spawn(&loopback_config(Role::Bootstrap, unused), EventLog::silent()).await?;
    for job in catalog {
        running.node().add_job(job).await;
    }
    Ok(running)
}

/// Start a worker from `config` without joining.
pub async fn start_worker_with(config: NodeConfig) -> Result<Running<WorkerNode>> {
    WorkerNode::spawn(&config, EventLog::silent()).await
}

/// Start a worker against `bootstrap` and join the system.
pub async fn join_worker(bootstrap: SocketAddr) -> Result<Running<WorkerNode>> {
    let running = start_worker_with(loopback_config(Role::Worker, bootstrap)).await?;
    running.node().join().await?;
    Ok(running)
}

/// Poll `check` until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Sierpinski triangle on a 600x600 canvas.
pub fn sierpinski(point_count: u64) -> Job {
    Job {
        name: "sierpinski".to_string(),
        width: 600,
        height: 600,
        ratio: 0.5,
        point_count,
        anchors: vec![Point::new(300, 0), Point::new(0, 600), Point::new(600, 600)],
    }
}
