//! echo_server: integrity benchmark server
//!
//! Accepts echo calls carrying inline, attachment or streamed payloads and
//! verifies each one against the digest the client declared. Ask-echo calls
//! generate payloads of the requested size for throughput runs.

use std::sync::Arc;

use stream_echo_rpc::{
    config::ServerConfig,
    server::{EchoRpcServerHandler, RpcServer},
    service::EchoService,
    workerpool::WorkerPool,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_workers = config.max_workers,
        max_jobs = config.max_jobs,
        idle_timeout = ?config.idle_timeout,
        logoff = ?config.logoff,
        max_stream_size = config.max_stream_size,
        "Starting echo server"
    );

    if config.tls.is_configured() {
        warn!(
            certificate = ?config.tls.certificate,
            private_key = ?config.tls.private_key,
            "TLS is not supported by the TCP transport, serving plaintext"
        );
    }

    let worker_pool = Arc::new(WorkerPool::new(config.max_workers, config.max_jobs));
    let handler = EchoRpcServerHandler::new(worker_pool, EchoService::new(config.max_stream_size));
    let mut server = RpcServer::new(config.timeout_options(), config.stream_limits(), handler)
        .with_logoff(config.logoff);
    server.listen(&config.listen).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping server");
    server.stop().await;
    Ok(())
}
