//! Vouchers Worker - Main Entry Point
//! Consumes voucher requests from RabbitMQ and answers them on the response queue

mod config;
mod logging;

use anyhow::{Context, Result};
use config::{ProcessorMode, Settings};
use std::sync::Arc;
use tracing::{error, info, warn};
use vouchers_core::application::{
    shutdown_channel, ConnectionManager, ForwardProcessor, ReleasePlanProcessor,
    RequestProcessor, UpstreamCaller, Worker,
};
use vouchers_core::port::Broker;
use vouchers_core::AppError;
use vouchers_infra_amqp::AmqpBroker;
use vouchers_infra_http::ReqwestUpstream;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging
    logging::init(logging::LogFormat::from_env())?;
    info!("Vouchers worker v{} starting...", VERSION);

    // 2. Configuration
    let settings = Settings::load()?;
    info!(
        amqp_url = %settings.amqp_url,
        request_queue = %settings.request_queue,
        response_queue = %settings.response_queue,
        dead_letter_queue = %settings.dead_letter_queue,
        prefetch = settings.prefetch,
        mode = ?settings.processor_mode,
        "Configuration loaded"
    );

    // 3. Wiring
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(settings.amqp_url.clone()));
    let connection = Arc::new(ConnectionManager::new(
        broker,
        settings.amqp_url.connect_policy(),
    ));
    let processor = build_processor(&settings)?;
    let worker = Worker::new(settings.worker_config(), connection, processor);

    // 4. Run until a signal or a fatal connection error
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    info!("Worker ready. Waiting for requests...");

    let joined = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received. Draining in-flight messages...");
            shutdown_tx.shutdown();
            worker_handle.await
        }
        joined = &mut worker_handle => joined,
    };

    match joined.context("Worker task failed")? {
        Ok(()) => {
            info!("Shutdown complete.");
            Ok(())
        }
        Err(e) => {
            let e = AppError::from(e);
            error!(class = e.class(), error = %e, "Worker stopped on unrecoverable failure");
            Err(e).context("Broker connection lost")
        }
    }
}

fn build_processor(settings: &Settings) -> Result<Arc<dyn RequestProcessor>> {
    let caller = match &settings.upstream.base_url {
        Some(base_url) => {
            let client = ReqwestUpstream::new(base_url, settings.upstream.timeout)
                .context("Invalid VOUCHERS_URL")?;
            Some(UpstreamCaller::new(
                Arc::new(client),
                settings.upstream.policy.clone(),
            ))
        }
        None => None,
    };

    let processor: Arc<dyn RequestProcessor> = match (settings.processor_mode, caller) {
        (ProcessorMode::Forward, Some(caller)) => {
            info!(path = %settings.upstream.path, "Forwarding requests to upstream");
            Arc::new(ForwardProcessor::new(caller, settings.upstream.path.clone()))
        }
        (ProcessorMode::Forward, None) => {
            anyhow::bail!("VOUCHERS_URL is required when PROCESSOR_MODE is forward")
        }
        (ProcessorMode::ReleasePlan, caller) => {
            if caller.is_none() {
                warn!("VOUCHERS_URL not set; release plans number vouchers from 1");
            }
            Arc::new(ReleasePlanProcessor::new(caller))
        }
    };
    Ok(processor)
}

/// Ctrl+C everywhere, SIGTERM on unix
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("Failed to listen for Ctrl+C"),
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}
