use crate::broadcast::BroadcastManager;
use crate::camera::SimulatedCamera;
use crate::config::Config;
use crate::estimator::WeightEstimator;
use crate::inference::{build_engine, InferencePool};
use crate::pipeline::{DetectionPipeline, PipelineState};
use crate::registry::InMemoryRegistry;
use crate::server::{HttpServer, SharedState};
use crate::store::InMemoryMeasurementStore;
use crate::telemetry::Metrics;

use std::{sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast, task::JoinHandle};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let broadcaster = Arc::new(BroadcastManager::new());
    let estimator = Arc::new(WeightEstimator::new());

    let engine = match build_engine(&config.inference) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to initialize inference engine: {:?}", e);
            return Err(e);
        }
    };
    let inference = InferencePool::new(
        engine,
        config.inference.workers,
        config.inference.timeout(),
    );
    tracing::info!(
        workers = config.inference.workers,
        "Inference engine ready: {}",
        inference.model_info().model_name
    );

    let pipeline = Arc::new(
        DetectionPipeline::new(
            Box::new(SimulatedCamera::new(config.camera.clone())),
            inference.clone(),
            Arc::clone(&estimator),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryMeasurementStore::new()),
            Arc::clone(&broadcaster),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    let state = SharedState {
        pipeline: Arc::clone(&pipeline),
        broadcaster: Arc::clone(&broadcaster),
        inference,
        estimator,
        metrics: Arc::clone(&metrics),
        pipeline_defaults: config.pipeline.clone(),
        live_feed: config.live_feed.clone(),
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let heartbeat_handle = spawn_heartbeat(
        Arc::clone(&broadcaster),
        Arc::clone(&metrics),
        Duration::from_secs(config.live_feed.heartbeat_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    );

    if config.autostart {
        if let Err(e) = pipeline.start(config.pipeline.clone()).await {
            tracing::error!("Failed to autostart detection pipeline: {}", e);
        }
    }

    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    if pipeline.state() == PipelineState::Running {
        if let Err(e) = pipeline.stop().await {
            tracing::error!("Failed to stop detection pipeline: {}", e);
        }
    }
    broadcaster.close_all();

    let _ = shutdown_tx.send(());
    let _ = heartbeat_handle.await;
    server_handle.await??;

    Ok(())
}

fn spawn_heartbeat(
    broadcaster: Arc<BroadcastManager>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let report = broadcaster.heartbeat();
                    metrics.record_live_connections(broadcaster.active_connections());
                    tracing::debug!(
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "Heartbeat sent"
                    );
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
