use crate::agent::{AgentRunner, Tool};
use crate::camera::{FrameCapturer, JpegFrameEncoder, OpenCvSource};
use crate::config::Config;
use crate::cycle::MonitoringCycle;
use crate::llm::OpenAiClient;
use crate::scheduler::Scheduler;
use crate::server::HttpServer;
use crate::telemetry::Metrics;
use crate::tools::CaptureFrameTool;

use std::{error::Error, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new()?);

    let model = match OpenAiClient::new(&config.llm) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to initialize model client: {:?}", e);
            return Err(Box::new(e));
        }
    };

    for camera in config.cameras.all() {
        if let Some(parent) = camera.frame_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let capturer = Arc::new(FrameCapturer::new(
        OpenCvSource,
        JpegFrameEncoder::new(config.cameras.jpeg_quality),
    ));
    let capture_tool: Arc<dyn Tool> = Arc::new(CaptureFrameTool::new(
        capturer,
        config.cameras.clone(),
        config.llm.image_detail.clone(),
        metrics.clone(),
    ));

    let cycle = MonitoringCycle::new(
        config.clone(),
        AgentRunner::new(model, config.llm.max_turns),
        capture_tool,
        metrics.clone(),
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let server_handle = if config.server.enabled {
        let server = HttpServer::new(metrics.clone(), &config.server).await?;
        Some(server.run(shutdown_tx.subscribe()).await?)
    } else {
        None
    };

    let scheduler_shutdown_rx = shutdown_tx.subscribe();
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, starting graceful shutdown.");
        let _ = signal_tx.send(());
    });

    let mut scheduler = Scheduler::new(cycle, Duration::from_secs(config.scheduler.interval_secs));
    scheduler.run(scheduler_shutdown_rx).await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = server_handle {
        match handle.await {
            Ok(Err(e)) => tracing::error!("Metrics server failed: {:?}", e),
            Err(e) => tracing::error!("Metrics server task panicked: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
