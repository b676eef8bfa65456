use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{FluxLoader, JpegEncoder, ModelManager, Orchestrator};
use kiln_server::{init_tracing, router, AppState, Config};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    init_tracing(config.log_json);

    // Fail before loading gigabytes of weights if the encoder is missing.
    let mut encoder = JpegEncoder::resolve(&config.encoder, &config.encoder_search_path.0)?;
    if let Some(dir) = &config.tmp_dir {
        encoder = encoder.with_temp_dir(dir);
    }
    info!(encoder = %encoder.program().display(), "resolved JPEG encoder");

    let models = Arc::new(ModelManager::new());
    let orchestrator = Orchestrator::new(models.clone(), encoder).with_quality(config.jpeg_quality);
    let app = router(AppState(Arc::new(orchestrator)));

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);

    // /health answers while the weights load
    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(stop_rx))
            .await
    });

    if let Err(e) = models
        .start(&FluxLoader::default(), &config.model_path, config.device)
        .await
    {
        error!("failed to load model: {e}");
        stop_tx.send_replace(true);
        server.await??;
        return Err(e.into());
    }

    server.await??;
    info!("server stopped, releasing model");
    models.stop().await;
    Ok(())
}

async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stopped = async {
        if stop.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = stopped => info!("shutting down"),
    }
}
