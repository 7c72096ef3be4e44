mod render;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use threat_hud_capture::{Camera, CaptureAnalysisLoop, HttpClassifier, LoopSettings};
use threat_hud_common::config::Config;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load_or_default(&config_path) {
        Ok(c) => c.with_env_overrides(),
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let settings = LoopSettings::from(&config.capture);
    info!(
        camera_mode = config.camera.mode,
        camera_url = config.camera.url,
        analyze_url = config.backend.analyze_url(),
        interval_ms = config.capture.interval_ms,
        quality = settings.jpeg_quality,
        "starting threat HUD"
    );

    let camera = match Camera::from_config(&config.camera) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid camera configuration");
            std::process::exit(1);
        }
    };
    let classifier = match HttpClassifier::new(&config.backend, settings.request_timeout) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to create backend client");
            std::process::exit(1);
        }
    };

    let hud = Arc::new(CaptureAnalysisLoop::new(camera, classifier, settings));
    tokio::spawn(render::run_console_renderer(hud.subscribe()));

    if config.hud.autostart {
        hud.start().await;
    }

    let app = routes::router(Arc::clone(&hud));
    let addr = config.hud.bind.clone();
    info!(addr, "HUD control server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HUD control server failed");
    }

    // Release the camera before exiting.
    hud.stop().await;
    info!("threat HUD shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
