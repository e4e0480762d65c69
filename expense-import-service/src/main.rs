use expense_import_service::config::ImportConfig;
use expense_import_service::services::init_metrics;
use expense_import_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Metrics registry must exist before the first request is recorded
    init_metrics();

    let config = ImportConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        environment = %config.environment,
        version = %config.service_version,
        "Starting expense import service"
    );

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    tracing::info!("HTTP server listening on port {}", application.port());

    application.run_until_stopped().await
}
