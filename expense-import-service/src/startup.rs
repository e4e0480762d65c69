use crate::config::{ImportConfig, MatcherBackend};
use crate::handlers;
use crate::import::{
    DocumentExtractor, ImportService, LlmPropertyMatcher, PropertyMatcher, PropertyResolver,
    ReconciliationEngine, SimilarityMatcher,
};
use crate::services::providers::{GeminiConfig, GeminiTextProvider, MockTextProvider, TextProvider};
use crate::services::{
    CacheStore, Database, ExpenseStore, ImportCache, JobStore, MemoryCache, MemoryStore,
    RedisCache,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Multipart framing on top of the document itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Storage, cache and AI collaborators the service is assembled from.
pub struct Backends {
    pub store: Arc<dyn ExpenseStore>,
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<dyn CacheStore>,
    pub provider: Arc<dyn TextProvider>,
}

#[derive(Clone)]
pub struct AppState {
    pub imports: Arc<ImportService>,
    pub cache: ImportCache,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(config: &ImportConfig, backends: Backends) -> Self {
        let cache = ImportCache::new(backends.cache, config.cache.clone());

        let matcher: Arc<dyn PropertyMatcher> = match config.matcher.backend {
            MatcherBackend::Llm => Arc::new(LlmPropertyMatcher::new(backends.provider.clone())),
            MatcherBackend::Similarity => {
                Arc::new(SimilarityMatcher::new(config.matcher.similarity_threshold))
            }
        };

        let extractor = Arc::new(DocumentExtractor::new(
            backends.provider,
            config.limits.clone(),
            Duration::from_secs(config.genai.extract_timeout_secs),
        ));
        let resolver = Arc::new(PropertyResolver::new(
            matcher,
            cache.clone(),
            Duration::from_secs(config.genai.match_timeout_secs),
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            backends.store.clone(),
            cache.clone(),
            config.limits.chunk_size,
        ));

        let imports = Arc::new(ImportService::new(
            backends.store,
            backends.jobs,
            cache.clone(),
            extractor,
            resolver,
            engine,
        ));

        Self {
            imports,
            cache,
            request_timeout: Duration::from_secs(config.common.request_timeout_secs),
            max_upload_bytes: config.limits.max_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let imports = Router::new()
        .route("/imports/preview", post(handlers::preview_import))
        .route("/imports/:job_id", get(handlers::get_import))
        .route("/imports/:job_id/confirm", post(handlers::confirm_import))
        .route("/imports/:job_id/cancel", post(handlers::cancel_import))
        .layer(DefaultBodyLimit::max(
            state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(imports)
        .route_layer(from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(state.request_timeout))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    org_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
}

impl Application {
    pub async fn build(config: ImportConfig) -> Result<Self, AppError> {
        let (store, jobs): (Arc<dyn ExpenseStore>, Arc<dyn JobStore>) =
            if config.database.url.is_empty() {
                tracing::warn!("DATABASE_URL not set; using the in-memory store");
                let memory = MemoryStore::new();
                (Arc::new(memory.clone()), Arc::new(memory))
            } else {
                let db = Database::new(
                    &config.database.url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to PostgreSQL: {}", e);
                    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!("Failed to run migrations: {}", e);
                    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                })?;
                (Arc::new(db.clone()), Arc::new(db))
            };

        let index_ttl = config
            .cache
            .statements_ttl_secs
            .max(config.cache.expense_ttl_secs)
            .max(config.cache.mapping_ttl_secs);
        let cache: Arc<dyn CacheStore> = match &config.redis.url {
            Some(url) => Arc::new(RedisCache::new(url, index_ttl).await.map_err(|e| {
                tracing::error!("Failed to connect to Redis: {}", e);
                AppError::InternalError(e)
            })?),
            None => {
                tracing::warn!("REDIS_URL not set; using the in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        let provider: Arc<dyn TextProvider> = match &config.genai.api_key {
            Some(api_key) => Arc::new(
                GeminiTextProvider::new(GeminiConfig {
                    api_key: api_key.clone(),
                    model: config.genai.text_model.clone(),
                })
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e.to_string())))?,
            ),
            None => {
                tracing::warn!("GOOGLE_API_KEY not set; PDF extraction and AI matching are unavailable");
                Arc::new(MockTextProvider::new(false))
            }
        };

        tracing::info!(
            matcher = config.matcher.backend.as_str(),
            chunk_size = config.limits.chunk_size,
            "Import pipeline configured"
        );

        let state = AppState::new(
            &config,
            Backends {
                store,
                jobs,
                cache,
                provider,
            },
        );
        let app = router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .into_future();

        Ok(Self {
            port,
            server: Box::new(server),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}
