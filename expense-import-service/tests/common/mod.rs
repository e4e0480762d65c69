#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use expense_import_service::config::{
    CacheTtlConfig, DatabaseConfig, GenaiConfig, ImportConfig, ImportLimits, MatcherBackend,
    MatcherConfig, RedisConfig,
};
use expense_import_service::middleware::tenant::{ORG_ID_HEADER, USER_ID_HEADER};
use expense_import_service::models::StatementMonth;
use expense_import_service::services::providers::MockTextProvider;
use expense_import_service::services::{init_metrics, MemoryCache, MemoryStore};
use expense_import_service::startup::{router, AppState, Backends};
use http_body_util::BodyExt;
use serde_json::Value;
use service_core::config::Config;
use std::sync::{Arc, Once};
use tower::ServiceExt;
use uuid::Uuid;

static INIT: Once = Once::new();

fn init_once() {
    INIT.call_once(|| {
        init_metrics();
        if std::env::var("TEST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("expense_import_service=debug")
                .with_test_writer()
                .try_init();
        }
    });
}

pub const BOUNDARY: &str = "expense-import-test-boundary";
pub const CSV_HEADER: &str = "property,date,description,vendor,amount\n";

pub fn test_config(limits: ImportLimits, backend: MatcherBackend) -> ImportConfig {
    ImportConfig {
        common: Config::default(),
        environment: "test".to_string(),
        service_name: "expense-import-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig { url: None },
        genai: GenaiConfig {
            api_key: None,
            text_model: "gemini-test".to_string(),
            match_timeout_secs: 2,
            extract_timeout_secs: 2,
        },
        matcher: MatcherConfig {
            backend,
            similarity_threshold: 0.75,
        },
        limits,
        cache: CacheTtlConfig::default(),
    }
}

pub struct TestOptions {
    pub limits: ImportLimits,
    pub backend: MatcherBackend,
    pub ai_enabled: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            limits: ImportLimits::default(),
            backend: MatcherBackend::Similarity,
            ai_enabled: false,
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: MemoryStore,
    pub provider: Arc<MockTextProvider>,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub month: StatementMonth,
    pub sunset_property: Uuid,
    pub sunset_statement: Uuid,
    pub oak_property: Uuid,
    pub oak_statement: Uuid,
}

pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(TestOptions::default())
    }

    /// Router over the in-memory store with two properties that have May 2024 statements.
    pub fn spawn_with(options: TestOptions) -> Self {
        init_once();

        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let month: StatementMonth = "2024-05".parse().unwrap();

        let sunset_property = store.seed_property(org_id, "Sunset Villa", Some("12 Ocean Drive"));
        let sunset_statement = store.seed_statement(org_id, sunset_property, month);
        let oak_property = store.seed_property(org_id, "Oak Court", Some("400 Elm Street"));
        let oak_statement = store.seed_statement(org_id, oak_property, month);

        let provider = Arc::new(MockTextProvider::new(options.ai_enabled));
        let config = test_config(options.limits, options.backend);
        let backends = Backends {
            store: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            cache: Arc::new(MemoryCache::new()),
            provider: provider.clone(),
        };
        let router = router(AppState::new(&config, backends));

        Self {
            router,
            store,
            provider,
            org_id,
            user_id: Uuid::new_v4(),
            month,
            sunset_property,
            sunset_statement,
            oak_property,
            oak_statement,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> ApiResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        ApiResponse { status, body }
    }

    fn tenant(&self, builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder
            .header(ORG_ID_HEADER, self.org_id.to_string())
            .header(USER_ID_HEADER, self.user_id.to_string())
    }

    pub async fn get(&self, path: &str) -> ApiResponse {
        let request = self
            .tenant(Request::builder().method("GET").uri(path))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> ApiResponse {
        let request = self
            .tenant(Request::builder().method("POST").uri(path))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn preview(
        &self,
        file_name: &str,
        content_type: &str,
        data: &[u8],
        month: &str,
    ) -> ApiResponse {
        let body = multipart_body(
            &[("month", month), ("vendor", "Acme"), ("description", "Cleaning")],
            Some((file_name, content_type, data)),
        );
        let request = self
            .tenant(Request::builder().method("POST").uri("/imports/preview"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    pub async fn preview_csv(&self, csv: &str) -> ApiResponse {
        self.preview("may.csv", "text/csv", csv.as_bytes(), "2024-05")
            .await
    }

    pub async fn confirm(&self, job_id: &str, body: &Value) -> ApiResponse {
        self.post_json(&format!("/imports/{}/confirm", job_id), body)
            .await
    }
}

/// Approve every matched group of a preview response as-is.
pub fn approve_all(preview: &Value, override_duplicates: bool) -> Value {
    serde_json::json!({
        "approvedMatches": preview["preview"]["matched"],
        "overrideDuplicates": override_duplicates,
    })
}

pub fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, content_type, data)) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                BOUNDARY, file_name, content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}
