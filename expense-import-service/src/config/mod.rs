//! Configuration module for expense-import-service.

use dotenvy::dotenv;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub common: core_config::Config,
    pub environment: String,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub genai: GenaiConfig,
    pub matcher: MatcherConfig,
    pub limits: ImportLimits,
    pub cache: CacheTtlConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Empty means "no database": the in-memory store is used instead.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenaiConfig {
    pub api_key: Option<String>,
    pub text_model: String,
    pub match_timeout_secs: u64,
    pub extract_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherBackend {
    Llm,
    Similarity,
}

impl MatcherBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Similarity => "similarity",
        }
    }
}

impl FromStr for MatcherBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "similarity" => Ok(Self::Similarity),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCHER_BACKEND must be 'llm' or 'similarity', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub backend: MatcherBackend,
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ImportLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub chunk_size: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            max_bytes: 10 * 1024 * 1024,
            chunk_size: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheTtlConfig {
    pub statements_ttl_secs: u64,
    pub expense_ttl_secs: u64,
    pub mapping_ttl_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            statements_ttl_secs: 300,
            expense_ttl_secs: 300,
            mapping_ttl_secs: 3600,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let common = core_config::Config::load()?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let is_prod = environment == "prod";

        let backend = match env::var("MATCHER_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => MatcherBackend::Llm,
        };

        let api_key = env::var("GOOGLE_API_KEY").ok().filter(|k| !k.is_empty());
        if is_prod && backend == MatcherBackend::Llm && api_key.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "GOOGLE_API_KEY is required when MATCHER_BACKEND=llm in production"
            )));
        }

        let database_url = env::var("DATABASE_URL").unwrap_or_default();
        if is_prod && database_url.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required in production"
            )));
        }

        let limits = ImportLimits::default();
        let ttls = CacheTtlConfig::default();

        Ok(Self {
            common,
            environment,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "expense-import-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: database_url,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            },
            genai: GenaiConfig {
                api_key,
                text_model: env::var("GENAI_TEXT_MODEL")
                    .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
                match_timeout_secs: parse_or("AI_MATCH_TIMEOUT_SECS", 30)?,
                extract_timeout_secs: parse_or("AI_EXTRACT_TIMEOUT_SECS", 90)?,
            },
            matcher: MatcherConfig {
                backend,
                similarity_threshold: parse_or("SIMILARITY_THRESHOLD", 0.75_f64)?.clamp(0.0, 1.0),
            },
            limits: ImportLimits {
                max_rows: parse_or("IMPORT_MAX_ROWS", limits.max_rows)?,
                max_bytes: parse_or("IMPORT_MAX_BYTES", limits.max_bytes)?,
                chunk_size: parse_or("IMPORT_CHUNK_SIZE", limits.chunk_size)?.max(1),
            },
            cache: CacheTtlConfig {
                statements_ttl_secs: parse_or("CACHE_STATEMENTS_TTL_SECS", ttls.statements_ttl_secs)?,
                expense_ttl_secs: parse_or("CACHE_EXPENSE_TTL_SECS", ttls.expense_ttl_secs)?,
                mapping_ttl_secs: parse_or("CACHE_MAPPING_TTL_SECS", ttls.mapping_ttl_secs)?,
            },
        })
    }
}

/// `default` when `key` is unset or empty; a malformed value is an error.
fn parse_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, key, e))
        }),
        _ => Ok(default),
    }
}
