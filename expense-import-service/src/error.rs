//! Error taxonomy of the import pipeline.

use crate::models::{DuplicatePair, ImportStatus};
use crate::services::metrics::record_error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use service_core::error::ErrorBody;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0}")]
    Validation(String),

    #[error("Validation error: {0}")]
    Rejected(#[from] validator::ValidationErrors),

    #[error("{0}")]
    NotFound(String),

    #[error("AI service unavailable: {0}")]
    AiServiceUnavailable(String),

    #[error("{0}")]
    NoExpensesFound(String),

    #[error("{0}")]
    NoPropertiesMatched(String),

    #[error("Possible duplicate import for {month}: {} already imported", describe_pairs(.duplicates))]
    PossibleDuplicate {
        month: String,
        duplicates: Vec<DuplicatePair>,
    },

    #[error("Import partially committed: {committed_rows} of {total_rows} rows committed")]
    PartialCommitFailure {
        job_id: Uuid,
        committed_rows: i64,
        remaining_rows: i64,
        total_rows: i64,
    },

    #[error("Import {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: ImportStatus,
        to: ImportStatus,
    },

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn describe_pairs(pairs: &[DuplicatePair]) -> String {
    pairs
        .iter()
        .map(|p| format!("{} / {}", p.vendor, p.description))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ImportError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Rejected(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::AiServiceUnavailable(_) => "ai_service_unavailable",
            Self::NoExpensesFound(_) => "no_expenses_found",
            Self::NoPropertiesMatched(_) => "no_properties_matched",
            Self::PossibleDuplicate { .. } => "possible_duplicate",
            Self::PartialCommitFailure { .. } => "partial_commit_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ImportError {
    fn into_response(self) -> Response {
        let code = self.error_type();
        record_error(code);

        let (status, body) = match &self {
            ImportError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ErrorBody::new(code, msg.clone()))
            }
            ImportError::Rejected(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorBody::new(code, "Validation error").with_details(json!(errors)),
            ),
            ImportError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorBody::new(code, msg.clone())),
            ImportError::AiServiceUnavailable(msg) => {
                tracing::warn!(error = %msg, "AI service unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody::new(code, "AI service unavailable, please retry")
                        .with_details(json!({ "retryable": true })),
                )
            }
            ImportError::NoExpensesFound(msg) | ImportError::NoPropertiesMatched(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorBody::new(code, msg.clone()),
            ),
            ImportError::PossibleDuplicate { duplicates, month } => (
                StatusCode::CONFLICT,
                ErrorBody::new(code, self.to_string()).with_details(json!({
                    "month": month,
                    "duplicates": duplicates,
                    "overridable": true,
                })),
            ),
            ImportError::PartialCommitFailure {
                job_id,
                committed_rows,
                remaining_rows,
                total_rows,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(code, self.to_string()).with_details(json!({
                    "jobId": job_id,
                    "committedRows": committed_rows,
                    "remainingRows": remaining_rows,
                    "totalRows": total_rows,
                })),
            ),
            ImportError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, ErrorBody::new(code, self.to_string()))
            }
            ImportError::Storage(err) => {
                tracing::error!(error = %err, "Storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new(code, "Storage error"),
                )
            }
            ImportError::Internal(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new(code, "Internal server error"),
                )
            }
        };

        body.into_response_with(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        let cases = [
            (ImportError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ImportError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (
                ImportError::AiServiceUnavailable("timeout".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ImportError::NoExpensesFound("empty".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ImportError::NoPropertiesMatched("none".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ImportError::PossibleDuplicate {
                    month: "2024-01".into(),
                    duplicates: vec![],
                },
                StatusCode::CONFLICT,
            ),
            (
                ImportError::PartialCommitFailure {
                    job_id: Uuid::nil(),
                    committed_rows: 300,
                    remaining_rows: 400,
                    total_rows: 700,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ImportError::Storage(anyhow::anyhow!("connection reset")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn duplicate_message_names_pairs() {
        let error = ImportError::PossibleDuplicate {
            month: "2024-02".into(),
            duplicates: vec![DuplicatePair {
                vendor: "Acme".into(),
                description: "Cleaning".into(),
            }],
        };
        assert_eq!(
            error.to_string(),
            "Possible duplicate import for 2024-02: Acme / Cleaning already imported"
        );
    }

    #[test]
    fn partial_failure_message_names_counts() {
        let error = ImportError::PartialCommitFailure {
            job_id: Uuid::nil(),
            committed_rows: 300,
            remaining_rows: 400,
            total_rows: 700,
        };
        assert_eq!(
            error.to_string(),
            "Import partially committed: 300 of 700 rows committed"
        );
    }
}
