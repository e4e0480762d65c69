use crate::error::ImportError;
use crate::models::statement::StatementMonth;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Extraction
// ============================================================================

/// One charge read from a vendor document. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedLineItem {
    #[validate(length(min = 1, max = 255))]
    pub raw_property: String,
    pub date: Option<NaiveDate>,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255))]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    /// 1-based data row in the source spreadsheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_row: Option<usize>,
}

/// A spreadsheet row that could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

// ============================================================================
// Matching
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Exact,
    Normalized,
    Ai,
    Similarity,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Normalized => "normalized",
            Self::Ai => "ai",
            Self::Similarity => "similarity",
        }
    }
}

/// Advisory resolution of one raw identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMatch {
    pub property_id: Uuid,
    pub confidence: f64,
    pub reason: String,
    pub method: MatchMethod,
}

/// Candidate property offered to the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub property_id: Uuid,
    pub name: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRef {
    pub id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

// ============================================================================
// Preview
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedGroup {
    pub property: PropertyRef,
    pub statement_id: Uuid,
    /// Raw identifiers that resolved to this property.
    pub identifiers: Vec<String>,
    pub confidence: f64,
    pub reason: String,
    pub expenses: Vec<ExtractedLineItem>,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedGroup {
    pub property_name: String,
    pub expenses: Vec<ExtractedLineItem>,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSummary {
    pub matched_property_count: usize,
    pub unmatched_property_count: usize,
    pub matched_expense_count: usize,
    pub unmatched_expense_count: usize,
    pub matched_amount: Decimal,
    pub unmatched_amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreview {
    pub matched: Vec<MatchedGroup>,
    pub unmatched: Vec<UnmatchedGroup>,
    pub summary: PreviewSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatePair {
    pub vendor: String,
    pub description: String,
}

// ============================================================================
// Confirm
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedMatch {
    #[validate(nested)]
    pub property: PropertyRef,
    /// Statement the group lands on; looked up by property when omitted.
    #[serde(default)]
    pub statement_id: Option<Uuid>,
    #[validate(length(min = 1, max = 1000), nested)]
    pub expenses: Vec<ExtractedLineItem>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmImportRequest {
    #[serde(default)]
    pub target_statement_id: Option<Uuid>,
    #[validate(length(min = 1, max = 500), nested)]
    pub approved_matches: Vec<ApprovedMatch>,
    #[serde(default)]
    pub override_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub job_id: Uuid,
    pub status: ImportStatus,
    pub committed_rows: i64,
    pub skipped_rows: i64,
    pub total_rows: i64,
    pub statements_updated: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_statement_id: Option<Uuid>,
}

// ============================================================================
// Import job
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Uploaded,
    Extracted,
    Resolved,
    PreviewReady,
    Committing,
    PartiallyCommitted,
    Committed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::Extracted => "EXTRACTED",
            Self::Resolved => "RESOLVED",
            Self::PreviewReady => "PREVIEW_READY",
            Self::Committing => "COMMITTING",
            Self::PartiallyCommitted => "PARTIALLY_COMMITTED",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only lifecycle; `Committing` never reverses.
    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Uploaded, Extracted)
                | (Uploaded, Failed)
                | (Extracted, Resolved)
                | (Extracted, Failed)
                | (Resolved, PreviewReady)
                | (Resolved, Failed)
                | (PreviewReady, Committing)
                | (PreviewReady, Cancelled)
                | (Committing, Committed)
                | (Committing, PartiallyCommitted)
                | (Committing, Failed)
                | (Committing, Committing)
                | (PartiallyCommitted, Committing)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UPLOADED" => Self::Uploaded,
            "EXTRACTED" => Self::Extracted,
            "RESOLVED" => Self::Resolved,
            "PREVIEW_READY" => Self::PreviewReady,
            "COMMITTING" => Self::Committing,
            "PARTIALLY_COMMITTED" => Self::PartiallyCommitted,
            "COMMITTED" => Self::Committed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            other => {
                return Err(ImportError::Internal(anyhow::anyhow!(
                    "Unknown import status '{}'",
                    other
                )))
            }
        })
    }
}

/// Durable record of one import, from upload to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub job_id: Uuid,
    pub org_id: Uuid,
    pub month: StatementMonth,
    pub vendor: String,
    pub description: String,
    pub file_name: String,
    pub status: ImportStatus,
    pub failure_reason: Option<String>,
    pub committed_rows: i64,
    pub total_rows: i64,
    pub preview: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub created_by: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(
        org_id: Uuid,
        created_by: Uuid,
        month: StatementMonth,
        vendor: String,
        description: String,
        file_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            org_id,
            month,
            vendor,
            description,
            file_name,
            status: ImportStatus::Uploaded,
            failure_reason: None,
            committed_rows: 0,
            total_rows: 0,
            preview: None,
            result: None,
            created_by,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn transition(&mut self, next: ImportStatus) -> Result<(), ImportError> {
        if !self.status.can_transition_to(next) {
            return Err(ImportError::InvalidTransition {
                job_id: self.job_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_utc = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ImportError> {
        self.transition(ImportStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
