//! Import orchestration: drives a job from upload through commit.

use crate::error::ImportError;
use crate::import::duplicate_guard::DuplicateGuard;
use crate::import::extractor::{DocumentExtractor, UploadedDocument};
use crate::import::preview::build_preview;
use crate::import::reconcile::{ApprovedGroup, CommitPlan, ReconciliationEngine};
use crate::import::resolver::PropertyResolver;
use crate::models::{
    CommitReport, ConfirmImportRequest, DuplicatePair, ExtractedLineItem, ImportJob,
    ImportPreview, ImportStatus, MatchCandidate, MonthStatement, RowError, StatementMonth,
};
use crate::services::cache::ImportCache;
use crate::services::metrics::record_import_stage;
use crate::services::store::{ExpenseStore, JobStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

/// Attempts at recording a job's outcome once its rows are committed.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

/// Upload plus the import's target.
#[derive(Debug, Clone)]
pub struct PreviewRequest {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub month: StatementMonth,
    pub vendor: String,
    pub description: String,
    pub document: UploadedDocument,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub job_id: Uuid,
    pub status: ImportStatus,
    pub preview: ImportPreview,
    pub possible_duplicates: Vec<DuplicatePair>,
    pub row_errors: Vec<RowError>,
    /// Fuzzy matching was unavailable; some identifiers may be unmatched because of it.
    pub degraded: bool,
}

pub struct ImportService {
    store: Arc<dyn ExpenseStore>,
    jobs: Arc<dyn JobStore>,
    cache: ImportCache,
    extractor: Arc<DocumentExtractor>,
    resolver: Arc<PropertyResolver>,
    guard: DuplicateGuard,
    engine: Arc<ReconciliationEngine>,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        jobs: Arc<dyn JobStore>,
        cache: ImportCache,
        extractor: Arc<DocumentExtractor>,
        resolver: Arc<PropertyResolver>,
        engine: Arc<ReconciliationEngine>,
    ) -> Self {
        let guard = DuplicateGuard::new(store.clone(), cache.clone());
        Self {
            store,
            jobs,
            cache,
            extractor,
            resolver,
            guard,
            engine,
        }
    }

    /// Month statements, cache first.
    pub async fn month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
    ) -> Result<Vec<MonthStatement>, ImportError> {
        if let Some(cached) = self.cache.get_month_statements(org_id, month).await {
            return Ok(cached);
        }
        let statements = self.store.month_statements(org_id, month).await?;
        self.cache
            .put_month_statements(org_id, month, &statements)
            .await;
        Ok(statements)
    }

    // =========================================================================
    // Preview
    // =========================================================================

    #[instrument(
        skip(self, request),
        fields(org_id = %request.org_id, month = %request.month, file_name = %request.document.file_name)
    )]
    pub async fn preview(&self, request: PreviewRequest) -> Result<PreviewResponse, ImportError> {
        let vendor = required_text("vendor", &request.vendor)?;
        let description = required_text("description", &request.description)?;

        let mut job = ImportJob::new(
            request.org_id,
            request.user_id,
            request.month,
            vendor,
            description,
            request.document.file_name.clone(),
        );
        self.jobs.create_job(&job).await?;
        tracing::info!(job_id = %job.job_id, "Import job created");

        match self.run_preview(&mut job, &request.document).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.fail_job(&mut job, &e).await;
                Err(e)
            }
        }
    }

    async fn run_preview(
        &self,
        job: &mut ImportJob,
        document: &UploadedDocument,
    ) -> Result<PreviewResponse, ImportError> {
        let statements = self.month_statements(job.org_id, job.month).await?;
        let property_names: Vec<String> =
            statements.iter().map(|s| s.property_name.clone()).collect();

        let extraction = self.extractor.extract(document, &property_names).await?;
        job.total_rows = extraction.items.len() as i64;
        job.transition(ImportStatus::Extracted)?;
        self.jobs.update_job(job).await?;

        let candidates: Vec<MatchCandidate> = statements
            .iter()
            .map(|s| MatchCandidate {
                property_id: s.property_id,
                name: s.property_name.clone(),
                address: s.address.clone(),
            })
            .collect();
        let identifiers: Vec<String> = extraction
            .items
            .iter()
            .map(|item| item.raw_property.clone())
            .collect();
        let resolution = self
            .resolver
            .resolve(job.org_id, job.month, &identifiers, &candidates)
            .await;
        job.transition(ImportStatus::Resolved)?;
        self.jobs.update_job(job).await?;

        if resolution.matches.is_empty() {
            if resolution.degraded {
                return Err(ImportError::AiServiceUnavailable(
                    "property matching is unavailable".to_string(),
                ));
            }
            return Err(ImportError::NoPropertiesMatched(format!(
                "None of the properties in '{}' matched a statement for {}",
                job.file_name, job.month
            )));
        }

        let preview = build_preview(&extraction.items, &resolution.matches, &statements);

        let pairs: BTreeSet<DuplicatePair> = preview
            .matched
            .iter()
            .flat_map(|group| &group.expenses)
            .map(|item| pair_for(item, job))
            .collect();
        let possible_duplicates = self
            .guard
            .find_duplicates(job.org_id, job.month, &pairs)
            .await?;

        job.preview = Some(serde_json::to_value(&preview).map_err(anyhow::Error::from)?);
        job.transition(ImportStatus::PreviewReady)?;
        self.jobs.update_job(job).await?;
        record_import_stage("preview", "success");

        tracing::info!(
            job_id = %job.job_id,
            matched = preview.summary.matched_expense_count,
            unmatched = preview.summary.unmatched_expense_count,
            duplicates = possible_duplicates.len(),
            "Import preview ready"
        );

        Ok(PreviewResponse {
            job_id: job.job_id,
            status: job.status,
            preview,
            possible_duplicates,
            row_errors: extraction.row_errors,
            degraded: resolution.degraded,
        })
    }

    // =========================================================================
    // Confirm
    // =========================================================================

    /// Commit an approved selection. The commit runs in its own task so a
    /// dropped request cannot interrupt it.
    ///
    /// A job left in `COMMITTING` (crash, lost status write) may be confirmed
    /// again; rows it already wrote are skipped by their import keys.
    #[instrument(skip(self, request), fields(org_id = %org_id, job_id = %job_id))]
    pub async fn confirm(
        self: &Arc<Self>,
        org_id: Uuid,
        user_id: Uuid,
        job_id: Uuid,
        request: ConfirmImportRequest,
    ) -> Result<CommitReport, ImportError> {
        request.validate()?;

        let mut job = self.load_job(org_id, job_id).await?;
        if !job.status.can_transition_to(ImportStatus::Committing) {
            return Err(ImportError::InvalidTransition {
                job_id,
                from: job.status,
                to: ImportStatus::Committing,
            });
        }

        let statements = self.store.month_statements(org_id, job.month).await?;
        if let Some(target) = request.target_statement_id {
            if !statements.iter().any(|s| s.statement_id == target) {
                return Err(ImportError::NotFound(format!(
                    "Statement {} not found for {}",
                    target, job.month
                )));
            }
        }
        let groups = resolve_groups(&request, &statements, job.month)?;

        let mut pairs: BTreeSet<DuplicatePair> = groups
            .iter()
            .flat_map(|g| &g.expenses)
            .map(|item| pair_for(item, &job))
            .collect();
        if matches!(
            job.status,
            ImportStatus::PartiallyCommitted | ImportStatus::Committing
        ) {
            for own in self.store.imported_pairs(job_id).await? {
                pairs.remove(&own);
            }
        }
        let duplicates = self.guard.find_duplicates(org_id, job.month, &pairs).await?;
        DuplicateGuard::enforce(job.month, duplicates, request.override_duplicates)?;

        let plan = CommitPlan {
            job_id,
            org_id,
            month: job.month,
            acting_user: user_id,
            default_vendor: job.vendor.clone(),
            default_description: job.description.clone(),
            groups,
        };
        job.transition(ImportStatus::Committing)?;
        job.total_rows = plan.rows().len() as i64;
        self.jobs.update_job(&job).await?;

        let this = Arc::clone(self);
        let target_statement_id = request.target_statement_id;
        tokio::spawn(async move { this.run_commit(job, plan, target_statement_id).await })
            .await
            .map_err(|e| ImportError::Internal(anyhow::anyhow!("Commit task failed: {}", e)))?
    }

    async fn run_commit(
        &self,
        mut job: ImportJob,
        plan: CommitPlan,
        target_statement_id: Option<Uuid>,
    ) -> Result<CommitReport, ImportError> {
        match self.engine.commit(&plan).await {
            Ok(outcome) => {
                // Skipped rows were written by this job on an earlier attempt.
                job.committed_rows = (outcome.inserted_rows + outcome.skipped_rows) as i64;
                job.transition(ImportStatus::Committed)?;
                let report = CommitReport {
                    job_id: job.job_id,
                    status: job.status,
                    committed_rows: job.committed_rows,
                    skipped_rows: outcome.skipped_rows as i64,
                    total_rows: job.total_rows,
                    statements_updated: outcome.statements_updated,
                    target_statement_id,
                };
                job.result = Some(serde_json::to_value(&report).map_err(anyhow::Error::from)?);
                self.record_outcome(&job).await;
                Ok(report)
            }
            Err(failure) => {
                job.committed_rows += failure.progress.inserted_rows as i64;
                let committed = job.committed_rows;
                let total = job.total_rows;

                if committed > 0 {
                    job.transition(ImportStatus::PartiallyCommitted)?;
                    job.failure_reason = Some(failure.error.to_string());
                    let error = ImportError::PartialCommitFailure {
                        job_id: job.job_id,
                        committed_rows: committed,
                        remaining_rows: (total - committed).max(0),
                        total_rows: total,
                    };
                    job.result = Some(serde_json::json!({
                        "committedRows": committed,
                        "remainingRows": (total - committed).max(0),
                        "totalRows": total,
                    }));
                    self.record_outcome(&job).await;
                    Err(error)
                } else {
                    job.fail(failure.error.to_string())?;
                    self.record_outcome(&job).await;
                    Err(failure.error)
                }
            }
        }
    }

    /// Persist the job's post-commit state, retrying briefly. If every attempt
    /// fails the job stays `COMMITTING` and can be confirmed again.
    async fn record_outcome(&self, job: &ImportJob) {
        for attempt in 1..=OUTCOME_WRITE_ATTEMPTS {
            match self.jobs.update_job(job).await {
                Ok(()) => return,
                Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt = attempt,
                        error = %e,
                        "Job status write failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    record_import_stage("commit", "status_write_failed");
                    tracing::error!(
                        job_id = %job.job_id,
                        status = job.status.as_str(),
                        error = %e,
                        "Could not record commit outcome; job remains COMMITTING"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn cancel(&self, org_id: Uuid, job_id: Uuid) -> Result<ImportJob, ImportError> {
        let mut job = self.load_job(org_id, job_id).await?;
        job.transition(ImportStatus::Cancelled)?;
        self.jobs.update_job(&job).await?;
        record_import_stage("cancel", "success");
        tracing::info!(job_id = %job_id, "Import cancelled");
        Ok(job)
    }

    pub async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<ImportJob, ImportError> {
        self.load_job(org_id, job_id).await
    }

    pub async fn health_check(&self) -> Result<(), ImportError> {
        self.store.health_check().await
    }

    async fn load_job(&self, org_id: Uuid, job_id: Uuid) -> Result<ImportJob, ImportError> {
        self.jobs
            .get_job(org_id, job_id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("Import job {} not found", job_id)))
    }

    /// Best effort: mark a pre-commit failure on the job.
    async fn fail_job(&self, job: &mut ImportJob, error: &ImportError) {
        record_import_stage(job.status.as_str(), "failed");
        if !job.status.can_transition_to(ImportStatus::Failed) {
            return;
        }
        if job.fail(error.to_string()).is_ok() {
            if let Err(e) = self.jobs.update_job(job).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "Could not record job failure");
            }
        }
    }
}

fn required_text(field: &str, value: &str) -> Result<String, ImportError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ImportError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > 255 {
        return Err(ImportError::Validation(format!(
            "{} must be at most 255 characters",
            field
        )));
    }
    Ok(value.to_string())
}

fn pair_for(item: &ExtractedLineItem, job: &ImportJob) -> DuplicatePair {
    DuplicatePair {
        vendor: item.vendor.clone().unwrap_or_else(|| job.vendor.clone()),
        description: item
            .description
            .clone()
            .unwrap_or_else(|| job.description.clone()),
    }
}

/// Bind every approved match to a statement of the import's month.
fn resolve_groups(
    request: &ConfirmImportRequest,
    statements: &[MonthStatement],
    month: StatementMonth,
) -> Result<Vec<ApprovedGroup>, ImportError> {
    let by_statement: HashMap<Uuid, &MonthStatement> =
        statements.iter().map(|s| (s.statement_id, s)).collect();
    let by_property: HashMap<Uuid, &MonthStatement> =
        statements.iter().map(|s| (s.property_id, s)).collect();

    request
        .approved_matches
        .iter()
        .map(|approved| {
            let statement = match approved.statement_id {
                Some(statement_id) => by_statement
                    .get(&statement_id)
                    .filter(|s| s.property_id == approved.property.id)
                    .ok_or_else(|| {
                        ImportError::NotFound(format!(
                            "Statement {} not found for '{}' in {}",
                            statement_id, approved.property.name, month
                        ))
                    })?,
                None => by_property.get(&approved.property.id).ok_or_else(|| {
                    ImportError::NotFound(format!(
                        "No statement for property '{}' in {}",
                        approved.property.name, month
                    ))
                })?,
            };
            Ok(ApprovedGroup {
                statement_id: statement.statement_id,
                expenses: approved.expenses.clone(),
            })
        })
        .collect()
}
