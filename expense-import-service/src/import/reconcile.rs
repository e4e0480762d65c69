//! Reconciliation Engine: approved line items to expense rows and fresh totals.
//!
//! Rows are written in fixed-size chunks, one transaction per chunk. A chunk
//! first locks every statement it touches in ascending id order, then inserts
//! its rows, then recomputes those statements' totals from live children. A failed chunk rolls back alone; earlier chunks
//! stay committed and the caller gets the running count.

use crate::error::ImportError;
use crate::models::statement::round_money;
use crate::models::{
    ExtractedLineItem, NewExpense, StatementChildren, StatementMonth, StatementTotals,
};
use crate::services::cache::ImportCache;
use crate::services::metrics::{record_committed_rows, record_import_stage};
use crate::services::store::{ChunkTransaction, ExpenseStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Approved items bound for one statement.
#[derive(Debug, Clone)]
pub struct ApprovedGroup {
    pub statement_id: Uuid,
    pub expenses: Vec<ExtractedLineItem>,
}

/// Everything needed to turn approved groups into rows.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub job_id: Uuid,
    pub org_id: Uuid,
    pub month: StatementMonth,
    pub acting_user: Uuid,
    pub default_vendor: String,
    pub default_description: String,
    pub groups: Vec<ApprovedGroup>,
}

impl CommitPlan {
    /// Flatten into prospective rows with deterministic import keys.
    pub fn rows(&self) -> Vec<NewExpense> {
        let mut occurrences: HashMap<String, u32> = HashMap::new();
        let mut rows = Vec::new();

        for group in &self.groups {
            for item in &group.expenses {
                let vendor = item
                    .vendor
                    .clone()
                    .unwrap_or_else(|| self.default_vendor.clone());
                let description = item
                    .description
                    .clone()
                    .unwrap_or_else(|| self.default_description.clone());
                let expense_date = item.date.unwrap_or_else(|| self.month.default_expense_date());
                let amount = round_money(item.amount);

                let identity = format!(
                    "{}|{}|{}|{}|{}",
                    group.statement_id,
                    expense_date,
                    vendor,
                    description,
                    amount.normalize()
                );
                let occurrence = occurrences.entry(identity.clone()).or_insert(0);
                let import_key = import_key(self.job_id, &identity, *occurrence);
                *occurrence += 1;

                rows.push(NewExpense {
                    statement_id: group.statement_id,
                    expense_date,
                    vendor,
                    description,
                    amount,
                    import_job_id: self.job_id,
                    import_key,
                });
            }
        }
        rows
    }
}

/// Stable per-row key; identical rows differ by their occurrence index.
fn import_key(job_id: Uuid, identity: &str, occurrence: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(identity.as_bytes());
    hasher.update(occurrence.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    pub total_rows: u64,
    /// Rows inserted by this run.
    pub inserted_rows: u64,
    /// Rows whose import key was already stored.
    pub skipped_rows: u64,
    pub chunks_committed: usize,
    pub statements_updated: Vec<Uuid>,
}

/// A chunk failed; `progress` is what earlier chunks committed.
#[derive(Debug)]
pub struct CommitFailure {
    pub progress: CommitOutcome,
    pub error: ImportError,
}

pub struct ReconciliationEngine {
    store: Arc<dyn ExpenseStore>,
    cache: ImportCache,
    chunk_size: usize,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        cache: ImportCache,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            chunk_size: chunk_size.max(1),
        }
    }

    #[instrument(skip(self, plan), fields(job_id = %plan.job_id, org_id = %plan.org_id, month = %plan.month))]
    pub async fn commit(&self, plan: &CommitPlan) -> Result<CommitOutcome, CommitFailure> {
        let rows = plan.rows();
        let mut outcome = CommitOutcome {
            total_rows: rows.len() as u64,
            ..CommitOutcome::default()
        };
        let mut touched = BTreeSet::new();

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            match self.apply_chunk(chunk, plan.acting_user).await {
                Ok((inserted, statements)) => {
                    outcome.inserted_rows += inserted;
                    outcome.skipped_rows += chunk.len() as u64 - inserted;
                    outcome.chunks_committed += 1;
                    touched.extend(statements);
                    record_committed_rows("inserted", inserted);
                    record_committed_rows("skipped", chunk.len() as u64 - inserted);
                    tracing::debug!(
                        chunk = index + 1,
                        rows = chunk.len(),
                        inserted = inserted,
                        "Chunk committed"
                    );
                }
                Err(error) => {
                    outcome.statements_updated = touched.into_iter().collect();
                    tracing::error!(
                        chunk = index + 1,
                        error = %error,
                        inserted = outcome.inserted_rows,
                        total = outcome.total_rows,
                        "Chunk failed; earlier chunks stay committed"
                    );
                    record_import_stage("commit", "partial");
                    if outcome.chunks_committed > 0 {
                        self.cache.invalidate(plan.org_id, plan.month).await;
                    }
                    return Err(CommitFailure {
                        progress: outcome,
                        error,
                    });
                }
            }
        }

        outcome.statements_updated = touched.into_iter().collect();
        self.cache.invalidate(plan.org_id, plan.month).await;
        record_import_stage("commit", "success");
        tracing::info!(
            inserted = outcome.inserted_rows,
            skipped = outcome.skipped_rows,
            statements = outcome.statements_updated.len(),
            "Import committed"
        );
        Ok(outcome)
    }

    async fn apply_chunk(
        &self,
        chunk: &[NewExpense],
        acting_user: Uuid,
    ) -> Result<(u64, Vec<Uuid>), ImportError> {
        let mut tx = self.store.begin_chunk().await?;
        match self.write_chunk(tx.as_mut(), chunk, acting_user).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Chunk rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_chunk(
        &self,
        tx: &mut dyn ChunkTransaction,
        chunk: &[NewExpense],
        acting_user: Uuid,
    ) -> Result<(u64, Vec<Uuid>), ImportError> {
        let statement_ids: Vec<Uuid> = chunk
            .iter()
            .map(|row| row.statement_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // Every statement lock is taken before the first insert.
        let locked = tx.lock_statements(&statement_ids).await?;
        if let Some(missing) = statement_ids.iter().find(|id| !locked.contains(id)) {
            return Err(ImportError::NotFound(format!(
                "Statement {} no longer exists",
                missing
            )));
        }

        let inserted = tx.insert_expenses(chunk).await?;
        let children = tx.load_children(&statement_ids).await?;
        let totals = recompute_totals(&children);

        let now = Utc::now();
        for (statement_id, statement_totals) in &totals {
            tx.write_totals(*statement_id, statement_totals, acting_user, now)
                .await?;
        }

        Ok((inserted, statement_ids))
    }
}

/// Totals for each statement, ordered by statement id.
fn recompute_totals(children: &HashMap<Uuid, StatementChildren>) -> Vec<(Uuid, StatementTotals)> {
    let mut totals: Vec<(Uuid, StatementTotals)> = children
        .iter()
        .map(|(statement_id, children)| (*statement_id, StatementTotals::from_children(children)))
        .collect();
    totals.sort_by_key(|(id, _)| *id);
    totals
}
