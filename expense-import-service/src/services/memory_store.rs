//! In-process store used by tests and by local runs without `DATABASE_URL`.

use crate::error::ImportError;
use crate::models::{
    DuplicatePair, Expense, ImportJob, MonthStatement, NewExpense, Statement, StatementChildren,
    StatementMonth, StatementTotals,
};
use crate::services::store::{ChunkTransaction, ExpenseStore, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PropertyRow {
    org_id: Uuid,
    name: String,
    address: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    properties: HashMap<Uuid, PropertyRow>,
    statements: HashMap<Uuid, Statement>,
    expenses: Vec<Expense>,
    incomes: Vec<(Uuid, Decimal)>,
    adjustments: Vec<(Uuid, Decimal)>,
    jobs: HashMap<Uuid, ImportJob>,
}

impl MemoryState {
    fn children(&self, statement_id: Uuid) -> StatementChildren {
        StatementChildren {
            income: self
                .incomes
                .iter()
                .filter(|(id, _)| *id == statement_id)
                .map(|(_, amount)| *amount)
                .collect(),
            expenses: self
                .expenses
                .iter()
                .filter(|e| e.statement_id == statement_id)
                .map(|e| e.amount)
                .collect(),
            adjustments: self
                .adjustments
                .iter()
                .filter(|(id, _)| *id == statement_id)
                .map(|(_, amount)| *amount)
                .collect(),
        }
    }

    fn recompute(&mut self, statement_id: Uuid) {
        let totals = StatementTotals::from_children(&self.children(statement_id));
        if let Some(statement) = self.statements.get_mut(&statement_id) {
            apply_totals(statement, &totals, None, Utc::now());
        }
    }

    fn has_import_key(&self, key: &str) -> bool {
        self.expenses
            .iter()
            .any(|e| e.import_key.as_deref() == Some(key))
    }
}

fn apply_totals(
    statement: &mut Statement,
    totals: &StatementTotals,
    updated_by: Option<Uuid>,
    updated_at: DateTime<Utc>,
) {
    statement.total_income = totals.total_income;
    statement.total_expenses = totals.total_expenses;
    statement.total_adjustments = totals.total_adjustments;
    statement.grand_total = totals.grand_total;
    if updated_by.is_some() {
        statement.updated_by = updated_by;
    }
    statement.updated_utc = updated_at;
}

/// Mutex-guarded maps implementing every storage trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    chunks_begun: Arc<AtomicUsize>,
    fail_at_chunk: Arc<Mutex<Option<usize>>>,
    /// Held by a chunk from `lock_statements` until it commits or is dropped.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    pub fn seed_property(&self, org_id: Uuid, name: &str, address: Option<&str>) -> Uuid {
        let property_id = Uuid::new_v4();
        self.state().properties.insert(
            property_id,
            PropertyRow {
                org_id,
                name: name.to_string(),
                address: address.map(str::to_string),
            },
        );
        property_id
    }

    pub fn seed_statement(&self, org_id: Uuid, property_id: Uuid, month: StatementMonth) -> Uuid {
        let statement_id = Uuid::new_v4();
        self.state().statements.insert(
            statement_id,
            Statement {
                statement_id,
                org_id,
                property_id,
                period_month: month.first_day(),
                total_income: Decimal::ZERO,
                total_expenses: Decimal::ZERO,
                total_adjustments: Decimal::ZERO,
                grand_total: Decimal::ZERO,
                updated_by: None,
                updated_utc: Utc::now(),
                deleted_utc: None,
            },
        );
        statement_id
    }

    pub fn seed_expense(
        &self,
        statement_id: Uuid,
        expense_date: NaiveDate,
        vendor: &str,
        description: &str,
        amount: Decimal,
    ) -> Uuid {
        let expense_id = Uuid::new_v4();
        let mut state = self.state();
        state.expenses.push(Expense {
            expense_id,
            statement_id,
            expense_date,
            vendor: vendor.to_string(),
            description: description.to_string(),
            amount,
            import_job_id: None,
            import_key: None,
            created_utc: Utc::now(),
        });
        state.recompute(statement_id);
        expense_id
    }

    pub fn seed_income(&self, statement_id: Uuid, amount: Decimal) {
        let mut state = self.state();
        state.incomes.push((statement_id, amount));
        state.recompute(statement_id);
    }

    pub fn seed_adjustment(&self, statement_id: Uuid, amount: Decimal) {
        let mut state = self.state();
        state.adjustments.push((statement_id, amount));
        state.recompute(statement_id);
    }

    pub fn delete_statement(&self, statement_id: Uuid) {
        if let Some(statement) = self.state().statements.get_mut(&statement_id) {
            statement.deleted_utc = Some(Utc::now());
        }
    }

    pub fn statement(&self, statement_id: Uuid) -> Option<Statement> {
        self.state().statements.get(&statement_id).cloned()
    }

    pub fn expenses_for(&self, statement_id: Uuid) -> Vec<Expense> {
        self.state()
            .expenses
            .iter()
            .filter(|e| e.statement_id == statement_id)
            .cloned()
            .collect()
    }

    pub fn expense_count(&self) -> usize {
        self.state().expenses.len()
    }

    pub fn job(&self, job_id: Uuid) -> Option<ImportJob> {
        self.state().jobs.get(&job_id).cloned()
    }

    /// Make the `ordinal`-th chunk begun from now on fail at commit (1-based, one shot).
    pub fn fail_chunk_commit(&self, ordinal: usize) {
        let absolute = self.chunks_begun.load(Ordering::SeqCst) + ordinal;
        *self.fail_at_chunk.lock().unwrap_or_else(|e| e.into_inner()) = Some(absolute);
    }
}

#[async_trait]
impl ExpenseStore for MemoryStore {
    async fn month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
    ) -> Result<Vec<MonthStatement>, ImportError> {
        let state = self.state();
        let mut rows: Vec<MonthStatement> = state
            .statements
            .values()
            .filter(|s| {
                s.org_id == org_id && s.deleted_utc.is_none() && month.contains(s.period_month)
            })
            .filter_map(|s| {
                state.properties.get(&s.property_id).map(|p| MonthStatement {
                    statement_id: s.statement_id,
                    property_id: s.property_id,
                    property_name: p.name.clone(),
                    address: p.address.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            a.property_name
                .cmp(&b.property_name)
                .then(a.statement_id.cmp(&b.statement_id))
        });
        Ok(rows)
    }

    async fn get_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, ImportError> {
        Ok(self
            .state()
            .statements
            .get(&statement_id)
            .filter(|s| s.org_id == org_id && s.deleted_utc.is_none())
            .cloned())
    }

    async fn expense_exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
    ) -> Result<bool, ImportError> {
        let state = self.state();
        Ok(state.expenses.iter().any(|e| {
            e.vendor == vendor
                && e.description == description
                && state.statements.get(&e.statement_id).is_some_and(|s| {
                    s.org_id == org_id
                        && s.deleted_utc.is_none()
                        && month.contains(s.period_month)
                })
        }))
    }

    async fn imported_pairs(&self, job_id: Uuid) -> Result<Vec<DuplicatePair>, ImportError> {
        let pairs: HashSet<DuplicatePair> = self
            .state()
            .expenses
            .iter()
            .filter(|e| e.import_job_id == Some(job_id))
            .map(|e| DuplicatePair {
                vendor: e.vendor.clone(),
                description: e.description.clone(),
            })
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, ImportError> {
        let index = self.chunks_begun.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_on_commit = {
            let mut fail_at = self.fail_at_chunk.lock().unwrap_or_else(|e| e.into_inner());
            if *fail_at == Some(index) {
                *fail_at = None;
                true
            } else {
                false
            }
        };

        Ok(Box::new(MemoryChunk {
            store: self.clone(),
            staged: Vec::new(),
            totals: Vec::new(),
            fail_on_commit,
            write_guard: None,
        }))
    }

    async fn health_check(&self) -> Result<(), ImportError> {
        Ok(())
    }
}

/// Buffers writes and applies them atomically under the store lock on commit.
struct MemoryChunk {
    store: MemoryStore,
    staged: Vec<Expense>,
    totals: Vec<(Uuid, StatementTotals, Uuid, DateTime<Utc>)>,
    fail_on_commit: bool,
    write_guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl ChunkTransaction for MemoryChunk {
    async fn lock_statements(&mut self, statement_ids: &[Uuid]) -> Result<Vec<Uuid>, ImportError> {
        if self.write_guard.is_none() {
            self.write_guard = Some(self.store.write_lock.clone().lock_owned().await);
        }

        let state = self.store.state();
        let mut locked: Vec<Uuid> = statement_ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .statements
                    .get(id)
                    .is_some_and(|s| s.deleted_utc.is_none())
            })
            .collect();
        locked.sort();
        locked.dedup();
        Ok(locked)
    }

    async fn insert_expenses(&mut self, rows: &[NewExpense]) -> Result<u64, ImportError> {
        let state = self.store.state();
        let mut inserted = 0;
        for row in rows {
            let staged_already = self
                .staged
                .iter()
                .any(|e| e.import_key.as_deref() == Some(row.import_key.as_str()));
            if staged_already || state.has_import_key(&row.import_key) {
                continue;
            }
            if !state.statements.contains_key(&row.statement_id) {
                return Err(ImportError::Storage(anyhow::anyhow!(
                    "Failed to insert expenses: statement {} does not exist",
                    row.statement_id
                )));
            }
            self.staged.push(Expense {
                expense_id: Uuid::new_v4(),
                statement_id: row.statement_id,
                expense_date: row.expense_date,
                vendor: row.vendor.clone(),
                description: row.description.clone(),
                amount: row.amount,
                import_job_id: Some(row.import_job_id),
                import_key: Some(row.import_key.clone()),
                created_utc: Utc::now(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn load_children(
        &mut self,
        statement_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, StatementChildren>, ImportError> {
        let state = self.store.state();
        Ok(statement_ids
            .iter()
            .map(|id| {
                let mut children = state.children(*id);
                children.expenses.extend(
                    self.staged
                        .iter()
                        .filter(|e| e.statement_id == *id)
                        .map(|e| e.amount),
                );
                (*id, children)
            })
            .collect())
    }

    async fn write_totals(
        &mut self,
        statement_id: Uuid,
        totals: &StatementTotals,
        updated_by: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<(), ImportError> {
        self.totals
            .push((statement_id, *totals, updated_by, updated_at));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ImportError> {
        let MemoryChunk {
            store,
            staged,
            totals,
            fail_on_commit,
            write_guard: _write_guard,
        } = *self;

        if fail_on_commit {
            return Err(ImportError::Storage(anyhow::anyhow!(
                "Failed to commit transaction: injected failure"
            )));
        }

        let mut state = store.state();
        state.expenses.extend(staged);
        for (statement_id, totals, updated_by, updated_at) in totals {
            if let Some(statement) = state.statements.get_mut(&statement_id) {
                apply_totals(statement, &totals, Some(updated_by), updated_at);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ImportError> {
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &ImportJob) -> Result<(), ImportError> {
        self.state().jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        Ok(self
            .state()
            .jobs
            .get(&job_id)
            .filter(|j| j.org_id == org_id)
            .cloned())
    }

    async fn update_job(&self, job: &ImportJob) -> Result<(), ImportError> {
        let mut state = self.state();
        match state.jobs.get_mut(&job.job_id) {
            Some(existing) if existing.org_id == job.org_id => {
                *existing = job.clone();
                Ok(())
            }
            _ => Err(ImportError::NotFound(format!(
                "Import job {} not found",
                job.job_id
            ))),
        }
    }
}
