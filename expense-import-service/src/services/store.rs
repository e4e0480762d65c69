//! Storage seams of the import pipeline.
//!
//! `Database` (Postgres) and `MemoryStore` both implement these traits; the
//! pipeline only ever sees `Arc<dyn ...>`.

use crate::error::ImportError;
use crate::models::{
    DuplicatePair, ImportJob, MonthStatement, NewExpense, Statement, StatementChildren,
    StatementMonth, StatementTotals,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Read side of statements and expenses plus chunk transactions for writes.
#[async_trait]
pub trait ExpenseStore: Send + Sync {
    /// Live statements of (org, month) joined with their property.
    async fn month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
    ) -> Result<Vec<MonthStatement>, ImportError>;

    async fn get_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, ImportError>;

    /// Whether any live statement of the month already has an expense with
    /// exactly this vendor and description.
    async fn expense_exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
    ) -> Result<bool, ImportError>;

    /// Vendor/description pairs already written by the given import job.
    async fn imported_pairs(&self, job_id: Uuid) -> Result<Vec<DuplicatePair>, ImportError>;

    /// Open one atomic unit of work for a chunk of rows.
    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, ImportError>;

    async fn health_check(&self) -> Result<(), ImportError>;
}

/// One chunk's transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait ChunkTransaction: Send {
    /// Lock the live statements among `statement_ids` for the rest of the
    /// transaction, in ascending id order. Returns the ids that were locked.
    /// Must run before any write that references those statements.
    async fn lock_statements(&mut self, statement_ids: &[Uuid]) -> Result<Vec<Uuid>, ImportError>;

    /// Insert rows, skipping any whose import key is already stored.
    /// Returns the number of rows actually inserted.
    async fn insert_expenses(&mut self, rows: &[NewExpense]) -> Result<u64, ImportError>;

    /// Live child amounts of the given statements, as seen inside this transaction.
    async fn load_children(
        &mut self,
        statement_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, StatementChildren>, ImportError>;

    async fn write_totals(
        &mut self,
        statement_id: Uuid,
        totals: &StatementTotals,
        updated_by: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<(), ImportError>;

    async fn commit(self: Box<Self>) -> Result<(), ImportError>;

    async fn rollback(self: Box<Self>) -> Result<(), ImportError>;
}

/// Durable import job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &ImportJob) -> Result<(), ImportError>;

    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<ImportJob>, ImportError>;

    async fn update_job(&self, job: &ImportJob) -> Result<(), ImportError>;
}
