//! Postgres-backed store for statements, expenses and import jobs.

use crate::error::ImportError;
use crate::models::{
    DuplicatePair, ImportJob, MonthStatement, NewExpense, Statement, StatementChildren,
    StatementMonth, StatementTotals,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{ChunkTransaction, ExpenseStore, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

fn db_error(context: &str, e: sqlx::Error) -> ImportError {
    ImportError::Storage(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "expense-import-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, ImportError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), ImportError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ImportError::Storage(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ExpenseStore for Database {
    #[instrument(skip(self), fields(org_id = %org_id, month = %month))]
    async fn month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
    ) -> Result<Vec<MonthStatement>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["month_statements"])
            .start_timer();

        let rows = sqlx::query_as::<_, MonthStatement>(
            r#"
            SELECT s.statement_id, s.property_id, p.name AS property_name, p.address
            FROM statements s
            JOIN properties p ON p.property_id = s.property_id
            WHERE s.org_id = $1
              AND s.period_month = $2
              AND s.deleted_utc IS NULL
              AND p.deleted_utc IS NULL
            ORDER BY p.name, s.statement_id
            "#,
        )
        .bind(org_id)
        .bind(month.first_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load month statements", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self), fields(org_id = %org_id, statement_id = %statement_id))]
    async fn get_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, Statement>(
            r#"
            SELECT statement_id, org_id, property_id, period_month, total_income, total_expenses,
                   total_adjustments, grand_total, updated_by, updated_utc, deleted_utc
            FROM statements
            WHERE org_id = $1 AND statement_id = $2 AND deleted_utc IS NULL
            "#,
        )
        .bind(org_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get statement", e))?;

        timer.observe_duration();
        Ok(statement)
    }

    #[instrument(skip(self), fields(org_id = %org_id, month = %month))]
    async fn expense_exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
    ) -> Result<bool, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expense_exists"])
            .start_timer();

        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM expenses e
                JOIN statements s ON s.statement_id = e.statement_id
                WHERE s.org_id = $1
                  AND s.period_month = $2
                  AND s.deleted_utc IS NULL
                  AND e.deleted_utc IS NULL
                  AND e.vendor = $3
                  AND e.description = $4
            )
            "#,
        )
        .bind(org_id)
        .bind(month.first_day())
        .bind(vendor)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to check existing expense", e))?;

        timer.observe_duration();
        Ok(exists)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn imported_pairs(&self, job_id: Uuid) -> Result<Vec<DuplicatePair>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["imported_pairs"])
            .start_timer();

        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT vendor, description
            FROM expenses
            WHERE import_job_id = $1 AND deleted_utc IS NULL
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load imported pairs", e))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(vendor, description)| DuplicatePair {
                vendor,
                description,
            })
            .collect())
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTransaction>, ImportError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        Ok(Box::new(PgChunk { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}

/// A chunk transaction on one pooled connection.
struct PgChunk {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ChunkTransaction for PgChunk {
    #[instrument(skip(self, statement_ids), fields(statements = statement_ids.len()))]
    async fn lock_statements(&mut self, statement_ids: &[Uuid]) -> Result<Vec<Uuid>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_statements"])
            .start_timer();

        // NO KEY UPDATE still lets the FK checks of our own inserts share the row.
        let locked = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT statement_id FROM statements
            WHERE statement_id = ANY($1) AND deleted_utc IS NULL
            ORDER BY statement_id
            FOR NO KEY UPDATE
            "#,
        )
        .bind(statement_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to lock statements", e))?;

        timer.observe_duration();
        Ok(locked)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_expenses(&mut self, rows: &[NewExpense]) -> Result<u64, ImportError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_expenses"])
            .start_timer();

        let mut expense_ids = Vec::with_capacity(rows.len());
        let mut statement_ids = Vec::with_capacity(rows.len());
        let mut dates: Vec<NaiveDate> = Vec::with_capacity(rows.len());
        let mut vendors = Vec::with_capacity(rows.len());
        let mut descriptions = Vec::with_capacity(rows.len());
        let mut amounts: Vec<Decimal> = Vec::with_capacity(rows.len());
        let mut job_ids = Vec::with_capacity(rows.len());
        let mut import_keys = Vec::with_capacity(rows.len());

        for row in rows {
            expense_ids.push(Uuid::new_v4());
            statement_ids.push(row.statement_id);
            dates.push(row.expense_date);
            vendors.push(row.vendor.clone());
            descriptions.push(row.description.clone());
            amounts.push(row.amount);
            job_ids.push(row.import_job_id);
            import_keys.push(row.import_key.clone());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO expenses (expense_id, statement_id, expense_date, vendor, description, amount, import_job_id, import_key)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::date[], $4::text[], $5::text[], $6::numeric[], $7::uuid[], $8::text[])
            ON CONFLICT (import_key) DO NOTHING
            "#,
        )
        .bind(&expense_ids)
        .bind(&statement_ids)
        .bind(&dates)
        .bind(&vendors)
        .bind(&descriptions)
        .bind(&amounts)
        .bind(&job_ids)
        .bind(&import_keys)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to insert expenses", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, statement_ids), fields(statements = statement_ids.len()))]
    async fn load_children(
        &mut self,
        statement_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, StatementChildren>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_children"])
            .start_timer();

        let mut children: HashMap<Uuid, StatementChildren> = statement_ids
            .iter()
            .map(|id| (*id, StatementChildren::default()))
            .collect();

        for (table, label) in [
            ("incomes", "income"),
            ("expenses", "expense"),
            ("adjustments", "adjustment"),
        ] {
            let sql = format!(
                "SELECT statement_id, amount FROM {} WHERE statement_id = ANY($1) AND deleted_utc IS NULL",
                table
            );
            let rows = sqlx::query_as::<_, (Uuid, Decimal)>(&sql)
                .bind(statement_ids)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| db_error(&format!("Failed to load {} rows", label), e))?;

            for (statement_id, amount) in rows {
                let entry = children.entry(statement_id).or_default();
                match label {
                    "income" => entry.income.push(amount),
                    "expense" => entry.expenses.push(amount),
                    _ => entry.adjustments.push(amount),
                }
            }
        }

        timer.observe_duration();
        Ok(children)
    }

    #[instrument(skip(self, totals), fields(statement_id = %statement_id))]
    async fn write_totals(
        &mut self,
        statement_id: Uuid,
        totals: &StatementTotals,
        updated_by: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<(), ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["write_totals"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE statements
            SET total_income = $2, total_expenses = $3, total_adjustments = $4, grand_total = $5,
                updated_by = $6, updated_utc = $7
            WHERE statement_id = $1
            "#,
        )
        .bind(statement_id)
        .bind(totals.total_income)
        .bind(totals.total_expenses)
        .bind(totals.total_adjustments)
        .bind(totals.grand_total)
        .bind(updated_by)
        .bind(updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to write statement totals", e))?;

        timer.observe_duration();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ImportError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), ImportError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("Failed to roll back transaction", e))
    }
}

#[derive(FromRow)]
struct ImportJobRow {
    job_id: Uuid,
    org_id: Uuid,
    period_month: NaiveDate,
    vendor: String,
    description: String,
    file_name: String,
    status: String,
    failure_reason: Option<String>,
    committed_rows: i64,
    total_rows: i64,
    preview: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    created_by: Uuid,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<ImportJobRow> for ImportJob {
    type Error = ImportError;

    fn try_from(row: ImportJobRow) -> Result<Self, Self::Error> {
        Ok(ImportJob {
            job_id: row.job_id,
            org_id: row.org_id,
            month: StatementMonth::from_date(row.period_month),
            vendor: row.vendor,
            description: row.description,
            file_name: row.file_name,
            status: row.status.parse()?,
            failure_reason: row.failure_reason,
            committed_rows: row.committed_rows,
            total_rows: row.total_rows,
            preview: row.preview,
            result: row.result,
            created_by: row.created_by,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[async_trait]
impl JobStore for Database {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, org_id = %job.org_id))]
    async fn create_job(&self, job: &ImportJob) -> Result<(), ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_job"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO import_jobs (job_id, org_id, period_month, vendor, description, file_name, status,
                                     failure_reason, committed_rows, total_rows, preview, result,
                                     created_by, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.job_id)
        .bind(job.org_id)
        .bind(job.month.first_day())
        .bind(&job.vendor)
        .bind(&job.description)
        .bind(&job.file_name)
        .bind(job.status.as_str())
        .bind(&job.failure_reason)
        .bind(job.committed_rows)
        .bind(job.total_rows)
        .bind(&job.preview)
        .bind(&job.result)
        .bind(job.created_by)
        .bind(job.created_utc)
        .bind(job.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create import job", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, job_id = %job_id))]
    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job"])
            .start_timer();

        let row = sqlx::query_as::<_, ImportJobRow>(
            r#"
            SELECT job_id, org_id, period_month, vendor, description, file_name, status, failure_reason,
                   committed_rows, total_rows, preview, result, created_by, created_utc, updated_utc
            FROM import_jobs
            WHERE org_id = $1 AND job_id = $2
            "#,
        )
        .bind(org_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get import job", e))?;

        timer.observe_duration();
        row.map(ImportJob::try_from).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, status = %job.status))]
    async fn update_job(&self, job: &ImportJob) -> Result<(), ImportError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_job"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = $3, failure_reason = $4, committed_rows = $5, total_rows = $6,
                preview = $7, result = $8, updated_utc = $9
            WHERE org_id = $1 AND job_id = $2
            "#,
        )
        .bind(job.org_id)
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(&job.failure_reason)
        .bind(job.committed_rows)
        .bind(job.total_rows)
        .bind(&job.preview)
        .bind(&job.result)
        .bind(job.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update import job", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(ImportError::NotFound(format!(
                "Import job {} not found",
                job.job_id
            )));
        }
        Ok(())
    }
}
