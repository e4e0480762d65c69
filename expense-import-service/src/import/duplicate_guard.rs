//! Duplicate Guard: was this vendor/description already imported this month?

use crate::error::ImportError;
use crate::models::{DuplicatePair, StatementMonth};
use crate::services::cache::ImportCache;
use crate::services::store::ExpenseStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct DuplicateGuard {
    store: Arc<dyn ExpenseStore>,
    cache: ImportCache,
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn ExpenseStore>, cache: ImportCache) -> Self {
        Self { store, cache }
    }

    /// Cache first; on a miss ask the store and remember the answer.
    pub async fn exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
    ) -> Result<bool, ImportError> {
        if let Some(hit) = self
            .cache
            .get_expense_exists(org_id, month, vendor, description)
            .await
        {
            return Ok(hit);
        }

        let exists = self
            .store
            .expense_exists(org_id, month, vendor, description)
            .await?;
        self.cache
            .put_expense_exists(org_id, month, vendor, description, exists)
            .await;
        Ok(exists)
    }

    /// Pairs that already exist in the month, sorted.
    #[instrument(skip(self, pairs), fields(org_id = %org_id, month = %month, pairs = pairs.len()))]
    pub async fn find_duplicates(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        pairs: &BTreeSet<DuplicatePair>,
    ) -> Result<Vec<DuplicatePair>, ImportError> {
        let mut duplicates = Vec::new();
        for pair in pairs {
            if self
                .exists(org_id, month, &pair.vendor, &pair.description)
                .await?
            {
                duplicates.push(pair.clone());
            }
        }

        if !duplicates.is_empty() {
            tracing::warn!(
                duplicates = duplicates.len(),
                "Possible duplicate import detected"
            );
        }
        Ok(duplicates)
    }

    /// Soft block: an error naming the duplicates unless the caller overrides.
    pub fn enforce(
        month: StatementMonth,
        duplicates: Vec<DuplicatePair>,
        override_duplicates: bool,
    ) -> Result<(), ImportError> {
        if duplicates.is_empty() {
            return Ok(());
        }
        if override_duplicates {
            tracing::info!(
                month = %month,
                duplicates = duplicates.len(),
                "Possible duplicates overridden by user"
            );
            return Ok(());
        }
        Err(ImportError::PossibleDuplicate {
            month: month.to_string(),
            duplicates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheTtlConfig;
    use crate::services::cache::MemoryCache;
    use crate::services::memory_store::MemoryStore;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn pair(vendor: &str, description: &str) -> DuplicatePair {
        DuplicatePair {
            vendor: vendor.to_string(),
            description: description.to_string(),
        }
    }

    fn setup() -> (MemoryStore, DuplicateGuard, Uuid, StatementMonth) {
        let store = MemoryStore::new();
        let cache = ImportCache::new(Arc::new(MemoryCache::new()), CacheTtlConfig::default());
        let guard = DuplicateGuard::new(Arc::new(store.clone()), cache);
        let org = Uuid::new_v4();
        let month: StatementMonth = "2024-05".parse().unwrap();

        let property = store.seed_property(org, "Sunset Villa", None);
        let statement = store.seed_statement(org, property, month);
        store.seed_expense(
            statement,
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            "Acme",
            "Cleaning",
            Decimal::new(5000, 2),
        );
        (store, guard, org, month)
    }

    #[tokio::test]
    async fn existing_pair_is_reported() {
        let (_, guard, org, month) = setup();
        let pairs: BTreeSet<_> = [pair("Acme", "Cleaning"), pair("Acme", "Gardening")].into();

        let duplicates = guard.find_duplicates(org, month, &pairs).await.unwrap();
        assert_eq!(duplicates, vec![pair("Acme", "Cleaning")]);

        let other_month: StatementMonth = "2024-06".parse().unwrap();
        assert!(guard
            .find_duplicates(org, other_month, &pairs)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cached_answer_is_trusted() {
        let (store, guard, org, month) = setup();
        assert!(!guard.exists(org, month, "Acme", "Gardening").await.unwrap());

        let statement = store.month_statements(org, month).await.unwrap()[0].statement_id;
        store.seed_expense(
            statement,
            NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(),
            "Acme",
            "Gardening",
            Decimal::new(100, 0),
        );

        assert!(!guard.exists(org, month, "Acme", "Gardening").await.unwrap());
    }

    #[test]
    fn enforce_blocks_unless_overridden() {
        let month: StatementMonth = "2024-05".parse().unwrap();
        let err = DuplicateGuard::enforce(month, vec![pair("Acme", "Cleaning")], false)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Possible duplicate import for 2024-05: Acme / Cleaning already imported"
        );
        assert!(DuplicateGuard::enforce(month, vec![pair("Acme", "Cleaning")], true).is_ok());
        assert!(DuplicateGuard::enforce(month, Vec::new(), false).is_ok());
    }
}
