use crate::error::ImportError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Round a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

// ============================================================================
// Statement month
// ============================================================================

/// Calendar month a statement covers, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatementMonth {
    year: i32,
    month: u32,
}

impl StatementMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, ImportError> {
        if !(1..=12).contains(&month) || !(1900..=9999).contains(&year) {
            return Err(ImportError::Validation(format!(
                "Invalid statement month {:04}-{:02}",
                year, month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    /// Date given to line items that arrive without one.
    pub fn default_expense_date(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 15).unwrap_or_default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for StatementMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for StatementMonth {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ImportError::Validation(format!("Month must be YYYY-MM, got '{}'", s));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for StatementMonth {
    type Error = ImportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StatementMonth> for String {
    fn from(month: StatementMonth) -> Self {
        month.to_string()
    }
}

// ============================================================================
// Statement Models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub statement_id: Uuid,
    pub org_id: Uuid,
    pub property_id: Uuid,
    pub period_month: NaiveDate,
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    pub total_adjustments: Decimal,
    pub grand_total: Decimal,
    pub updated_by: Option<Uuid>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

/// A live statement of a month joined with its property, as cached for resolution.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthStatement {
    pub statement_id: Uuid,
    pub property_id: Uuid,
    pub property_name: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub expense_id: Uuid,
    pub statement_id: Uuid,
    pub expense_date: NaiveDate,
    pub vendor: String,
    pub description: String,
    pub amount: Decimal,
    pub import_job_id: Option<Uuid>,
    pub import_key: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Expense row prepared by the reconciliation engine, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub statement_id: Uuid,
    pub expense_date: NaiveDate,
    pub vendor: String,
    pub description: String,
    pub amount: Decimal,
    pub import_job_id: Uuid,
    pub import_key: String,
}

/// Live child amounts of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementChildren {
    pub income: Vec<Decimal>,
    pub expenses: Vec<Decimal>,
    pub adjustments: Vec<Decimal>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementTotals {
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    pub total_adjustments: Decimal,
    pub grand_total: Decimal,
}

impl StatementTotals {
    /// Exact sums of the children, each rounded to cents once.
    pub fn from_children(children: &StatementChildren) -> Self {
        let total_income = round_money(children.income.iter().copied().sum());
        let total_expenses = round_money(children.expenses.iter().copied().sum());
        let total_adjustments = round_money(children.adjustments.iter().copied().sum());

        Self {
            total_income,
            total_expenses,
            total_adjustments,
            grand_total: round_money(total_income - total_expenses + total_adjustments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn month_parses_and_formats() {
        let month: StatementMonth = "2024-03".parse().unwrap();
        assert_eq!(month.year(), 2024);
        assert_eq!(month.month(), 3);
        assert_eq!(month.to_string(), "2024-03");
        assert_eq!(
            month.default_expense_date(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
    }

    #[test]
    fn month_rejects_malformed_input() {
        for bad in ["2024-3", "2024-13", "24-03", "march", "2024/03", ""] {
            assert!(bad.parse::<StatementMonth>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn month_serializes_as_string() {
        let month: StatementMonth = "2023-11".parse().unwrap();
        assert_eq!(serde_json::to_string(&month).unwrap(), "\"2023-11\"");
        let back: StatementMonth = serde_json::from_str("\"2023-11\"").unwrap();
        assert_eq!(back, month);
    }

    #[test]
    fn totals_follow_live_children() {
        let children = StatementChildren {
            income: vec![dec("2500.00"), dec("100.00")],
            expenses: vec![dec("120.50"), dec("79.50"), dec("-10.00")],
            adjustments: vec![dec("-25.25")],
        };
        let totals = StatementTotals::from_children(&children);

        assert_eq!(totals.total_income, dec("2600.00"));
        assert_eq!(totals.total_expenses, dec("190.00"));
        assert_eq!(totals.total_adjustments, dec("-25.25"));
        assert_eq!(
            totals.grand_total,
            round_money(totals.total_income - totals.total_expenses + totals.total_adjustments)
        );
        assert_eq!(totals.grand_total, dec("2384.75"));
    }

    #[test]
    fn empty_statement_totals_are_zero() {
        let totals = StatementTotals::from_children(&StatementChildren::default());
        assert_eq!(totals, StatementTotals::default());
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_money(dec("0.005")), dec("0.01"));
        assert_eq!(round_money(dec("-0.005")), dec("-0.01"));
        assert_eq!(round_money(dec("10.004")), dec("10.00"));
    }
}
