//! Money parsing for spreadsheet cells and AI replies.

use crate::models::statement::round_money;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,

    #[error("amount '{0}' has more than one decimal point")]
    MultipleDecimalPoints(String),

    #[error("amount '{0}' has more than one sign")]
    MultipleSigns(String),

    #[error("amount '{0}' mixes decimal and thousands separators")]
    AmbiguousSeparators(String),

    #[error("amount '{0}' is not a number")]
    Invalid(String),
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '¢'];

/// Parse a human-written amount into an exact decimal.
///
/// Currency symbols, whitespace and thousands separators are dropped and a
/// parenthesised value is negative. More than two fractional digits are
/// rounded to cents. A comma is only accepted as a thousands separator, so
/// European notation such as `1.234,56` is rejected.
pub fn parse_amount(raw: &str) -> Result<Decimal, AmountError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }

    let (parenthesised, inner) = match trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
    {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let compact: String = inner
        .chars()
        .filter(|c| !c.is_whitespace() && !CURRENCY_SYMBOLS.contains(c))
        .collect();
    if !thousands_separators_only(&compact) {
        return Err(AmountError::AmbiguousSeparators(raw.to_string()));
    }
    let cleaned: String = compact.chars().filter(|c| *c != ',').collect();

    let signs = cleaned.chars().filter(|c| *c == '-' || *c == '+').count();
    if signs > 1 || (parenthesised && signs > 0) {
        return Err(AmountError::MultipleSigns(raw.to_string()));
    }
    if signs == 1 && !(cleaned.starts_with('-') || cleaned.starts_with('+')) {
        return Err(AmountError::Invalid(raw.to_string()));
    }

    if cleaned.chars().filter(|c| *c == '.').count() > 1 {
        return Err(AmountError::MultipleDecimalPoints(raw.to_string()));
    }

    let digits = cleaned.trim_start_matches(['-', '+']);
    if digits.is_empty()
        || digits == "."
        || !digits.chars().all(|c| c.is_ascii_digit() || c == '.')
    {
        return Err(AmountError::Invalid(raw.to_string()));
    }

    let value = Decimal::from_str(&cleaned).map_err(|_| AmountError::Invalid(raw.to_string()))?;
    let value = round_money(value);

    Ok(if parenthesised { -value } else { value })
}

/// Commas appear only before the decimal point and the last group is three digits.
fn thousands_separators_only(amount: &str) -> bool {
    let (integer, fraction) = amount.split_once('.').unwrap_or((amount, ""));
    !fraction.contains(',')
        && !integer.contains(",,")
        && integer
            .rsplit_once(',')
            .map_or(true, |(_, last)| last.len() == 3)
}
