//! Preview Builder: matched/unmatched report for human review.

use crate::models::statement::round_money;
use crate::models::{
    ExtractedLineItem, ImportPreview, MatchedGroup, MonthStatement, PreviewSummary, PropertyMatch,
    PropertyRef, UnmatchedGroup,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

struct MatchedAccumulator<'a> {
    statement: &'a MonthStatement,
    identifiers: Vec<String>,
    confidence: f64,
    reasons: Vec<String>,
    expenses: Vec<ExtractedLineItem>,
}

/// Group line items by resolved property. Pure and deterministic.
///
/// A match pointing at a property without a statement this month is shown as
/// unmatched.
pub fn build_preview(
    items: &[ExtractedLineItem],
    matches: &BTreeMap<String, PropertyMatch>,
    statements: &[MonthStatement],
) -> ImportPreview {
    let by_property: HashMap<Uuid, &MonthStatement> =
        statements.iter().map(|s| (s.property_id, s)).collect();

    let mut matched: HashMap<Uuid, MatchedAccumulator<'_>> = HashMap::new();
    let mut unmatched: BTreeMap<String, Vec<ExtractedLineItem>> = BTreeMap::new();

    for item in items {
        let identifier = item.raw_property.trim();
        let resolved = matches
            .get(identifier)
            .and_then(|m| by_property.get(&m.property_id).map(|s| (m, *s)));

        let Some((found, statement)) = resolved else {
            unmatched
                .entry(identifier.to_string())
                .or_default()
                .push(item.clone());
            continue;
        };

        let group = matched
            .entry(statement.property_id)
            .or_insert_with(|| MatchedAccumulator {
                statement,
                identifiers: Vec::new(),
                confidence: found.confidence,
                reasons: Vec::new(),
                expenses: Vec::new(),
            });
        if !group.identifiers.iter().any(|i| i == identifier) {
            group.identifiers.push(identifier.to_string());
            group.confidence = group.confidence.min(found.confidence);
            if !group.reasons.contains(&found.reason) {
                group.reasons.push(found.reason.clone());
            }
        }
        group.expenses.push(item.clone());
    }

    let mut matched: Vec<MatchedGroup> = matched
        .into_values()
        .map(|mut group| {
            group.identifiers.sort();
            MatchedGroup {
                property: PropertyRef {
                    id: group.statement.property_id,
                    name: group.statement.property_name.clone(),
                    address: group.statement.address.clone(),
                },
                statement_id: group.statement.statement_id,
                identifiers: group.identifiers,
                confidence: group.confidence,
                reason: group.reasons.join("; "),
                total_amount: subtotal(&group.expenses),
                expenses: group.expenses,
            }
        })
        .collect();
    matched.sort_by(|a, b| {
        a.property
            .name
            .cmp(&b.property.name)
            .then(a.property.id.cmp(&b.property.id))
    });

    let unmatched: Vec<UnmatchedGroup> = unmatched
        .into_iter()
        .map(|(property_name, expenses)| UnmatchedGroup {
            property_name,
            total_amount: subtotal(&expenses),
            expenses,
        })
        .collect();

    let summary = PreviewSummary {
        matched_property_count: matched.len(),
        unmatched_property_count: unmatched.len(),
        matched_expense_count: matched.iter().map(|g| g.expenses.len()).sum(),
        unmatched_expense_count: unmatched.iter().map(|g| g.expenses.len()).sum(),
        matched_amount: round_money(
            matched
                .iter()
                .flat_map(|g| &g.expenses)
                .map(|e| e.amount)
                .sum(),
        ),
        unmatched_amount: round_money(
            unmatched
                .iter()
                .flat_map(|g| &g.expenses)
                .map(|e| e.amount)
                .sum(),
        ),
    };

    ImportPreview {
        matched,
        unmatched,
        summary,
    }
}

fn subtotal(expenses: &[ExtractedLineItem]) -> Decimal {
    round_money(expenses.iter().map(|e| e.amount).sum())
}
