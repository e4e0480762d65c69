//! Domain models for expense-import-service.

pub mod import;
pub mod statement;

pub use import::{
    ApprovedMatch, CommitReport, ConfirmImportRequest, DuplicatePair, ExtractedLineItem,
    ImportJob, ImportPreview, ImportStatus, MatchCandidate, MatchMethod, MatchedGroup,
    PreviewSummary, PropertyMatch, PropertyRef, RowError, UnmatchedGroup,
};
pub use statement::{
    Expense, MonthStatement, NewExpense, Statement, StatementChildren, StatementMonth,
    StatementTotals,
};
