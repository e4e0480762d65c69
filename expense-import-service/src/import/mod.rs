//! The import pipeline, leaves first: extraction, resolution, duplicate
//! detection, preview, reconciliation, and the service that drives them.

pub mod amount;
pub mod duplicate_guard;
pub mod extractor;
pub mod json_span;
pub mod matcher;
pub mod preview;
pub mod reconcile;
pub mod resolver;
pub mod service;

pub use duplicate_guard::DuplicateGuard;
pub use extractor::{DocumentExtractor, DocumentKind, Extraction, UploadedDocument};
pub use matcher::{LlmPropertyMatcher, PropertyMatcher, SimilarityMatcher};
pub use preview::build_preview;
pub use reconcile::{CommitPlan, ReconciliationEngine};
pub use resolver::{PropertyResolver, Resolution};
pub use service::{ImportService, PreviewRequest, PreviewResponse};
