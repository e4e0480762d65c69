pub mod health;
pub mod imports;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use imports::{cancel_import, confirm_import, get_import, preview_import};
