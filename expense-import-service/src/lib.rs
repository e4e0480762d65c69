//! Expense Import Service - vendor invoice extraction, property matching and
//! statement reconciliation.

pub mod config;
pub mod error;
pub mod handlers;
pub mod import;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
