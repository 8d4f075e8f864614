//! Lease billing and invoice ledger engine.
//!
//! Computes prorated rent and tiered utility charges, generates idempotent
//! draft invoices per lease and period, runs batch invoice runs, and keeps
//! the payment and credit note ledger behind a version-checked [`services::Store`].

pub mod billing;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;

pub use engine::BillingEngine;
pub use error::BillingError;
