//! Billing engine components.

pub mod credit_notes;
pub mod generator;
pub mod lifecycle;
pub mod line_builder;
pub mod payments;
pub mod proration;
pub mod run;
pub mod setup;
pub mod statements;
pub mod tiered;

pub use credit_notes::CreditNoteIssuer;
pub use generator::{GeneratedInvoice, InvoiceGenerator, DEFAULT_INVOICE_PREFIX};
pub use lifecycle::InvoiceLifecycle;
pub use line_builder::{build_lines, BillingContext, BuiltLines, DraftLine};
pub use payments::{OverpaymentPolicy, PaymentLedger};
pub use proration::{days_in_month, last_day_of_month, month_segments, prorate_rent, round_money};
pub use run::{InvoiceRunner, DEFAULT_MAX_PARALLEL_LEASES};
pub use setup::BillingSetup;
pub use statements::StatementRecorder;
pub use tiered::{compute_tiered_utility_amount, validate_slabs};
