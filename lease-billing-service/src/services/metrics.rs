//! Metrics module for lease-billing-service.
//! Provides Prometheus metrics for invoice generation, runs, payments and credit notes.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "lease_billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoices generated, split into created and regenerated drafts
pub static INVOICES_GENERATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_invoices_generated_total",
            "Draft invoices created or regenerated by organization"
        ),
        &["org_id", "outcome"]
    )
    .expect("Failed to register INVOICES_GENERATED_TOTAL")
});

/// Invoice lifecycle transitions
pub static INVOICE_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_invoice_transitions_total",
            "Invoice status transitions by target status"
        ),
        &["org_id", "status"]
    )
    .expect("Failed to register INVOICE_TRANSITIONS_TOTAL")
});

/// Invoice runs by kind and terminal status
pub static INVOICE_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_invoice_runs_total",
            "Invoice runs by organization, kind and status"
        ),
        &["org_id", "kind", "status"]
    )
    .expect("Failed to register INVOICE_RUNS_TOTAL")
});

/// Leases that failed inside an invoice run, by error kind
pub static INVOICE_RUN_LEASE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_invoice_run_lease_failures_total",
            "Per-lease invoice run failures by organization and error kind"
        ),
        &["org_id", "kind"]
    )
    .expect("Failed to register INVOICE_RUN_LEASE_FAILURES_TOTAL")
});

/// Payments by mode and status
pub static PAYMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_payments_total",
            "Payment status transitions by mode"
        ),
        &["org_id", "mode", "status"]
    )
    .expect("Failed to register PAYMENTS_TOTAL")
});

/// Overpayments accepted under the accept-and-flag policy
pub static OVERPAYMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_overpayments_total",
            "Payments that pushed an invoice balance below zero"
        ),
        &["org_id"]
    )
    .expect("Failed to register OVERPAYMENTS_TOTAL")
});

/// Credit notes issued
pub static CREDIT_NOTES_ISSUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "lease_billing_credit_notes_issued_total",
            "Credit notes issued by organization"
        ),
        &["org_id"]
    )
    .expect("Failed to register CREDIT_NOTES_ISSUED_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*INVOICES_GENERATED_TOTAL;
    let _ = &*INVOICE_TRANSITIONS_TOTAL;
    let _ = &*INVOICE_RUNS_TOTAL;
    let _ = &*INVOICE_RUN_LEASE_FAILURES_TOTAL;
    let _ = &*PAYMENTS_TOTAL;
    let _ = &*OVERPAYMENTS_TOTAL;
    let _ = &*CREDIT_NOTES_ISSUED_TOTAL;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a generated draft invoice (`created` or `updated`).
pub fn record_invoice_generated(org_id: &str, outcome: &str) {
    INVOICES_GENERATED_TOTAL
        .with_label_values(&[org_id, outcome])
        .inc();
}

/// Record an invoice status transition.
pub fn record_invoice_transition(org_id: &str, status: &str) {
    INVOICE_TRANSITIONS_TOTAL
        .with_label_values(&[org_id, status])
        .inc();
}

/// Record a finished invoice run.
pub fn record_invoice_run(org_id: &str, kind: &str, status: &str) {
    INVOICE_RUNS_TOTAL
        .with_label_values(&[org_id, kind, status])
        .inc();
}

pub fn record_run_lease_failure(org_id: &str, kind: &str) {
    INVOICE_RUN_LEASE_FAILURES_TOTAL
        .with_label_values(&[org_id, kind])
        .inc();
}

/// Record a payment status transition.
pub fn record_payment(org_id: &str, mode: &str, status: &str) {
    PAYMENTS_TOTAL
        .with_label_values(&[org_id, mode, status])
        .inc();
}

pub fn record_overpayment(org_id: &str) {
    OVERPAYMENTS_TOTAL.with_label_values(&[org_id]).inc();
}

pub fn record_credit_note_issued(org_id: &str) {
    CREDIT_NOTES_ISSUED_TOTAL.with_label_values(&[org_id]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_counters_render() {
        init_metrics();
        record_invoice_run("org-metrics-test", "monthly_rent", "completed");
        record_overpayment("org-metrics-test");
        record_run_lease_failure(
            "org-metrics-test",
            crate::error::BillingError::validation("no settings").kind(),
        );

        let text = get_metrics();
        assert!(text.contains("lease_billing_invoice_runs_total"));
        assert!(text.contains("lease_billing_overpayments_total"));
        assert!(text.contains("kind=\"validation\""));
    }
}
