//! Billing engine facade wiring the components over one store and clock.

use crate::billing::{
    BillingSetup, CreditNoteIssuer, InvoiceGenerator, InvoiceLifecycle, InvoiceRunner,
    PaymentLedger, StatementRecorder,
};
use crate::config::EngineConfig;
use crate::services::{Clock, Store};
use std::sync::Arc;

/// All engine operations, grouped by component.
#[derive(Clone)]
pub struct BillingEngine {
    pub setup: BillingSetup,
    pub statements: StatementRecorder,
    pub generator: InvoiceGenerator,
    pub runner: InvoiceRunner,
    pub lifecycle: InvoiceLifecycle,
    pub payments: PaymentLedger,
    pub credit_notes: CreditNoteIssuer,
    store: Arc<dyn Store>,
}

impl BillingEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        let generator = InvoiceGenerator::new(
            store.clone(),
            clock.clone(),
            config.default_invoice_prefix.clone(),
        );
        Self {
            setup: BillingSetup::new(store.clone(), clock.clone()),
            statements: StatementRecorder::new(store.clone(), clock.clone()),
            runner: InvoiceRunner::new(
                store.clone(),
                clock.clone(),
                generator.clone(),
                config.max_parallel_leases,
                config.retry.to_retry_config(),
            ),
            generator,
            lifecycle: InvoiceLifecycle::new(store.clone(), clock.clone()),
            payments: PaymentLedger::new(store.clone(), clock.clone(), config.overpayment_policy),
            credit_notes: CreditNoteIssuer::new(store.clone(), clock),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
