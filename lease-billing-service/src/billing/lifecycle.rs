//! Invoice state transitions after generation.

use crate::error::BillingError;
use crate::models::{Invoice, InvoiceLine, InvoiceStatus};
use crate::services::metrics::record_invoice_transition;
use crate::services::{Clock, Store};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct InvoiceLifecycle {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl InvoiceLifecycle {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn load(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    /// Invoice header with its lines.
    pub async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<(Invoice, Vec<InvoiceLine>), BillingError> {
        let invoice = self.load(org_id, invoice_id).await?;
        let lines = self.store.get_invoice_lines(invoice_id).await?;
        Ok((invoice, lines))
    }

    /// Draft to Issued. The invoice must carry at least one line.
    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    pub async fn issue(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let mut invoice = self.load(org_id, invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::immutable(format!(
                "invoice {} is {}, only drafts can be issued",
                invoice.invoice_number, invoice.status
            )));
        }
        if self.store.get_invoice_lines(invoice_id).await?.is_empty() {
            return Err(BillingError::validation(format!(
                "invoice {} has no lines",
                invoice.invoice_number
            )));
        }

        let now = self.clock.now();
        invoice.status = InvoiceStatus::Issued;
        invoice.issued_at_utc = Some(now);
        invoice.updated_utc = now;
        let invoice = self.store.update_invoice(&invoice).await?;

        record_invoice_transition(&org_id.to_string(), invoice.status.as_str());
        info!(invoice_number = %invoice.invoice_number, total_amount = %invoice.total_amount, "Invoice issued");
        Ok(invoice)
    }

    /// Void a draft or open invoice. Voided is terminal.
    #[instrument(skip(self, reason), fields(org_id = %org_id, invoice_id = %invoice_id))]
    pub async fn void(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        reason: &str,
    ) -> Result<Invoice, BillingError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::validation("void reason is required"));
        }

        let mut invoice = self.load(org_id, invoice_id).await?;
        if matches!(
            invoice.status,
            InvoiceStatus::Voided | InvoiceStatus::Paid | InvoiceStatus::WrittenOff
        ) {
            return Err(BillingError::immutable(format!(
                "invoice {} is {} and cannot be voided",
                invoice.invoice_number, invoice.status
            )));
        }

        let now = self.clock.now();
        invoice.status = InvoiceStatus::Voided;
        invoice.voided_at_utc = Some(now);
        invoice.void_reason = Some(reason.to_string());
        invoice.updated_utc = now;
        let invoice = self.store.update_invoice(&invoice).await?;

        record_invoice_transition(&org_id.to_string(), invoice.status.as_str());
        info!(invoice_number = %invoice.invoice_number, reason, "Invoice voided");
        Ok(invoice)
    }

    /// Label open invoices past their due date as overdue. Returns how many
    /// were relabelled.
    #[instrument(skip(self), fields(org_id = %org_id))]
    pub async fn mark_overdue(&self, org_id: Uuid, as_of: NaiveDate) -> Result<usize, BillingError> {
        let candidates = self.store.list_overdue_candidates(org_id, as_of).await?;
        let now = self.clock.now();
        let mut marked = 0;

        for mut invoice in candidates {
            invoice.status = InvoiceStatus::Overdue;
            invoice.updated_utc = now;
            match self.store.update_invoice(&invoice).await {
                Ok(_) => {
                    marked += 1;
                    record_invoice_transition(&org_id.to_string(), InvoiceStatus::Overdue.as_str());
                }
                Err(e @ BillingError::ConcurrencyConflict { .. }) => {
                    warn!(invoice_id = %invoice.invoice_id, error = %e, "Skipping overdue label");
                }
                Err(e) => return Err(e),
            }
        }

        info!(as_of = %as_of, marked, "Overdue invoices labelled");
        Ok(marked)
    }

    /// Write off the outstanding balance of an open invoice.
    #[instrument(skip(self, reason), fields(org_id = %org_id, invoice_id = %invoice_id))]
    pub async fn write_off(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        reason: &str,
    ) -> Result<Invoice, BillingError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::validation("write-off reason is required"));
        }

        let mut invoice = self.load(org_id, invoice_id).await?;
        if !invoice.status.is_open() {
            return Err(BillingError::immutable(format!(
                "invoice {} is {}, only open invoices can be written off",
                invoice.invoice_number, invoice.status
            )));
        }

        invoice.status = InvoiceStatus::WrittenOff;
        invoice.write_off_reason = Some(reason.to_string());
        invoice.updated_utc = self.clock.now();
        let invoice = self.store.update_invoice(&invoice).await?;

        record_invoice_transition(&org_id.to_string(), invoice.status.as_str());
        warn!(
            invoice_number = %invoice.invoice_number,
            balance_amount = %invoice.balance_amount,
            reason,
            "Invoice written off"
        );
        Ok(invoice)
    }
}
