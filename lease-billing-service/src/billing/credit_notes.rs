//! Credit notes against posted invoice lines.

use super::generator::{format_document_number, year_month};
use crate::error::BillingError;
use crate::models::{
    CreateCreditNote, CreditNote, CreditNoteLine, CreditNoteStatus, Invoice, InvoiceLine,
    InvoiceStatus,
};
use crate::services::metrics::record_credit_note_issued;
use crate::services::{Clock, Store};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

pub const CREDIT_NOTE_PREFIX: &str = "CN";

#[derive(Clone)]
pub struct CreditNoteIssuer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

/// Total credit per invoice line.
pub(crate) fn sum_by_invoice_line<'a>(
    lines: impl IntoIterator<Item = &'a CreditNoteLine>,
) -> HashMap<Uuid, Decimal> {
    let mut totals: HashMap<Uuid, Decimal> = HashMap::new();
    for line in lines {
        *totals.entry(line.invoice_line_id).or_default() += line.amount;
    }
    totals
}

/// Check requested credits per invoice line against what is left to credit.
pub(crate) fn check_remaining(
    invoice_lines: &[InvoiceLine],
    already_credited: &HashMap<Uuid, Decimal>,
    requested: &HashMap<Uuid, Decimal>,
) -> Result<(), BillingError> {
    for (line_id, amount) in requested {
        let line = invoice_lines
            .iter()
            .find(|l| l.line_id == *line_id)
            .ok_or_else(|| BillingError::not_found("invoice_line", line_id))?;
        let credited = already_credited
            .get(line_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let remaining = line.total_amount - credited;
        if *amount > remaining {
            return Err(BillingError::validation(format!(
                "credit of {} on line {} exceeds remaining {}",
                amount, line.line_number, remaining
            )));
        }
    }
    Ok(())
}

fn check_creditable(invoice: &Invoice) -> Result<(), BillingError> {
    match invoice.status {
        InvoiceStatus::Draft => Err(BillingError::validation(format!(
            "invoice {} has not been issued",
            invoice.invoice_number
        ))),
        InvoiceStatus::Voided | InvoiceStatus::WrittenOff => Err(BillingError::immutable(format!(
            "invoice {} is {} and cannot be credited",
            invoice.invoice_number, invoice.status
        ))),
        _ => Ok(()),
    }
}

impl CreditNoteIssuer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn load_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn load(&self, org_id: Uuid, credit_note_id: Uuid) -> Result<CreditNote, BillingError> {
        self.store
            .get_credit_note(org_id, credit_note_id)
            .await?
            .ok_or_else(|| BillingError::not_found("credit_note", credit_note_id))
    }

    /// Create a draft credit note. Each line must belong to the invoice and
    /// stay within the line's un-credited total.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, invoice_id = %input.invoice_id))]
    pub async fn create_credit_note(
        &self,
        input: CreateCreditNote,
    ) -> Result<(CreditNote, Vec<CreditNoteLine>), BillingError> {
        input.validate()?;
        let reason = input.reason.trim();
        if reason.is_empty() {
            return Err(BillingError::validation("reason is required"));
        }

        let invoice = self.load_invoice(input.org_id, input.invoice_id).await?;
        check_creditable(&invoice)?;

        let invoice_lines = self.store.get_invoice_lines(invoice.invoice_id).await?;
        let mut requested: HashMap<Uuid, Decimal> = HashMap::new();
        for line in &input.lines {
            if line.amount <= Decimal::ZERO {
                return Err(BillingError::validation("credit amount must be positive"));
            }
            if !invoice_lines.iter().any(|l| l.line_id == line.invoice_line_id) {
                return Err(BillingError::validation(format!(
                    "line {} does not belong to invoice {}",
                    line.invoice_line_id, invoice.invoice_number
                )));
            }
            *requested.entry(line.invoice_line_id).or_default() += line.amount;
        }
        let credited = self.store.issued_credit_totals(invoice.invoice_id).await?;
        check_remaining(&invoice_lines, &credited, &requested)?;

        let now = self.clock.now();
        let ym = year_month(self.clock.today());
        let sequence = self
            .store
            .next_sequence(input.org_id, CREDIT_NOTE_PREFIX, &ym)
            .await?;

        let credit_note_id = Uuid::new_v4();
        let lines: Vec<CreditNoteLine> = input
            .lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let description = line.description.clone().unwrap_or_else(|| {
                    invoice_lines
                        .iter()
                        .find(|l| l.line_id == line.invoice_line_id)
                        .map(|l| format!("Credit: {}", l.description))
                        .unwrap_or_default()
                });
                CreditNoteLine {
                    line_id: Uuid::new_v4(),
                    credit_note_id,
                    invoice_line_id: line.invoice_line_id,
                    line_number: i as i32 + 1,
                    description,
                    amount: line.amount,
                    created_utc: now,
                }
            })
            .collect();

        let note = CreditNote {
            credit_note_id,
            org_id: input.org_id,
            invoice_id: invoice.invoice_id,
            credit_note_number: format_document_number(CREDIT_NOTE_PREFIX, &ym, sequence),
            reason: reason.to_string(),
            status: CreditNoteStatus::Draft,
            total_amount: lines.iter().map(|l| l.amount).sum(),
            applied_at_utc: None,
            version: 1,
            created_utc: now,
            updated_utc: now,
        };
        let note = self.store.insert_credit_note(&note, &lines).await?;

        info!(
            credit_note_number = %note.credit_note_number,
            total_amount = %note.total_amount,
            "Credit note created"
        );
        Ok((note, lines))
    }

    /// Draft to Issued. The store re-checks the remaining amounts atomically
    /// with the status change.
    #[instrument(skip(self), fields(org_id = %org_id, credit_note_id = %credit_note_id))]
    pub async fn issue_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<CreditNote, BillingError> {
        let mut note = self.load(org_id, credit_note_id).await?;
        if note.status != CreditNoteStatus::Draft {
            return Err(BillingError::immutable(format!(
                "credit note {} is {}",
                note.credit_note_number,
                note.status.as_str()
            )));
        }

        let invoice = self.load_invoice(org_id, note.invoice_id).await?;
        check_creditable(&invoice)?;

        let now = self.clock.now();
        note.status = CreditNoteStatus::Issued;
        note.applied_at_utc = Some(now);
        note.updated_utc = now;
        let note = self.store.issue_credit_note(&note).await?;

        record_credit_note_issued(&org_id.to_string());
        info!(
            credit_note_number = %note.credit_note_number,
            invoice_number = %invoice.invoice_number,
            total_amount = %note.total_amount,
            "Credit note issued"
        );
        Ok(note)
    }

    #[instrument(skip(self), fields(org_id = %org_id, credit_note_id = %credit_note_id))]
    pub async fn cancel_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<CreditNote, BillingError> {
        let mut note = self.load(org_id, credit_note_id).await?;
        if note.status != CreditNoteStatus::Draft {
            return Err(BillingError::immutable(format!(
                "credit note {} is {}",
                note.credit_note_number,
                note.status.as_str()
            )));
        }

        note.status = CreditNoteStatus::Cancelled;
        note.updated_utc = self.clock.now();
        let note = self.store.update_credit_note(&note).await?;

        info!(credit_note_number = %note.credit_note_number, "Credit note cancelled");
        Ok(note)
    }

    /// Credit note header with its lines.
    pub async fn get_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<(CreditNote, Vec<CreditNoteLine>), BillingError> {
        let note = self.load(org_id, credit_note_id).await?;
        let lines = self.store.get_credit_note_lines(credit_note_id).await?;
        Ok((note, lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineSource;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn invoice_line(total: Decimal) -> InvoiceLine {
        InvoiceLine {
            line_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            line_number: 1,
            description: "Rent".to_string(),
            source: LineSource::Rent,
            source_ref_id: None,
            charge_type_id: None,
            quantity: Decimal::ONE,
            unit_price: total,
            amount: total,
            tax_rate: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total_amount: total,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn test_remaining_counts_issued_credits() {
        let line = invoice_line(dec!(100));
        let credited = HashMap::from([(line.line_id, dec!(60))]);

        let ok = HashMap::from([(line.line_id, dec!(40))]);
        assert!(check_remaining(std::slice::from_ref(&line), &credited, &ok).is_ok());

        let too_much = HashMap::from([(line.line_id, dec!(40.01))]);
        let err = check_remaining(std::slice::from_ref(&line), &credited, &too_much).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
