//! Single-lease invoice generation.

use super::line_builder::{build_lines, BillingContext, DraftLine};
use crate::error::BillingError;
use crate::models::{
    codes, DraftInvoiceWrite, Invoice, InvoiceLine, InvoiceStatus, LeaseStatus, LineSource,
    ProrationMethod, UtilityType,
};
use crate::services::metrics::record_invoice_generated;
use crate::services::{Clock, Store};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub const DEFAULT_INVOICE_PREFIX: &str = "INV";

/// Result of [`InvoiceGenerator::generate_invoice`].
#[derive(Debug, Clone)]
pub struct GeneratedInvoice {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
    /// An existing draft was regenerated in place.
    pub was_updated: bool,
}

/// `YYYYMM` of the given date.
pub fn year_month(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

pub fn format_document_number(prefix: &str, year_month: &str, sequence: i64) -> String {
    format!("{}-{}-{:04}", prefix, year_month, sequence)
}

#[derive(Clone)]
pub struct InvoiceGenerator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    default_prefix: String,
}

impl InvoiceGenerator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, default_prefix: String) -> Self {
        Self {
            store,
            clock,
            default_prefix,
        }
    }

    /// Create or regenerate the draft invoice for one lease and period.
    ///
    /// A draft for the same lease and period is replaced in place, keeping its
    /// id and number. Any other status is immutable.
    #[instrument(skip(self), fields(org_id = %org_id, lease_id = %lease_id))]
    pub async fn generate_invoice(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        proration_method: Option<ProrationMethod>,
    ) -> Result<GeneratedInvoice, BillingError> {
        if period_end < period_start {
            return Err(BillingError::validation(format!(
                "period end {} is before period start {}",
                period_end, period_start
            )));
        }

        let lease = self
            .store
            .get_lease(org_id, lease_id)
            .await?
            .ok_or_else(|| BillingError::not_found("lease", lease_id))?;
        if lease.status != LeaseStatus::Active {
            return Err(BillingError::validation(format!(
                "lease {} is {}, only active leases are billed",
                lease_id,
                lease.status.as_str()
            )));
        }

        let setting = self
            .store
            .get_billing_setting(org_id, lease_id)
            .await?
            .ok_or_else(|| {
                BillingError::validation(format!("lease {} has no billing settings", lease_id))
            })?;

        let existing = self
            .store
            .find_invoice_for_period(org_id, lease_id, period_start, period_end)
            .await?;
        if let Some(invoice) = &existing {
            if invoice.status != InvoiceStatus::Draft {
                return Err(BillingError::immutable(format!(
                    "invoice {} for this period is {}",
                    invoice.invoice_number, invoice.status
                )));
            }
        }
        let existing_id = existing.as_ref().map(|i| i.invoice_id);

        let ctx = BillingContext {
            terms: self.store.list_lease_terms(lease_id).await?,
            proration_method: proration_method.unwrap_or(setting.proration_method),
            recurring_charges: self
                .store
                .list_active_recurring_charges(org_id, lease_id)
                .await?,
            charge_types: HashMap::new(),
            rent_charge_type: self
                .store
                .find_charge_type_by_code(org_id, codes::RENT)
                .await?,
            utility_charge_types: HashMap::new(),
            statements: self
                .store
                .list_billable_statements(lease_id, period_start, period_end, existing_id)
                .await?,
            billed_elsewhere: self
                .store
                .billed_recurring_charges(lease_id, existing_id)
                .await?,
            lease,
        };
        let ctx = self.resolve_charge_types(org_id, ctx).await?;

        let built = build_lines(&ctx, period_start, period_end)?;
        let now = self.clock.now();

        let (mut invoice, is_new) = match existing {
            Some(draft) => (draft, false),
            None => {
                let prefix = if setting.invoice_prefix.trim().is_empty() {
                    self.default_prefix.as_str()
                } else {
                    setting.invoice_prefix.as_str()
                };
                let ym = year_month(period_start);
                let sequence = self.store.next_sequence(org_id, prefix, &ym).await?;
                let invoice_date = self.clock.today();
                (
                    Invoice {
                        invoice_id: Uuid::new_v4(),
                        org_id,
                        lease_id,
                        invoice_number: format_document_number(prefix, &ym, sequence),
                        period_start,
                        period_end,
                        invoice_date,
                        due_date: invoice_date,
                        sub_total: Decimal::ZERO,
                        tax_amount: Decimal::ZERO,
                        total_amount: Decimal::ZERO,
                        paid_amount: Decimal::ZERO,
                        balance_amount: Decimal::ZERO,
                        status: InvoiceStatus::Draft,
                        has_overpayment: false,
                        issued_at_utc: None,
                        voided_at_utc: None,
                        paid_at_utc: None,
                        void_reason: None,
                        write_off_reason: None,
                        version: 1,
                        created_utc: now,
                        updated_utc: now,
                    },
                    true,
                )
            }
        };

        invoice.due_date =
            invoice.invoice_date + Duration::days(i64::from(setting.payment_term_days));
        invoice.sub_total = built.sub_total;
        invoice.tax_amount = built.tax_amount;
        invoice.total_amount = built.total_amount;
        invoice.paid_amount = Decimal::ZERO;
        invoice.balance_amount = built.total_amount;
        invoice.updated_utc = now;

        let lines: Vec<InvoiceLine> = built
            .lines
            .into_iter()
            .map(|line| to_invoice_line(invoice.invoice_id, line, now))
            .collect();
        let statement_links = lines
            .iter()
            .filter(|l| l.source == LineSource::Utility)
            .filter_map(|l| l.source_ref_id.map(|statement_id| (statement_id, l.line_id)))
            .collect();

        let saved = self
            .store
            .save_draft_invoice(&DraftInvoiceWrite {
                invoice,
                is_new,
                lines: lines.clone(),
                statement_links,
            })
            .await?;

        let outcome = if is_new { "created" } else { "updated" };
        record_invoice_generated(&org_id.to_string(), outcome);
        info!(
            invoice_id = %saved.invoice_id,
            invoice_number = %saved.invoice_number,
            line_count = lines.len(),
            total_amount = %saved.total_amount,
            outcome,
            "Draft invoice generated"
        );

        Ok(GeneratedInvoice {
            invoice: saved,
            lines,
            was_updated: !is_new,
        })
    }

    /// Load the charge types referenced by recurring charges and the system
    /// utility codes. Unresolvable recurring types are left out so the line
    /// builder reports them.
    async fn resolve_charge_types(
        &self,
        org_id: Uuid,
        mut ctx: BillingContext,
    ) -> Result<BillingContext, BillingError> {
        for charge in &ctx.recurring_charges {
            if ctx.charge_types.contains_key(&charge.charge_type_id) {
                continue;
            }
            if let Some(ct) = self
                .store
                .get_charge_type(org_id, charge.charge_type_id)
                .await?
            {
                ctx.charge_types.insert(ct.charge_type_id, ct);
            }
        }

        for utility_type in [
            UtilityType::Electricity,
            UtilityType::Water,
            UtilityType::Gas,
            UtilityType::Other,
        ] {
            if !ctx.statements.iter().any(|s| s.utility_type == utility_type) {
                continue;
            }
            if let Some(ct) = self
                .store
                .find_charge_type_by_code(org_id, utility_type.charge_code())
                .await?
            {
                ctx.utility_charge_types.insert(utility_type, ct);
            }
        }

        Ok(ctx)
    }
}

fn to_invoice_line(invoice_id: Uuid, line: DraftLine, now: DateTime<Utc>) -> InvoiceLine {
    InvoiceLine {
        line_id: Uuid::new_v4(),
        invoice_id,
        line_number: line.line_number,
        description: line.description,
        source: line.source,
        source_ref_id: line.source_ref_id,
        charge_type_id: line.charge_type_id,
        quantity: line.quantity,
        unit_price: line.unit_price,
        amount: line.amount,
        tax_rate: line.tax_rate,
        tax_amount: line.tax_amount,
        total_amount: line.total_amount,
        created_utc: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_number_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(year_month(date), "202403");
        assert_eq!(format_document_number("INV", "202403", 7), "INV-202403-0007");
        assert_eq!(format_document_number("CN", "202403", 12345), "CN-202403-12345");
    }
}
