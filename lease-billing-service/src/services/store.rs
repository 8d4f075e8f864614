//! Persistence contract used by the billing engine.
//!
//! Updates take the entity as it was read, including its `version`. The
//! store compares that version at write time, persists `version + 1` and
//! returns the stored entity; a stale version fails with
//! [`BillingError::ConcurrencyConflict`]. Archived reference rows are
//! filtered out of every list query.

use crate::error::BillingError;
use crate::models::{
    ChargeType, CreditNote, CreditNoteLine, DraftInvoiceWrite, Invoice, InvoiceLine, InvoiceRun,
    InvoiceRunItem, Lease, LeaseBillingSetting, LeaseRecurringCharge, LeaseTerm, Payment,
    PaymentConfirmationRequest, PaymentPosting, PaymentStatusHistory, UtilityRatePlan,
    UtilityRateSlab, UtilityStatement, UtilityType,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), BillingError>;

    // Leases (read-only master data)

    async fn get_lease(&self, org_id: Uuid, lease_id: Uuid) -> Result<Option<Lease>, BillingError>;

    /// Active leases billed by the monthly rent run. Leases whose billing
    /// setting disables auto-generation are excluded; leases with no setting
    /// are included so the run reports them.
    async fn list_rent_run_leases(&self, org_id: Uuid) -> Result<Vec<Lease>, BillingError>;

    async fn list_lease_terms(&self, lease_id: Uuid) -> Result<Vec<LeaseTerm>, BillingError>;

    // Billing settings

    async fn get_billing_setting(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Option<LeaseBillingSetting>, BillingError>;

    async fn insert_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError>;

    async fn update_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError>;

    // Charge types

    async fn insert_charge_type(&self, charge_type: &ChargeType)
        -> Result<ChargeType, BillingError>;

    /// Org-scoped or system charge type by id.
    async fn get_charge_type(
        &self,
        org_id: Uuid,
        charge_type_id: Uuid,
    ) -> Result<Option<ChargeType>, BillingError>;

    /// Active charge type by code, preferring the org's own row over the system row.
    async fn find_charge_type_by_code(
        &self,
        org_id: Uuid,
        code: &str,
    ) -> Result<Option<ChargeType>, BillingError>;

    // Recurring charges

    async fn insert_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError>;

    async fn get_recurring_charge(
        &self,
        org_id: Uuid,
        charge_id: Uuid,
    ) -> Result<Option<LeaseRecurringCharge>, BillingError>;

    async fn update_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError>;

    async fn list_active_recurring_charges(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Vec<LeaseRecurringCharge>, BillingError>;

    /// Recurring charge ids already billed on a non-voided invoice of the
    /// lease, ignoring `exclude_invoice_id`.
    async fn billed_recurring_charges(
        &self,
        lease_id: Uuid,
        exclude_invoice_id: Option<Uuid>,
    ) -> Result<HashSet<Uuid>, BillingError>;

    // Rate plans

    async fn insert_rate_plan(
        &self,
        plan: &UtilityRatePlan,
        slabs: &[UtilityRateSlab],
    ) -> Result<(), BillingError>;

    /// Plan with its slabs ordered by `slab_order`.
    async fn get_rate_plan(
        &self,
        org_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<(UtilityRatePlan, Vec<UtilityRateSlab>)>, BillingError>;

    // Utility statements

    async fn insert_utility_statement(
        &self,
        statement: &UtilityStatement,
    ) -> Result<UtilityStatement, BillingError>;

    async fn get_utility_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<UtilityStatement>, BillingError>;

    /// Highest statement version recorded for the key, archived rows included.
    async fn latest_statement_version(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<i32>, BillingError>;

    async fn find_final_statement(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<UtilityStatement>, BillingError>;

    /// Mark `statement` final and archive `superseded` in one atomic unit.
    async fn finalize_statement(
        &self,
        statement: &UtilityStatement,
        superseded: Option<&UtilityStatement>,
    ) -> Result<UtilityStatement, BillingError>;

    /// Final, active statements whose period lies within the billing period
    /// and that are unlinked or linked to `draft_invoice_id`.
    async fn list_billable_statements(
        &self,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        draft_invoice_id: Option<Uuid>,
    ) -> Result<Vec<UtilityStatement>, BillingError>;

    /// Active leases holding final, unlinked statements within the period.
    async fn list_utility_run_leases(
        &self,
        org_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Lease>, BillingError>;

    // Numbering

    /// Next value of the per (org, prefix, YYYYMM) sequence, starting at 1.
    async fn next_sequence(
        &self,
        org_id: Uuid,
        prefix: &str,
        year_month: &str,
    ) -> Result<i64, BillingError>;

    // Invoices

    async fn find_invoice_for_period(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, BillingError>;

    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, BillingError>;

    /// Lines ordered by `line_number`.
    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError>;

    /// Insert or replace a draft invoice, its lines and statement links atomically.
    async fn save_draft_invoice(&self, write: &DraftInvoiceWrite) -> Result<Invoice, BillingError>;

    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, BillingError>;

    /// Issued or partially paid invoices due before `as_of` with a positive balance.
    async fn list_overdue_candidates(
        &self,
        org_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<Vec<Invoice>, BillingError>;

    // Invoice runs

    async fn insert_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError>;

    async fn update_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError>;

    async fn insert_invoice_run_item(&self, item: &InvoiceRunItem) -> Result<(), BillingError>;

    async fn get_invoice_run(
        &self,
        org_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<InvoiceRun>, BillingError>;

    async fn list_invoice_run_items(&self, run_id: Uuid)
        -> Result<Vec<InvoiceRunItem>, BillingError>;

    // Payments

    /// Persist a payment transition with its history entry and any invoice
    /// or confirmation request change in one atomic unit.
    async fn post_payment(&self, posting: &PaymentPosting) -> Result<Payment, BillingError>;

    async fn get_payment(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, BillingError>;

    /// History ordered oldest first.
    async fn list_payment_history(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentStatusHistory>, BillingError>;

    async fn insert_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError>;

    async fn get_confirmation_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<PaymentConfirmationRequest>, BillingError>;

    async fn update_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError>;

    // Credit notes

    async fn insert_credit_note(
        &self,
        note: &CreditNote,
        lines: &[CreditNoteLine],
    ) -> Result<CreditNote, BillingError>;

    async fn get_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<Option<CreditNote>, BillingError>;

    async fn get_credit_note_lines(
        &self,
        credit_note_id: Uuid,
    ) -> Result<Vec<CreditNoteLine>, BillingError>;

    async fn update_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError>;

    /// Write `note` as issued after re-checking, under a lock on its invoice,
    /// that its lines fit within what issued notes have left on each invoice
    /// line.
    async fn issue_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError>;

    /// Amount already credited per invoice line by issued credit notes.
    async fn issued_credit_totals(
        &self,
        invoice_id: Uuid,
    ) -> Result<HashMap<Uuid, Decimal>, BillingError>;
}
