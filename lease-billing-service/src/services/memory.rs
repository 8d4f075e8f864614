//! In-process store backed by a single Tokio `RwLock`.
//!
//! Every atomic unit validates all version tokens under the write lock before
//! applying any change, so a conflict leaves the state untouched.

use crate::billing::credit_notes::{check_remaining, sum_by_invoice_line};
use crate::error::BillingError;
use crate::models::{
    ChargeType, CreditNote, CreditNoteLine, CreditNoteStatus, DraftInvoiceWrite, Invoice,
    InvoiceLine, InvoiceRun, InvoiceRunItem, InvoiceStatus, Lease, LeaseBillingSetting,
    LeaseRecurringCharge, LeaseStatus, LeaseTerm, LineSource, Payment, PaymentConfirmationRequest,
    PaymentPosting, PaymentStatusHistory, RecordState, UtilityRatePlan, UtilityRateSlab,
    UtilityStatement, UtilityType,
};
use crate::services::store::Store;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

#[derive(Default)]
struct State {
    leases: HashMap<Uuid, Lease>,
    terms: Vec<LeaseTerm>,
    settings: HashMap<Uuid, LeaseBillingSetting>,
    charge_types: HashMap<Uuid, ChargeType>,
    recurring_charges: HashMap<Uuid, LeaseRecurringCharge>,
    rate_plans: HashMap<Uuid, (UtilityRatePlan, Vec<UtilityRateSlab>)>,
    statements: HashMap<Uuid, UtilityStatement>,
    sequences: HashMap<(Uuid, String, String), i64>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_lines: HashMap<Uuid, Vec<InvoiceLine>>,
    runs: HashMap<Uuid, InvoiceRun>,
    run_items: Vec<InvoiceRunItem>,
    payments: HashMap<Uuid, Payment>,
    history: Vec<PaymentStatusHistory>,
    requests: HashMap<Uuid, PaymentConfirmationRequest>,
    credit_notes: HashMap<Uuid, CreditNote>,
    credit_note_lines: HashMap<Uuid, Vec<CreditNoteLine>>,
}

impl State {
    fn is_final_live(s: &UtilityStatement) -> bool {
        s.is_final && s.state == RecordState::Active
    }

    fn same_key(a: &UtilityStatement, b: &UtilityStatement) -> bool {
        a.lease_id == b.lease_id
            && a.utility_type == b.utility_type
            && a.period_start == b.period_start
            && a.period_end == b.period_end
    }

    fn check_invoice_version(&self, invoice: &Invoice) -> Result<(), BillingError> {
        match self.invoices.get(&invoice.invoice_id) {
            Some(stored) if stored.version == invoice.version => Ok(()),
            _ => Err(BillingError::conflict("invoice", invoice.invoice_id)),
        }
    }

    fn check_request_version(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<(), BillingError> {
        match self.requests.get(&request.request_id) {
            Some(stored) if stored.version == request.version => Ok(()),
            _ => Err(BillingError::conflict(
                "payment_confirmation_request",
                request.request_id,
            )),
        }
    }

    fn put_invoice(&mut self, invoice: &Invoice) -> Invoice {
        let mut next = invoice.clone();
        next.version += 1;
        self.invoices.insert(next.invoice_id, next.clone());
        next
    }

    fn check_credit_note_version(&self, note: &CreditNote) -> Result<(), BillingError> {
        match self.credit_notes.get(&note.credit_note_id) {
            Some(stored) if stored.version == note.version => Ok(()),
            _ => Err(BillingError::conflict("credit_note", note.credit_note_id)),
        }
    }

    fn put_credit_note(&mut self, note: &CreditNote) -> CreditNote {
        let mut next = note.clone();
        next.version += 1;
        self.credit_notes.insert(next.credit_note_id, next.clone());
        next
    }

    fn issued_credits(&self, invoice_id: Uuid) -> HashMap<Uuid, Decimal> {
        sum_by_invoice_line(
            self.credit_notes
                .values()
                .filter(|n| n.invoice_id == invoice_id && n.status == CreditNoteStatus::Issued)
                .flat_map(|n| self.credit_note_lines.get(&n.credit_note_id).into_iter().flatten()),
        )
    }

    fn put_request(&mut self, request: &PaymentConfirmationRequest) -> PaymentConfirmationRequest {
        let mut next = request.clone();
        next.version += 1;
        self.requests.insert(next.request_id, next.clone());
        next
    }
}

/// In-memory [`Store`] for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert lease master data.
    pub async fn seed_lease(&self, lease: Lease) {
        self.state.write().await.leases.insert(lease.lease_id, lease);
    }

    /// Insert a rent term for a seeded lease.
    pub async fn seed_lease_term(&self, term: LeaseTerm) {
        self.state.write().await.terms.push(term);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), BillingError> {
        Ok(())
    }

    async fn get_lease(&self, org_id: Uuid, lease_id: Uuid) -> Result<Option<Lease>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .leases
            .get(&lease_id)
            .filter(|l| l.org_id == org_id)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn list_rent_run_leases(&self, org_id: Uuid) -> Result<Vec<Lease>, BillingError> {
        let state = self.state.read().await;
        let mut leases: Vec<Lease> = state
            .leases
            .values()
            .filter(|l| l.org_id == org_id && l.status == LeaseStatus::Active)
            .filter(|l| {
                state
                    .settings
                    .get(&l.lease_id)
                    .map_or(true, |s| s.auto_generate)
            })
            .cloned()
            .collect();
        leases.sort_by_key(|l| (l.start_date, l.lease_id));
        Ok(leases)
    }

    async fn list_lease_terms(&self, lease_id: Uuid) -> Result<Vec<LeaseTerm>, BillingError> {
        let state = self.state.read().await;
        let mut terms: Vec<LeaseTerm> = state
            .terms
            .iter()
            .filter(|t| t.lease_id == lease_id)
            .cloned()
            .collect();
        terms.sort_by_key(|t| (t.start_date, t.term_id));
        Ok(terms)
    }

    async fn get_billing_setting(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Option<LeaseBillingSetting>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .settings
            .get(&lease_id)
            .filter(|s| s.org_id == org_id)
            .cloned())
    }

    async fn insert_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError> {
        let mut state = self.state.write().await;
        if state.settings.contains_key(&setting.lease_id) {
            return Err(BillingError::conflict(
                "lease_billing_setting",
                setting.lease_id,
            ));
        }
        state.settings.insert(setting.lease_id, setting.clone());
        Ok(setting.clone())
    }

    async fn update_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError> {
        let mut state = self.state.write().await;
        match state.settings.get(&setting.lease_id) {
            Some(stored)
                if stored.setting_id == setting.setting_id && stored.version == setting.version => {}
            _ => {
                return Err(BillingError::conflict(
                    "lease_billing_setting",
                    setting.setting_id,
                ))
            }
        }
        let mut next = setting.clone();
        next.version += 1;
        state.settings.insert(next.lease_id, next.clone());
        Ok(next)
    }

    async fn insert_charge_type(
        &self,
        charge_type: &ChargeType,
    ) -> Result<ChargeType, BillingError> {
        let mut state = self.state.write().await;
        let duplicate = state.charge_types.values().any(|c| {
            c.org_id == charge_type.org_id
                && c.code == charge_type.code
                && c.state == RecordState::Active
        });
        if duplicate {
            return Err(BillingError::validation(format!(
                "charge type code {} already exists",
                charge_type.code
            )));
        }
        state
            .charge_types
            .insert(charge_type.charge_type_id, charge_type.clone());
        Ok(charge_type.clone())
    }

    async fn get_charge_type(
        &self,
        org_id: Uuid,
        charge_type_id: Uuid,
    ) -> Result<Option<ChargeType>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .charge_types
            .get(&charge_type_id)
            .filter(|c| c.org_id.map_or(true, |o| o == org_id))
            .cloned())
    }

    async fn find_charge_type_by_code(
        &self,
        org_id: Uuid,
        code: &str,
    ) -> Result<Option<ChargeType>, BillingError> {
        let state = self.state.read().await;
        let candidates = state
            .charge_types
            .values()
            .filter(|c| c.code == code && c.state == RecordState::Active);
        let mut system = None;
        for c in candidates {
            match c.org_id {
                Some(o) if o == org_id => return Ok(Some(c.clone())),
                None => system = Some(c.clone()),
                Some(_) => {}
            }
        }
        Ok(system)
    }

    async fn insert_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        let mut state = self.state.write().await;
        state
            .recurring_charges
            .insert(charge.charge_id, charge.clone());
        Ok(charge.clone())
    }

    async fn get_recurring_charge(
        &self,
        org_id: Uuid,
        charge_id: Uuid,
    ) -> Result<Option<LeaseRecurringCharge>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .recurring_charges
            .get(&charge_id)
            .filter(|c| c.org_id == org_id)
            .cloned())
    }

    async fn update_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        let mut state = self.state.write().await;
        match state.recurring_charges.get(&charge.charge_id) {
            Some(stored) if stored.version == charge.version => {}
            _ => {
                return Err(BillingError::conflict(
                    "lease_recurring_charge",
                    charge.charge_id,
                ))
            }
        }
        let mut next = charge.clone();
        next.version += 1;
        state.recurring_charges.insert(next.charge_id, next.clone());
        Ok(next)
    }

    async fn list_active_recurring_charges(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Vec<LeaseRecurringCharge>, BillingError> {
        let state = self.state.read().await;
        let mut charges: Vec<LeaseRecurringCharge> = state
            .recurring_charges
            .values()
            .filter(|c| {
                c.org_id == org_id && c.lease_id == lease_id && c.state == RecordState::Active
            })
            .cloned()
            .collect();
        charges.sort_by_key(|c| (c.start_date, c.charge_id));
        Ok(charges)
    }

    async fn billed_recurring_charges(
        &self,
        lease_id: Uuid,
        exclude_invoice_id: Option<Uuid>,
    ) -> Result<HashSet<Uuid>, BillingError> {
        let state = self.state.read().await;
        let ids = state
            .invoices
            .values()
            .filter(|i| {
                i.lease_id == lease_id
                    && i.status != InvoiceStatus::Voided
                    && Some(i.invoice_id) != exclude_invoice_id
            })
            .filter_map(|i| state.invoice_lines.get(&i.invoice_id))
            .flatten()
            .filter(|l| l.source == LineSource::RecurringCharge)
            .filter_map(|l| l.source_ref_id)
            .collect();
        Ok(ids)
    }

    async fn insert_rate_plan(
        &self,
        plan: &UtilityRatePlan,
        slabs: &[UtilityRateSlab],
    ) -> Result<(), BillingError> {
        let mut state = self.state.write().await;
        state
            .rate_plans
            .insert(plan.plan_id, (plan.clone(), slabs.to_vec()));
        Ok(())
    }

    async fn get_rate_plan(
        &self,
        org_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<(UtilityRatePlan, Vec<UtilityRateSlab>)>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .rate_plans
            .get(&plan_id)
            .filter(|(p, _)| p.org_id == org_id && p.state == RecordState::Active)
            .map(|(p, slabs)| {
                let mut slabs = slabs.clone();
                slabs.sort_by_key(|s| s.slab_order);
                (p.clone(), slabs)
            }))
    }

    async fn insert_utility_statement(
        &self,
        statement: &UtilityStatement,
    ) -> Result<UtilityStatement, BillingError> {
        let mut state = self.state.write().await;
        let taken = state.statements.values().any(|s| {
            State::same_key(s, statement) && s.statement_version == statement.statement_version
        });
        if taken {
            return Err(BillingError::conflict(
                "utility_statement",
                statement.lease_id,
            ));
        }
        state
            .statements
            .insert(statement.statement_id, statement.clone());
        Ok(statement.clone())
    }

    async fn get_utility_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<UtilityStatement>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .statements
            .get(&statement_id)
            .filter(|s| s.org_id == org_id)
            .cloned())
    }

    async fn latest_statement_version(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<i32>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .statements
            .values()
            .filter(|s| {
                s.lease_id == lease_id
                    && s.utility_type == utility_type
                    && s.period_start == period_start
                    && s.period_end == period_end
            })
            .map(|s| s.statement_version)
            .max())
    }

    async fn find_final_statement(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<UtilityStatement>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .statements
            .values()
            .find(|s| {
                State::is_final_live(s)
                    && s.lease_id == lease_id
                    && s.utility_type == utility_type
                    && s.period_start == period_start
                    && s.period_end == period_end
            })
            .cloned())
    }

    #[instrument(skip(self, statement, superseded), fields(statement_id = %statement.statement_id))]
    async fn finalize_statement(
        &self,
        statement: &UtilityStatement,
        superseded: Option<&UtilityStatement>,
    ) -> Result<UtilityStatement, BillingError> {
        let mut state = self.state.write().await;

        match state.statements.get(&statement.statement_id) {
            Some(stored)
                if stored.version == statement.version && stored.state == RecordState::Active => {}
            _ => {
                return Err(BillingError::conflict(
                    "utility_statement",
                    statement.statement_id,
                ))
            }
        }
        if let Some(previous) = superseded {
            match state.statements.get(&previous.statement_id) {
                Some(stored) if stored.version == previous.version && !stored.is_invoiced() => {}
                _ => {
                    return Err(BillingError::conflict(
                        "utility_statement",
                        previous.statement_id,
                    ))
                }
            }
        }
        let other_final = state.statements.values().any(|s| {
            State::is_final_live(s)
                && State::same_key(s, statement)
                && s.statement_id != statement.statement_id
                && superseded.map_or(true, |p| p.statement_id != s.statement_id)
        });
        if other_final {
            return Err(BillingError::conflict(
                "utility_statement",
                statement.statement_id,
            ));
        }

        if let Some(previous) = superseded {
            if let Some(stored) = state.statements.get_mut(&previous.statement_id) {
                stored.state = RecordState::Archived;
                stored.updated_utc = statement.updated_utc;
                stored.version += 1;
            }
        }
        let mut next = statement.clone();
        next.is_final = true;
        next.version += 1;
        state.statements.insert(next.statement_id, next.clone());
        Ok(next)
    }

    async fn list_billable_statements(
        &self,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        draft_invoice_id: Option<Uuid>,
    ) -> Result<Vec<UtilityStatement>, BillingError> {
        let state = self.state.read().await;
        let mut statements: Vec<UtilityStatement> = state
            .statements
            .values()
            .filter(|s| {
                s.lease_id == lease_id
                    && State::is_final_live(s)
                    && s.period_start >= period_start
                    && s.period_end <= period_end
                    && (s.invoice_id.is_none() || s.invoice_id == draft_invoice_id)
            })
            .cloned()
            .collect();
        statements.sort_by_key(|s| (s.utility_type, s.period_start, s.statement_id));
        Ok(statements)
    }

    async fn list_utility_run_leases(
        &self,
        org_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Lease>, BillingError> {
        let state = self.state.read().await;
        let with_statements: HashSet<Uuid> = state
            .statements
            .values()
            .filter(|s| {
                State::is_final_live(s)
                    && s.invoice_id.is_none()
                    && s.period_start >= period_start
                    && s.period_end <= period_end
            })
            .map(|s| s.lease_id)
            .collect();
        let mut leases: Vec<Lease> = state
            .leases
            .values()
            .filter(|l| {
                l.org_id == org_id
                    && l.status == LeaseStatus::Active
                    && with_statements.contains(&l.lease_id)
            })
            .cloned()
            .collect();
        leases.sort_by_key(|l| (l.start_date, l.lease_id));
        Ok(leases)
    }

    async fn next_sequence(
        &self,
        org_id: Uuid,
        prefix: &str,
        year_month: &str,
    ) -> Result<i64, BillingError> {
        let mut state = self.state.write().await;
        let value = state
            .sequences
            .entry((org_id, prefix.to_string(), year_month.to_string()))
            .or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn find_invoice_for_period(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.org_id == org_id
                    && i.lease_id == lease_id
                    && i.period_start == period_start
                    && i.period_end == period_end
            })
            .cloned())
    }

    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|i| i.org_id == org_id)
            .cloned())
    }

    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError> {
        let state = self.state.read().await;
        let mut lines = state
            .invoice_lines
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    #[instrument(skip(self, write), fields(invoice_id = %write.invoice.invoice_id, is_new = write.is_new))]
    async fn save_draft_invoice(&self, write: &DraftInvoiceWrite) -> Result<Invoice, BillingError> {
        let mut state = self.state.write().await;
        let invoice = &write.invoice;

        if write.is_new {
            let clash = state.invoices.values().any(|i| {
                (i.lease_id == invoice.lease_id
                    && i.period_start == invoice.period_start
                    && i.period_end == invoice.period_end)
                    || (i.org_id == invoice.org_id && i.invoice_number == invoice.invoice_number)
            });
            if clash || state.invoices.contains_key(&invoice.invoice_id) {
                return Err(BillingError::conflict("invoice", invoice.invoice_id));
            }
        } else {
            state.check_invoice_version(invoice)?;
        }
        for (statement_id, _) in &write.statement_links {
            let linkable = state.statements.get(statement_id).is_some_and(|s| {
                State::is_final_live(s)
                    && (s.invoice_id.is_none() || s.invoice_id == Some(invoice.invoice_id))
            });
            if !linkable {
                return Err(BillingError::conflict("utility_statement", *statement_id));
            }
        }

        let saved = if write.is_new {
            state.invoices.insert(invoice.invoice_id, invoice.clone());
            invoice.clone()
        } else {
            state.put_invoice(invoice)
        };
        state
            .invoice_lines
            .insert(invoice.invoice_id, write.lines.clone());

        for s in state.statements.values_mut() {
            if s.invoice_id == Some(invoice.invoice_id) {
                s.invoice_id = None;
                s.invoice_line_id = None;
                s.updated_utc = invoice.updated_utc;
                s.version += 1;
            }
        }
        for (statement_id, line_id) in &write.statement_links {
            if let Some(s) = state.statements.get_mut(statement_id) {
                s.invoice_id = Some(invoice.invoice_id);
                s.invoice_line_id = Some(*line_id);
                s.updated_utc = invoice.updated_utc;
                s.version += 1;
            }
        }

        Ok(saved)
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, BillingError> {
        let mut state = self.state.write().await;
        state.check_invoice_version(invoice)?;
        Ok(state.put_invoice(invoice))
    }

    async fn list_overdue_candidates(
        &self,
        org_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<Vec<Invoice>, BillingError> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                i.org_id == org_id
                    && matches!(i.status, InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid)
                    && i.due_date < as_of
                    && i.balance_amount > Decimal::ZERO
            })
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.due_date, i.invoice_id));
        Ok(invoices)
    }

    async fn insert_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError> {
        let mut state = self.state.write().await;
        state.runs.insert(run.run_id, run.clone());
        Ok(run.clone())
    }

    async fn update_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError> {
        let mut state = self.state.write().await;
        match state.runs.get(&run.run_id) {
            Some(stored) if stored.version == run.version => {}
            _ => return Err(BillingError::conflict("invoice_run", run.run_id)),
        }
        let mut next = run.clone();
        next.version += 1;
        state.runs.insert(next.run_id, next.clone());
        Ok(next)
    }

    async fn insert_invoice_run_item(&self, item: &InvoiceRunItem) -> Result<(), BillingError> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&item.run_id) {
            return Err(BillingError::not_found("invoice_run", item.run_id));
        }
        state.run_items.push(item.clone());
        Ok(())
    }

    async fn get_invoice_run(
        &self,
        org_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<InvoiceRun>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .get(&run_id)
            .filter(|r| r.org_id == org_id)
            .cloned())
    }

    async fn list_invoice_run_items(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<InvoiceRunItem>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .run_items
            .iter()
            .filter(|i| i.run_id == run_id)
            .cloned()
            .collect())
    }

    #[instrument(skip(self, posting), fields(payment_id = %posting.payment.payment_id))]
    async fn post_payment(&self, posting: &PaymentPosting) -> Result<Payment, BillingError> {
        let mut state = self.state.write().await;
        let payment = &posting.payment;

        match (posting.is_new, state.payments.get(&payment.payment_id)) {
            (true, None) => {}
            (false, Some(stored)) if stored.version == payment.version => {}
            _ => return Err(BillingError::conflict("payment", payment.payment_id)),
        }
        if let Some(invoice) = &posting.invoice {
            state.check_invoice_version(invoice)?;
        }
        if let Some(request) = &posting.request {
            state.check_request_version(request)?;
        }

        let mut saved = payment.clone();
        if !posting.is_new {
            saved.version += 1;
        }
        state.payments.insert(saved.payment_id, saved.clone());
        state.history.push(posting.history.clone());
        if let Some(invoice) = &posting.invoice {
            state.put_invoice(invoice);
        }
        if let Some(request) = &posting.request {
            state.put_request(request);
        }
        Ok(saved)
    }

    async fn get_payment(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .get(&payment_id)
            .filter(|p| p.org_id == org_id)
            .cloned())
    }

    async fn list_payment_history(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentStatusHistory>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn insert_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        let mut state = self.state.write().await;
        state.requests.insert(request.request_id, request.clone());
        Ok(request.clone())
    }

    async fn get_confirmation_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<PaymentConfirmationRequest>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .requests
            .get(&request_id)
            .filter(|r| r.org_id == org_id)
            .cloned())
    }

    async fn update_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        let mut state = self.state.write().await;
        state.check_request_version(request)?;
        Ok(state.put_request(request))
    }

    async fn insert_credit_note(
        &self,
        note: &CreditNote,
        lines: &[CreditNoteLine],
    ) -> Result<CreditNote, BillingError> {
        let mut state = self.state.write().await;
        let duplicate = state.credit_notes.values().any(|n| {
            n.org_id == note.org_id && n.credit_note_number == note.credit_note_number
        });
        if duplicate {
            return Err(BillingError::conflict("credit_note", note.credit_note_id));
        }
        state.credit_notes.insert(note.credit_note_id, note.clone());
        state
            .credit_note_lines
            .insert(note.credit_note_id, lines.to_vec());
        Ok(note.clone())
    }

    async fn get_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<Option<CreditNote>, BillingError> {
        let state = self.state.read().await;
        Ok(state
            .credit_notes
            .get(&credit_note_id)
            .filter(|n| n.org_id == org_id)
            .cloned())
    }

    async fn get_credit_note_lines(
        &self,
        credit_note_id: Uuid,
    ) -> Result<Vec<CreditNoteLine>, BillingError> {
        let state = self.state.read().await;
        let mut lines = state
            .credit_note_lines
            .get(&credit_note_id)
            .cloned()
            .unwrap_or_default();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn update_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError> {
        let mut state = self.state.write().await;
        state.check_credit_note_version(note)?;
        Ok(state.put_credit_note(note))
    }

    #[instrument(skip(self, note), fields(credit_note_id = %note.credit_note_id))]
    async fn issue_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError> {
        let mut state = self.state.write().await;
        state.check_credit_note_version(note)?;

        let invoice_lines = state
            .invoice_lines
            .get(&note.invoice_id)
            .cloned()
            .unwrap_or_default();
        let requested = sum_by_invoice_line(
            state
                .credit_note_lines
                .get(&note.credit_note_id)
                .into_iter()
                .flatten(),
        );
        check_remaining(&invoice_lines, &state.issued_credits(note.invoice_id), &requested)?;

        Ok(state.put_credit_note(note))
    }

    async fn issued_credit_totals(
        &self,
        invoice_id: Uuid,
    ) -> Result<HashMap<Uuid, Decimal>, BillingError> {
        let state = self.state.read().await;
        Ok(state.issued_credits(invoice_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn invoice(lease_id: Uuid) -> Invoice {
        let now = Utc::now();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        Invoice {
            invoice_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            lease_id,
            invoice_number: "INV-202403-0001".to_string(),
            period_start: date,
            period_end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            invoice_date: date,
            due_date: date,
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
        }
    }

    #[tokio::test]
    async fn test_stale_invoice_update_conflicts() {
        let store = MemoryStore::new();
        let draft = invoice(Uuid::new_v4());
        store
            .save_draft_invoice(&DraftInvoiceWrite {
                invoice: draft.clone(),
                is_new: true,
                lines: vec![],
                statement_links: vec![],
            })
            .await
            .unwrap();

        let first = store.update_invoice(&draft).await.unwrap();
        assert_eq!(first.version, 2);

        let err = store.update_invoice(&draft).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_duplicate_period_insert_conflicts() {
        let store = MemoryStore::new();
        let lease_id = Uuid::new_v4();
        let first = invoice(lease_id);
        let mut second = invoice(lease_id);
        second.invoice_number = "INV-202403-0002".to_string();

        for (inv, expect_ok) in [(first, true), (second, false)] {
            let result = store
                .save_draft_invoice(&DraftInvoiceWrite {
                    invoice: inv,
                    is_new: true,
                    lines: vec![],
                    statement_links: vec![],
                })
                .await;
            assert_eq!(result.is_ok(), expect_ok);
        }
    }

    #[tokio::test]
    async fn test_sequences_are_scoped_per_month() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        assert_eq!(store.next_sequence(org, "INV", "202403").await.unwrap(), 1);
        assert_eq!(store.next_sequence(org, "INV", "202403").await.unwrap(), 2);
        assert_eq!(store.next_sequence(org, "INV", "202404").await.unwrap(), 1);
        assert_eq!(store.next_sequence(org, "CN", "202403").await.unwrap(), 1);
    }
}
