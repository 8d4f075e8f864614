//! Payment ledger: recording, confirmation and rejection of payments
//! against issued invoices.

use crate::error::BillingError;
use crate::models::{
    ConfirmationRequestStatus, Invoice, InvoiceStatus, Payment, PaymentConfirmationRequest,
    PaymentPosting, PaymentStatus, PaymentStatusHistory, RecordPayment,
    SubmitConfirmationRequest,
};
use crate::services::metrics::{record_overpayment, record_payment};
use crate::services::{Clock, Store};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// What to do with a payment larger than the outstanding balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverpaymentPolicy {
    /// Accept, let the balance go negative and flag payment and invoice.
    #[default]
    AcceptAndFlag,
    Reject,
}

#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    overpayment_policy: OverpaymentPolicy,
}

fn history(
    payment: &Payment,
    from_status: Option<PaymentStatus>,
    actor: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> PaymentStatusHistory {
    PaymentStatusHistory {
        history_id: Uuid::new_v4(),
        payment_id: payment.payment_id,
        from_status,
        to_status: payment.status,
        actor: actor.to_string(),
        reason,
        changed_at_utc: now,
    }
}

fn required(value: &str, what: &str) -> Result<String, BillingError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BillingError::validation(format!("{} is required", what)));
    }
    Ok(value.to_string())
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        overpayment_policy: OverpaymentPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            overpayment_policy,
        }
    }

    async fn load_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn load_payment(&self, org_id: Uuid, payment_id: Uuid) -> Result<Payment, BillingError> {
        self.store
            .get_payment(org_id, payment_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment", payment_id))
    }

    async fn load_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        self.store
            .get_confirmation_request(org_id, request_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment_confirmation_request", request_id))
    }

    /// Whether the invoice can receive a payment of `amount` right now.
    fn check_payable(&self, invoice: &Invoice, amount: Decimal) -> Result<(), BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::validation("payment amount must be positive"));
        }
        match invoice.status {
            InvoiceStatus::Draft => {
                return Err(BillingError::validation(format!(
                    "invoice {} has not been issued",
                    invoice.invoice_number
                )))
            }
            InvoiceStatus::Voided | InvoiceStatus::WrittenOff => {
                return Err(BillingError::immutable(format!(
                    "invoice {} is {} and cannot receive payments",
                    invoice.invoice_number, invoice.status
                )))
            }
            InvoiceStatus::Issued
            | InvoiceStatus::PartiallyPaid
            | InvoiceStatus::Overdue
            | InvoiceStatus::Paid => {}
        }
        if self.overpayment_policy == OverpaymentPolicy::Reject && amount > invoice.balance_amount
        {
            return Err(BillingError::validation(format!(
                "payment of {} exceeds outstanding balance {} on invoice {}",
                amount, invoice.balance_amount, invoice.invoice_number
            )));
        }
        Ok(())
    }

    /// Apply a completed payment to its invoice, flagging overpayment.
    fn apply(&self, invoice: &mut Invoice, payment: &mut Payment, now: DateTime<Utc>) {
        if invoice.apply_payment(payment.amount, now) {
            payment.is_overpayment = true;
            record_overpayment(&invoice.org_id.to_string());
            warn!(
                invoice_number = %invoice.invoice_number,
                payment_id = %payment.payment_id,
                balance_amount = %invoice.balance_amount,
                "Invoice overpaid"
            );
        }
    }

    /// Record a payment. Cash completes and applies immediately; other modes
    /// wait for confirmation.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, invoice_id = %input.invoice_id))]
    pub async fn record_payment(&self, input: RecordPayment) -> Result<Payment, BillingError> {
        input.validate()?;
        let mut invoice = self.load_invoice(input.org_id, input.invoice_id).await?;
        self.check_payable(&invoice, input.amount)?;

        let now = self.clock.now();
        let status = if input.mode.settles_immediately() {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Pending
        };
        let mut payment = Payment {
            payment_id: Uuid::new_v4(),
            org_id: input.org_id,
            invoice_id: input.invoice_id,
            mode: input.mode,
            status,
            amount: input.amount,
            paid_on: input.paid_on,
            reference: input.reference,
            notes: input.notes,
            is_overpayment: false,
            confirmation_request_id: None,
            recorded_by: input.recorded_by,
            version: 1,
            created_utc: now,
            updated_utc: now,
        };

        let invoice = if status == PaymentStatus::Completed {
            self.apply(&mut invoice, &mut payment, now);
            Some(invoice)
        } else {
            None
        };

        let posting = PaymentPosting {
            history: history(&payment, None, &payment.recorded_by, None, now),
            payment,
            is_new: true,
            invoice,
            request: None,
        };
        let payment = self.store.post_payment(&posting).await?;

        record_payment(
            &payment.org_id.to_string(),
            payment.mode.as_str(),
            payment.status.as_str(),
        );
        info!(
            payment_id = %payment.payment_id,
            mode = payment.mode.as_str(),
            status = %payment.status,
            amount = %payment.amount,
            "Payment recorded"
        );
        Ok(payment)
    }

    /// Pending to Completed, applying the amount to the invoice.
    #[instrument(skip(self), fields(org_id = %org_id, payment_id = %payment_id))]
    pub async fn confirm_payment(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
        actor: &str,
    ) -> Result<Payment, BillingError> {
        let actor = required(actor, "actor")?;
        let mut payment = self.load_payment(org_id, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::immutable(format!(
                "payment {} is {}, only pending payments can be confirmed",
                payment_id, payment.status
            )));
        }

        let mut invoice = self.load_invoice(org_id, payment.invoice_id).await?;
        self.check_payable(&invoice, payment.amount)?;

        let now = self.clock.now();
        payment.status = PaymentStatus::Completed;
        payment.updated_utc = now;
        self.apply(&mut invoice, &mut payment, now);

        let posting = PaymentPosting {
            history: history(&payment, Some(PaymentStatus::Pending), &actor, None, now),
            payment,
            is_new: false,
            invoice: Some(invoice),
            request: None,
        };
        let payment = self.store.post_payment(&posting).await?;

        record_payment(&org_id.to_string(), payment.mode.as_str(), payment.status.as_str());
        info!(amount = %payment.amount, actor = %actor, "Payment confirmed");
        Ok(payment)
    }

    /// Pending to Rejected. The invoice is untouched.
    #[instrument(skip(self, reason), fields(org_id = %org_id, payment_id = %payment_id))]
    pub async fn reject_payment(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<Payment, BillingError> {
        let reason = required(reason, "rejection reason")?;
        let actor = required(actor, "actor")?;
        let mut payment = self.load_payment(org_id, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::immutable(format!(
                "payment {} is {}, only pending payments can be rejected",
                payment_id, payment.status
            )));
        }

        let now = self.clock.now();
        payment.status = PaymentStatus::Rejected;
        payment.updated_utc = now;

        let posting = PaymentPosting {
            history: history(&payment, Some(PaymentStatus::Pending), &actor, Some(reason), now),
            payment,
            is_new: false,
            invoice: None,
            request: None,
        };
        let payment = self.store.post_payment(&posting).await?;

        record_payment(&org_id.to_string(), payment.mode.as_str(), payment.status.as_str());
        info!(actor = %actor, "Payment rejected");
        Ok(payment)
    }

    /// Store a tenant's claim of payment for later review.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, invoice_id = %input.invoice_id))]
    pub async fn submit_confirmation_request(
        &self,
        input: SubmitConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        input.validate()?;
        let invoice = self.load_invoice(input.org_id, input.invoice_id).await?;
        self.check_payable(&invoice, input.amount)?;

        let request = self
            .store
            .insert_confirmation_request(&PaymentConfirmationRequest {
                request_id: Uuid::new_v4(),
                org_id: input.org_id,
                invoice_id: input.invoice_id,
                amount: input.amount,
                paid_on: input.paid_on,
                mode: input.mode,
                reference: input.reference,
                proof_attachment_ref: input.proof_attachment_ref,
                submitted_by: input.submitted_by,
                status: ConfirmationRequestStatus::Pending,
                resolved_by: None,
                resolved_at_utc: None,
                rejection_reason: None,
                payment_id: None,
                version: 1,
                created_utc: self.clock.now(),
            })
            .await?;

        info!(request_id = %request.request_id, amount = %request.amount, "Payment confirmation request submitted");
        Ok(request)
    }

    /// Accept a confirmation request: create a completed payment, apply it
    /// and resolve the request in one atomic unit.
    #[instrument(skip(self), fields(org_id = %org_id, request_id = %request_id))]
    pub async fn confirm_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
        actor: &str,
    ) -> Result<Payment, BillingError> {
        let actor = required(actor, "actor")?;
        let mut request = self.load_request(org_id, request_id).await?;
        if request.status != ConfirmationRequestStatus::Pending {
            return Err(BillingError::immutable(format!(
                "confirmation request {} is already {}",
                request_id,
                request.status.as_str()
            )));
        }

        let mut invoice = self.load_invoice(org_id, request.invoice_id).await?;
        self.check_payable(&invoice, request.amount)?;

        let now = self.clock.now();
        let mut payment = Payment {
            payment_id: Uuid::new_v4(),
            org_id,
            invoice_id: request.invoice_id,
            mode: request.mode,
            status: PaymentStatus::Completed,
            amount: request.amount,
            paid_on: request.paid_on,
            reference: request.reference.clone(),
            notes: None,
            is_overpayment: false,
            confirmation_request_id: Some(request_id),
            recorded_by: actor.clone(),
            version: 1,
            created_utc: now,
            updated_utc: now,
        };
        self.apply(&mut invoice, &mut payment, now);

        request.status = ConfirmationRequestStatus::Confirmed;
        request.resolved_by = Some(actor.clone());
        request.resolved_at_utc = Some(now);
        request.payment_id = Some(payment.payment_id);

        let posting = PaymentPosting {
            history: history(&payment, None, &actor, None, now),
            payment,
            is_new: true,
            invoice: Some(invoice),
            request: Some(request),
        };
        let payment = self.store.post_payment(&posting).await?;

        record_payment(&org_id.to_string(), payment.mode.as_str(), payment.status.as_str());
        info!(payment_id = %payment.payment_id, amount = %payment.amount, actor = %actor, "Confirmation request accepted");
        Ok(payment)
    }

    #[instrument(skip(self, reason), fields(org_id = %org_id, request_id = %request_id))]
    pub async fn reject_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        let reason = required(reason, "rejection reason")?;
        let actor = required(actor, "actor")?;
        let mut request = self.load_request(org_id, request_id).await?;
        if request.status != ConfirmationRequestStatus::Pending {
            return Err(BillingError::immutable(format!(
                "confirmation request {} is already {}",
                request_id,
                request.status.as_str()
            )));
        }

        request.status = ConfirmationRequestStatus::Rejected;
        request.resolved_by = Some(actor);
        request.resolved_at_utc = Some(self.clock.now());
        request.rejection_reason = Some(reason);
        let request = self.store.update_confirmation_request(&request).await?;

        info!("Confirmation request rejected");
        Ok(request)
    }

    /// Status transitions of a payment, oldest first.
    pub async fn payment_history(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentStatusHistory>, BillingError> {
        let payment = self.load_payment(org_id, payment_id).await?;
        self.store.list_payment_history(payment.payment_id).await
    }
}
