//! Payment, payment history and tenant confirmation request models.

use super::invoice::Invoice;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Cash,
    BankTransfer,
    Cheque,
    Online,
    Other,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::BankTransfer => "bank_transfer",
            PaymentMode::Cheque => "cheque",
            PaymentMode::Online => "online",
            PaymentMode::Other => "other",
        }
    }

    /// Cash is counted on receipt; everything else waits for confirmation.
    pub fn settles_immediately(&self) -> bool {
        matches!(self, PaymentMode::Cash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub mode: PaymentMode,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub is_overpayment: bool,
    pub confirmation_request_id: Option<Uuid>,
    pub recorded_by: String,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Append-only status transition record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentStatusHistory {
    pub history_id: Uuid,
    pub payment_id: Uuid,
    pub from_status: Option<PaymentStatus>,
    pub to_status: PaymentStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub changed_at_utc: DateTime<Utc>,
}

/// Input for recording a payment.
#[derive(Debug, Clone, Validate)]
pub struct RecordPayment {
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub mode: PaymentMode,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub reference: Option<String>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "recorded_by is required"))]
    pub recorded_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationRequestStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl ConfirmationRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationRequestStatus::Pending => "pending",
            ConfirmationRequestStatus::Confirmed => "confirmed",
            ConfirmationRequestStatus::Rejected => "rejected",
        }
    }
}

/// Tenant-submitted claim that a payment was made.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentConfirmationRequest {
    pub request_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub mode: PaymentMode,
    pub reference: Option<String>,
    /// Opaque identifier held by the external attachment store.
    pub proof_attachment_ref: Option<String>,
    pub submitted_by: String,
    pub status: ConfirmationRequestStatus,
    pub resolved_by: Option<String>,
    pub resolved_at_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub payment_id: Option<Uuid>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Validate)]
pub struct SubmitConfirmationRequest {
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub mode: PaymentMode,
    pub reference: Option<String>,
    pub proof_attachment_ref: Option<String>,
    #[validate(length(min = 1, message = "submitted_by is required"))]
    pub submitted_by: String,
}

/// One atomic payment write: the payment (new or transitioned), its history
/// entry and, when money moves, the invoice and/or resolved request.
#[derive(Debug, Clone)]
pub struct PaymentPosting {
    pub payment: Payment,
    pub is_new: bool,
    pub history: PaymentStatusHistory,
    pub invoice: Option<Invoice>,
    pub request: Option<PaymentConfirmationRequest>,
}
