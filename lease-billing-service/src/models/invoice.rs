//! Invoice and invoice line models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
///
/// `Overdue` and `WrittenOff` are labels layered over an issued invoice; they
/// carry no structural change of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Overdue,
    WrittenOff,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::WrittenOff => "written_off",
            InvoiceStatus::Voided => "voided",
        }
    }

    /// Issued and still collecting money.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice header for one lease and billing period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub invoice_number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub sub_total: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub balance_amount: Decimal,
    pub status: InvoiceStatus,
    pub has_overpayment: bool,
    pub issued_at_utc: Option<DateTime<Utc>>,
    pub voided_at_utc: Option<DateTime<Utc>>,
    pub paid_at_utc: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub write_off_reason: Option<String>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// Apply a completed payment: bump paid amount, recompute balance and
    /// advance the status. Returns true when the invoice is now overpaid.
    pub fn apply_payment(&mut self, amount: Decimal, now: DateTime<Utc>) -> bool {
        self.paid_amount += amount;
        self.balance_amount = self.total_amount - self.paid_amount;
        let overpaid = self.balance_amount < Decimal::ZERO;
        if overpaid {
            self.has_overpayment = true;
        }
        if self.balance_amount <= Decimal::ZERO {
            self.status = InvoiceStatus::Paid;
            if self.paid_at_utc.is_none() {
                self.paid_at_utc = Some(now);
            }
        } else {
            self.status = InvoiceStatus::PartiallyPaid;
        }
        self.updated_utc = now;
        overpaid
    }
}

/// Origin of an invoice line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LineSource {
    Rent,
    RecurringCharge,
    Utility,
}

impl LineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSource::Rent => "rent",
            LineSource::RecurringCharge => "recurring_charge",
            LineSource::Utility => "utility",
        }
    }
}

/// Invoice line. `amount = quantity * unit_price`, `total_amount = amount + tax_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InvoiceLine {
    pub line_id: Uuid,
    pub invoice_id: Uuid,
    pub line_number: i32,
    pub description: String,
    pub source: LineSource,
    pub source_ref_id: Option<Uuid>,
    pub charge_type_id: Option<Uuid>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

/// Atomic write of a draft invoice with its complete line set.
#[derive(Debug, Clone)]
pub struct DraftInvoiceWrite {
    /// Header to insert (`is_new`) or to update under its version token.
    pub invoice: Invoice,
    pub is_new: bool,
    pub lines: Vec<InvoiceLine>,
    /// `(statement_id, line_id)` pairs to link; any other statement linked to
    /// this invoice is released.
    pub statement_links: Vec<(Uuid, Uuid)>,
}
