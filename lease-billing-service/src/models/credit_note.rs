//! Credit note model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteStatus {
    Draft,
    Issued,
    Cancelled,
}

impl CreditNoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditNoteStatus::Draft => "draft",
            CreditNoteStatus::Issued => "issued",
            CreditNoteStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditNote {
    pub credit_note_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub credit_note_number: String,
    pub reason: String,
    pub status: CreditNoteStatus,
    pub total_amount: Decimal,
    pub applied_at_utc: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditNoteLine {
    pub line_id: Uuid,
    pub credit_note_id: Uuid,
    pub invoice_line_id: Uuid,
    pub line_number: i32,
    pub description: String,
    pub amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditNoteLineInput {
    pub invoice_line_id: Uuid,
    pub amount: Decimal,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Validate)]
pub struct CreateCreditNote {
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    #[validate(length(min = 1, message = "reason is required"))]
    pub reason: String,
    #[validate(length(min = 1, message = "at least one line is required"))]
    pub lines: Vec<CreditNoteLineInput>,
}
