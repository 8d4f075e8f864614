//! Invoice run model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which population a run bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceRunKind {
    MonthlyRent,
    Utilities,
}

impl InvoiceRunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceRunKind::MonthlyRent => "monthly_rent",
            InvoiceRunKind::Utilities => "utilities",
        }
    }
}

/// Invoice run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceRunStatus {
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl InvoiceRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceRunStatus::InProgress => "in_progress",
            InvoiceRunStatus::Completed => "completed",
            InvoiceRunStatus::CompletedWithErrors => "completed_with_errors",
            InvoiceRunStatus::Failed => "failed",
            InvoiceRunStatus::Cancelled => "cancelled",
        }
    }

    /// Derive the terminal status from run counters.
    pub fn derive(success_count: i32, failure_count: i32, cancelled: bool) -> Self {
        if cancelled {
            InvoiceRunStatus::Cancelled
        } else if failure_count == 0 {
            // Includes the empty run.
            InvoiceRunStatus::Completed
        } else if success_count > 0 {
            InvoiceRunStatus::CompletedWithErrors
        } else {
            InvoiceRunStatus::Failed
        }
    }
}

/// One batch execution over an organization's leases for a billing period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRun {
    pub run_id: Uuid,
    pub org_id: Uuid,
    pub kind: InvoiceRunKind,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: InvoiceRunStatus,
    pub started_at_utc: DateTime<Utc>,
    pub completed_at_utc: Option<DateTime<Utc>>,
    pub total_leases: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub error_message: Option<String>,
    pub version: i64,
}

/// Per-lease outcome within a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRunItem {
    pub item_id: Uuid,
    pub run_id: Uuid,
    pub lease_id: Uuid,
    pub is_success: bool,
    pub invoice_id: Option<Uuid>,
    pub was_updated: bool,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Aggregate report returned to the caller of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run: InvoiceRun,
    pub items: Vec<InvoiceRunItem>,
}

impl RunResult {
    /// Some but not all leases failed.
    pub fn is_partial_failure(&self) -> bool {
        self.run.status == InvoiceRunStatus::CompletedWithErrors
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &InvoiceRunItem> {
        self.items.iter().filter(|i| !i.is_success)
    }
}
