//! Lease, lease term and billing setting models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Lease status. Only active leases are billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Draft,
    Active,
    Terminated,
    Expired,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Draft => "draft",
            LeaseStatus::Active => "active",
            LeaseStatus::Terminated => "terminated",
            LeaseStatus::Expired => "expired",
        }
    }
}

/// Lease header as read from the property master data.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub lease_id: Uuid,
    pub org_id: Uuid,
    pub unit_id: Uuid,
    pub status: LeaseStatus,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
}

/// A rent segment of a lease. Rent changes are consecutive terms.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaseTerm {
    pub term_id: Uuid,
    pub lease_id: Uuid,
    pub monthly_rent: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

/// Proration method for partial-month rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProrationMethod {
    /// Denominator is the actual number of days in the calendar month.
    ActualDaysInMonth,
    /// Denominator is fixed at 30.
    ThirtyDayMonth,
}

impl ProrationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationMethod::ActualDaysInMonth => "actual_days_in_month",
            ProrationMethod::ThirtyDayMonth => "thirty_day_month",
        }
    }
}

/// Per-lease billing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaseBillingSetting {
    pub setting_id: Uuid,
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub billing_day: i32,
    pub payment_term_days: i32,
    pub auto_generate: bool,
    pub invoice_prefix: String,
    pub proration_method: ProrationMethod,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating or replacing a lease's billing setting.
#[derive(Debug, Clone, Validate)]
pub struct UpsertBillingSetting {
    pub org_id: Uuid,
    pub lease_id: Uuid,
    #[validate(range(min = 1, max = 28, message = "billing day must be between 1 and 28"))]
    pub billing_day: i32,
    #[validate(range(min = 0, max = 365, message = "payment term must be between 0 and 365 days"))]
    pub payment_term_days: i32,
    pub auto_generate: bool,
    #[validate(length(min = 1, max = 16, message = "invoice prefix must be 1-16 characters"))]
    pub invoice_prefix: String,
    pub proration_method: ProrationMethod,
}
