//! Charge type and recurring charge models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of reference rows that are never physically deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Active,
    Archived,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "active",
            RecordState::Archived => "archived",
        }
    }
}

/// System charge codes used for rent and utility lines.
pub mod codes {
    pub const RENT: &str = "RENT";
    pub const UTILITY_ELECTRICITY: &str = "UTILITY_ELECTRICITY";
    pub const UTILITY_WATER: &str = "UTILITY_WATER";
    pub const UTILITY_GAS: &str = "UTILITY_GAS";
    pub const UTILITY_OTHER: &str = "UTILITY_OTHER";
}

/// Charge reference data. `org_id = None` marks a system-defined row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChargeType {
    pub charge_type_id: Uuid,
    pub org_id: Option<Uuid>,
    pub code: String,
    pub name: String,
    pub is_taxable: bool,
    /// Flat tax rate as a fraction (0.05 = 5%).
    pub tax_rate: Decimal,
    pub default_amount: Decimal,
    pub state: RecordState,
    pub created_utc: DateTime<Utc>,
}

impl ChargeType {
    /// Effective rate applied to a line amount.
    pub fn effective_tax_rate(&self) -> Decimal {
        if self.is_taxable {
            self.tax_rate
        } else {
            Decimal::ZERO
        }
    }
}

/// Input for registering a charge type.
#[derive(Debug, Clone)]
pub struct NewChargeType {
    pub org_id: Option<Uuid>,
    pub code: String,
    pub name: String,
    pub is_taxable: bool,
    pub tax_rate: Decimal,
    pub default_amount: Decimal,
}

/// Recurring charge frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChargeFrequency {
    OneTime,
    Monthly,
    Quarterly,
    Yearly,
}

impl ChargeFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeFrequency::OneTime => "one_time",
            ChargeFrequency::Monthly => "monthly",
            ChargeFrequency::Quarterly => "quarterly",
            ChargeFrequency::Yearly => "yearly",
        }
    }

    /// Months between occurrences for anniversary-billed frequencies.
    pub fn interval_months(&self) -> Option<u32> {
        match self {
            ChargeFrequency::Quarterly => Some(3),
            ChargeFrequency::Yearly => Some(12),
            ChargeFrequency::OneTime | ChargeFrequency::Monthly => None,
        }
    }
}

/// Lease-scoped recurring charge (parking, maintenance, pet fee, ...).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaseRecurringCharge {
    pub charge_id: Uuid,
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub charge_type_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub frequency: ChargeFrequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub state: RecordState,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl LeaseRecurringCharge {
    /// Whether the effective range overlaps `[start, end]`.
    pub fn intersects(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date.map_or(true, |e| e >= start)
    }
}

/// Input for adding a recurring charge to a lease.
#[derive(Debug, Clone)]
pub struct NewRecurringCharge {
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub charge_type_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub frequency: ChargeFrequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}
