//! Utility rate plans and metered statements.

use super::charge::{codes, RecordState};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metered utility kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UtilityType {
    Electricity,
    Water,
    Gas,
    Other,
}

impl UtilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtilityType::Electricity => "electricity",
            UtilityType::Water => "water",
            UtilityType::Gas => "gas",
            UtilityType::Other => "other",
        }
    }

    /// System charge code used to tax utility lines.
    pub fn charge_code(&self) -> &'static str {
        match self {
            UtilityType::Electricity => codes::UTILITY_ELECTRICITY,
            UtilityType::Water => codes::UTILITY_WATER,
            UtilityType::Gas => codes::UTILITY_GAS,
            UtilityType::Other => codes::UTILITY_OTHER,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UtilityType::Electricity => "Electricity",
            UtilityType::Water => "Water",
            UtilityType::Gas => "Gas",
            UtilityType::Other => "Utility",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UtilityRatePlan {
    pub plan_id: Uuid,
    pub org_id: Uuid,
    pub utility_type: UtilityType,
    pub name: String,
    pub state: RecordState,
    pub created_utc: DateTime<Utc>,
}

/// One consumption tier. `to_units = None` is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UtilityRateSlab {
    pub slab_id: Uuid,
    pub plan_id: Uuid,
    pub slab_order: i32,
    pub from_units: Decimal,
    pub to_units: Option<Decimal>,
    pub rate_per_unit: Decimal,
    pub fixed_charge: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewRateSlab {
    pub from_units: Decimal,
    pub to_units: Option<Decimal>,
    pub rate_per_unit: Decimal,
    pub fixed_charge: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewRatePlan {
    pub org_id: Uuid,
    pub utility_type: UtilityType,
    pub name: String,
    pub slabs: Vec<NewRateSlab>,
}

/// A versioned utility statement for one lease, utility and period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UtilityStatement {
    pub statement_id: Uuid,
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub utility_type: UtilityType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub statement_version: i32,
    pub is_final: bool,
    pub rate_plan_id: Option<Uuid>,
    pub previous_reading: Option<Decimal>,
    pub current_reading: Option<Decimal>,
    pub units_consumed: Option<Decimal>,
    pub amount: Decimal,
    pub invoice_id: Option<Uuid>,
    pub invoice_line_id: Option<Uuid>,
    pub state: RecordState,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UtilityStatement {
    pub fn is_invoiced(&self) -> bool {
        self.invoice_line_id.is_some()
    }
}

/// How a statement's amount is derived.
#[derive(Debug, Clone)]
pub enum StatementBasis {
    /// Readings priced through a tiered rate plan.
    Metered {
        rate_plan_id: Uuid,
        previous_reading: Decimal,
        current_reading: Decimal,
    },
    /// A fixed amount, e.g. a share of a building bill.
    Flat { amount: Decimal },
}

#[derive(Debug, Clone)]
pub struct RecordStatement {
    pub org_id: Uuid,
    pub lease_id: Uuid,
    pub utility_type: UtilityType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub basis: StatementBasis,
}
