//! Versioned utility statements.

use super::proration::round_money;
use super::tiered::compute_tiered_utility_amount;
use crate::error::BillingError;
use crate::models::{RecordState, RecordStatement, StatementBasis, UtilityStatement};
use crate::services::{Clock, Store};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct StatementRecorder {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl StatementRecorder {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a new, non-final statement version for the lease, utility and
    /// period.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, lease_id = %input.lease_id, utility_type = input.utility_type.as_str()))]
    pub async fn record_statement(
        &self,
        input: RecordStatement,
    ) -> Result<UtilityStatement, BillingError> {
        if input.period_end < input.period_start {
            return Err(BillingError::validation(format!(
                "period end {} is before period start {}",
                input.period_end, input.period_start
            )));
        }
        self.store
            .get_lease(input.org_id, input.lease_id)
            .await?
            .ok_or_else(|| BillingError::not_found("lease", input.lease_id))?;

        let final_statement = self
            .store
            .find_final_statement(
                input.lease_id,
                input.utility_type,
                input.period_start,
                input.period_end,
            )
            .await?;
        if final_statement.is_some_and(|s| s.is_invoiced()) {
            return Err(BillingError::immutable(format!(
                "{} statement for {} to {} is already invoiced",
                input.utility_type.as_str(),
                input.period_start,
                input.period_end
            )));
        }

        let (rate_plan_id, previous_reading, current_reading, units_consumed, amount) =
            match input.basis {
                StatementBasis::Metered {
                    rate_plan_id,
                    previous_reading,
                    current_reading,
                } => {
                    if previous_reading < Decimal::ZERO || current_reading < Decimal::ZERO {
                        return Err(BillingError::validation("meter readings cannot be negative"));
                    }
                    let (plan, slabs) = self
                        .store
                        .get_rate_plan(input.org_id, rate_plan_id)
                        .await?
                        .ok_or_else(|| BillingError::not_found("utility_rate_plan", rate_plan_id))?;
                    if plan.utility_type != input.utility_type {
                        return Err(BillingError::validation(format!(
                            "rate plan {} prices {}, not {}",
                            plan.name,
                            plan.utility_type.as_str(),
                            input.utility_type.as_str()
                        )));
                    }
                    let units = current_reading - previous_reading;
                    let amount = compute_tiered_utility_amount(units, &slabs)?;
                    (
                        Some(rate_plan_id),
                        Some(previous_reading),
                        Some(current_reading),
                        Some(units),
                        amount,
                    )
                }
                StatementBasis::Flat { amount } => {
                    if amount < Decimal::ZERO {
                        return Err(BillingError::validation("statement amount cannot be negative"));
                    }
                    (None, None, None, None, round_money(amount))
                }
            };

        let version = self
            .store
            .latest_statement_version(
                input.lease_id,
                input.utility_type,
                input.period_start,
                input.period_end,
            )
            .await?
            .unwrap_or(0)
            + 1;

        let now = self.clock.now();
        let statement = self
            .store
            .insert_utility_statement(&UtilityStatement {
                statement_id: Uuid::new_v4(),
                org_id: input.org_id,
                lease_id: input.lease_id,
                utility_type: input.utility_type,
                period_start: input.period_start,
                period_end: input.period_end,
                statement_version: version,
                is_final: false,
                rate_plan_id,
                previous_reading,
                current_reading,
                units_consumed,
                amount,
                invoice_id: None,
                invoice_line_id: None,
                state: RecordState::Active,
                version: 1,
                created_utc: now,
                updated_utc: now,
            })
            .await?;

        info!(
            statement_id = %statement.statement_id,
            statement_version = statement.statement_version,
            amount = %statement.amount,
            "Utility statement recorded"
        );
        Ok(statement)
    }

    /// Mark a statement final, archiving the previous final version of the
    /// same key unless it has already been invoiced.
    #[instrument(skip(self), fields(org_id = %org_id, statement_id = %statement_id))]
    pub async fn finalize_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<UtilityStatement, BillingError> {
        let mut statement = self
            .store
            .get_utility_statement(org_id, statement_id)
            .await?
            .ok_or_else(|| BillingError::not_found("utility_statement", statement_id))?;
        if statement.state == RecordState::Archived {
            return Err(BillingError::immutable(format!(
                "statement {} has been superseded",
                statement_id
            )));
        }
        if statement.is_final {
            return Ok(statement);
        }

        let previous = self
            .store
            .find_final_statement(
                statement.lease_id,
                statement.utility_type,
                statement.period_start,
                statement.period_end,
            )
            .await?;
        if let Some(previous) = &previous {
            if previous.is_invoiced() {
                return Err(BillingError::immutable(format!(
                    "statement version {} is already invoiced",
                    previous.statement_version
                )));
            }
        }

        statement.is_final = true;
        statement.updated_utc = self.clock.now();
        let statement = self
            .store
            .finalize_statement(&statement, previous.as_ref())
            .await?;

        info!(
            statement_version = statement.statement_version,
            superseded = previous.is_some(),
            "Utility statement finalized"
        );
        Ok(statement)
    }
}
