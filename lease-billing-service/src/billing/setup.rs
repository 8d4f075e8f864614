//! Billing reference data: lease settings, charge types, recurring charges
//! and utility rate plans.

use super::tiered::validate_slabs;
use crate::error::BillingError;
use crate::models::{
    ChargeType, LeaseBillingSetting, LeaseRecurringCharge, NewChargeType, NewRatePlan,
    NewRecurringCharge, RecordState, UpsertBillingSetting, UtilityRatePlan, UtilityRateSlab,
};
use crate::services::{Clock, Store};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct BillingSetup {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl BillingSetup {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create the lease's billing setting or replace the existing one.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, lease_id = %input.lease_id))]
    pub async fn upsert_billing_setting(
        &self,
        input: UpsertBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError> {
        input.validate()?;
        self.store
            .get_lease(input.org_id, input.lease_id)
            .await?
            .ok_or_else(|| BillingError::not_found("lease", input.lease_id))?;

        let now = self.clock.now();
        let setting = match self
            .store
            .get_billing_setting(input.org_id, input.lease_id)
            .await?
        {
            Some(mut existing) => {
                existing.billing_day = input.billing_day;
                existing.payment_term_days = input.payment_term_days;
                existing.auto_generate = input.auto_generate;
                existing.invoice_prefix = input.invoice_prefix;
                existing.proration_method = input.proration_method;
                existing.updated_utc = now;
                self.store.update_billing_setting(&existing).await?
            }
            None => {
                self.store
                    .insert_billing_setting(&LeaseBillingSetting {
                        setting_id: Uuid::new_v4(),
                        org_id: input.org_id,
                        lease_id: input.lease_id,
                        billing_day: input.billing_day,
                        payment_term_days: input.payment_term_days,
                        auto_generate: input.auto_generate,
                        invoice_prefix: input.invoice_prefix,
                        proration_method: input.proration_method,
                        version: 1,
                        created_utc: now,
                        updated_utc: now,
                    })
                    .await?
            }
        };

        info!(
            setting_id = %setting.setting_id,
            proration_method = setting.proration_method.as_str(),
            auto_generate = setting.auto_generate,
            "Billing setting saved"
        );
        Ok(setting)
    }

    /// Register an org-scoped charge type, or a system one when `org_id` is `None`.
    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn register_charge_type(
        &self,
        input: NewChargeType,
    ) -> Result<ChargeType, BillingError> {
        let code = input.code.trim().to_uppercase();
        if code.is_empty() || input.name.trim().is_empty() {
            return Err(BillingError::validation("charge type code and name are required"));
        }
        if input.tax_rate < Decimal::ZERO || input.tax_rate > Decimal::ONE {
            return Err(BillingError::validation(format!(
                "tax rate {} must be between 0 and 1",
                input.tax_rate
            )));
        }
        if input.default_amount < Decimal::ZERO {
            return Err(BillingError::validation("default amount cannot be negative"));
        }

        let charge_type = self
            .store
            .insert_charge_type(&ChargeType {
                charge_type_id: Uuid::new_v4(),
                org_id: input.org_id,
                code,
                name: input.name.trim().to_string(),
                is_taxable: input.is_taxable,
                tax_rate: input.tax_rate,
                default_amount: input.default_amount,
                state: RecordState::Active,
                created_utc: self.clock.now(),
            })
            .await?;

        info!(charge_type_id = %charge_type.charge_type_id, "Charge type registered");
        Ok(charge_type)
    }

    #[instrument(skip(self, input), fields(org_id = %input.org_id, lease_id = %input.lease_id))]
    pub async fn add_recurring_charge(
        &self,
        input: NewRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        if input.amount < Decimal::ZERO {
            return Err(BillingError::validation("charge amount cannot be negative"));
        }
        if input.end_date.is_some_and(|end| end < input.start_date) {
            return Err(BillingError::validation("charge ends before it starts"));
        }
        if input.description.trim().is_empty() {
            return Err(BillingError::validation("charge description is required"));
        }
        self.store
            .get_lease(input.org_id, input.lease_id)
            .await?
            .ok_or_else(|| BillingError::not_found("lease", input.lease_id))?;
        self.store
            .get_charge_type(input.org_id, input.charge_type_id)
            .await?
            .ok_or_else(|| BillingError::not_found("charge_type", input.charge_type_id))?;

        let now = self.clock.now();
        let charge = self
            .store
            .insert_recurring_charge(&LeaseRecurringCharge {
                charge_id: Uuid::new_v4(),
                org_id: input.org_id,
                lease_id: input.lease_id,
                charge_type_id: input.charge_type_id,
                description: input.description.trim().to_string(),
                amount: input.amount,
                frequency: input.frequency,
                start_date: input.start_date,
                end_date: input.end_date,
                state: RecordState::Active,
                version: 1,
                created_utc: now,
                updated_utc: now,
            })
            .await?;

        info!(
            charge_id = %charge.charge_id,
            frequency = charge.frequency.as_str(),
            amount = %charge.amount,
            "Recurring charge added"
        );
        Ok(charge)
    }

    /// Archive a recurring charge so later invoices stop billing it.
    #[instrument(skip(self), fields(org_id = %org_id, charge_id = %charge_id))]
    pub async fn deactivate_recurring_charge(
        &self,
        org_id: Uuid,
        charge_id: Uuid,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        let mut charge = self
            .store
            .get_recurring_charge(org_id, charge_id)
            .await?
            .ok_or_else(|| BillingError::not_found("lease_recurring_charge", charge_id))?;
        if charge.state == RecordState::Archived {
            return Ok(charge);
        }

        charge.state = RecordState::Archived;
        charge.updated_utc = self.clock.now();
        let charge = self.store.update_recurring_charge(&charge).await?;

        info!("Recurring charge deactivated");
        Ok(charge)
    }

    /// Create a tiered rate plan. Slabs are ordered as given.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, utility_type = input.utility_type.as_str()))]
    pub async fn create_rate_plan(
        &self,
        input: NewRatePlan,
    ) -> Result<(UtilityRatePlan, Vec<UtilityRateSlab>), BillingError> {
        if input.name.trim().is_empty() {
            return Err(BillingError::validation("rate plan name is required"));
        }

        let plan = UtilityRatePlan {
            plan_id: Uuid::new_v4(),
            org_id: input.org_id,
            utility_type: input.utility_type,
            name: input.name.trim().to_string(),
            state: RecordState::Active,
            created_utc: self.clock.now(),
        };
        let slabs: Vec<UtilityRateSlab> = input
            .slabs
            .into_iter()
            .enumerate()
            .map(|(i, slab)| UtilityRateSlab {
                slab_id: Uuid::new_v4(),
                plan_id: plan.plan_id,
                slab_order: i as i32 + 1,
                from_units: slab.from_units,
                to_units: slab.to_units,
                rate_per_unit: slab.rate_per_unit,
                fixed_charge: slab.fixed_charge,
            })
            .collect();
        validate_slabs(&slabs)?;

        self.store.insert_rate_plan(&plan, &slabs).await?;

        info!(plan_id = %plan.plan_id, slab_count = slabs.len(), "Rate plan created");
        Ok((plan, slabs))
    }
}
