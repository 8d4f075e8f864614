//! Test helper module for lease-billing-service integration tests.
//!
//! Provides an engine over `MemoryStore` and a `FixedClock` plus seeding
//! helpers for leases, settings and reference data.

#![allow(dead_code)]

use chrono::{NaiveDate, Utc};
use lease_billing_service::billing::OverpaymentPolicy;
use lease_billing_service::config::{EngineConfig, RetrySettings};
use lease_billing_service::models::{
    ChargeFrequency, ChargeType, Invoice, InvoiceLine, Lease, LeaseRecurringCharge, LeaseStatus,
    LeaseTerm, NewChargeType, NewRateSlab, NewRecurringCharge, PaymentMode, ProrationMethod,
    RecordPayment, UpsertBillingSetting,
};
use lease_billing_service::services::{init_metrics, FixedClock, MemoryStore};
use lease_billing_service::BillingEngine;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_ORG_ID: &str = "11111111-1111-1111-1111-111111111111";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn org_id() -> Uuid {
    Uuid::parse_str(TEST_ORG_ID).unwrap()
}

/// Engine wrapper for integration tests.
pub struct TestEngine {
    pub engine: BillingEngine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub org_id: Uuid,
}

impl TestEngine {
    /// Engine with default settings, clock pinned to 2024-03-01.
    pub async fn spawn() -> Self {
        Self::spawn_with(OverpaymentPolicy::AcceptAndFlag).await
    }

    pub async fn spawn_with(overpayment_policy: OverpaymentPolicy) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::at_date(date(2024, 3, 1)));
        let config = EngineConfig {
            overpayment_policy,
            retry: RetrySettings {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            ..EngineConfig::default()
        };
        let engine = BillingEngine::new(store.clone(), clock.clone(), &config);

        Self {
            engine,
            store,
            clock,
            org_id: org_id(),
        }
    }

    /// Active lease starting on `start` with one open-ended rent term.
    pub async fn seed_lease(&self, start: NaiveDate, monthly_rent: Decimal) -> Lease {
        let lease = Lease {
            lease_id: Uuid::new_v4(),
            org_id: self.org_id,
            unit_id: Uuid::new_v4(),
            status: LeaseStatus::Active,
            start_date: start,
            end_date: None,
            version: 1,
            created_utc: Utc::now(),
        };
        self.store.seed_lease(lease.clone()).await;
        self.store
            .seed_lease_term(LeaseTerm {
                term_id: Uuid::new_v4(),
                lease_id: lease.lease_id,
                monthly_rent,
                start_date: start,
                end_date: None,
                created_utc: Utc::now(),
            })
            .await;
        lease
    }

    /// Lease plus a billing setting with a 15-day payment term.
    pub async fn seed_billable_lease(&self, start: NaiveDate, monthly_rent: Decimal) -> Lease {
        let lease = self.seed_lease(start, monthly_rent).await;
        self.configure(&lease, ProrationMethod::ActualDaysInMonth)
            .await;
        lease
    }

    pub async fn configure(&self, lease: &Lease, proration_method: ProrationMethod) {
        self.engine
            .setup
            .upsert_billing_setting(UpsertBillingSetting {
                org_id: self.org_id,
                lease_id: lease.lease_id,
                billing_day: 1,
                payment_term_days: 15,
                auto_generate: true,
                invoice_prefix: "INV".to_string(),
                proration_method,
            })
            .await
            .expect("Failed to save billing setting");
    }

    pub async fn charge_type(
        &self,
        code: &str,
        is_taxable: bool,
        tax_rate: Decimal,
        system: bool,
    ) -> ChargeType {
        self.engine
            .setup
            .register_charge_type(NewChargeType {
                org_id: if system { None } else { Some(self.org_id) },
                code: code.to_string(),
                name: code.to_string(),
                is_taxable,
                tax_rate,
                default_amount: Decimal::ZERO,
            })
            .await
            .expect("Failed to register charge type")
    }

    pub async fn recurring_charge(
        &self,
        lease: &Lease,
        charge_type: &ChargeType,
        amount: Decimal,
        frequency: ChargeFrequency,
        start: NaiveDate,
    ) -> LeaseRecurringCharge {
        self.engine
            .setup
            .add_recurring_charge(NewRecurringCharge {
                org_id: self.org_id,
                lease_id: lease.lease_id,
                charge_type_id: charge_type.charge_type_id,
                description: format!("{} charge", charge_type.name),
                amount,
                frequency,
                start_date: start,
                end_date: None,
            })
            .await
            .expect("Failed to add recurring charge")
    }

    /// Generate and issue the March 2024 invoice for the lease.
    pub async fn issued_march_invoice(&self, lease: &Lease) -> (Invoice, Vec<InvoiceLine>) {
        let generated = self
            .engine
            .generator
            .generate_invoice(self.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
            .await
            .expect("Failed to generate invoice");
        let invoice = self
            .engine
            .lifecycle
            .issue(self.org_id, generated.invoice.invoice_id)
            .await
            .expect("Failed to issue invoice");
        (invoice, generated.lines)
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Invoice {
        self.engine
            .lifecycle
            .get_invoice(self.org_id, invoice_id)
            .await
            .expect("Failed to load invoice")
            .0
    }

    pub fn payment(&self, invoice: &Invoice, mode: PaymentMode, amount: Decimal) -> RecordPayment {
        RecordPayment {
            org_id: self.org_id,
            invoice_id: invoice.invoice_id,
            mode,
            amount,
            paid_on: date(2024, 3, 5),
            reference: None,
            notes: None,
            recorded_by: "front-desk".to_string(),
        }
    }
}

/// Electricity slabs: 0-100 @ 0.10, 101-200 @ 0.15, 201+ @ 0.20.
pub fn electricity_slabs() -> Vec<NewRateSlab> {
    vec![
        NewRateSlab {
            from_units: Decimal::ZERO,
            to_units: Some(Decimal::from(100)),
            rate_per_unit: Decimal::new(10, 2),
            fixed_charge: None,
        },
        NewRateSlab {
            from_units: Decimal::from(101),
            to_units: Some(Decimal::from(200)),
            rate_per_unit: Decimal::new(15, 2),
            fixed_charge: None,
        },
        NewRateSlab {
            from_units: Decimal::from(201),
            to_units: None,
            rate_per_unit: Decimal::new(20, 2),
            fixed_charge: None,
        },
    ]
}
