//! Utility statement and billing setup integration tests for lease-billing-service.

mod common;

use common::{date, electricity_slabs, TestEngine};
use lease_billing_service::models::{
    ChargeFrequency, NewChargeType, NewRatePlan, NewRateSlab, NewRecurringCharge, ProrationMethod,
    RecordState, RecordStatement, StatementBasis, UpsertBillingSetting, UtilityStatement,
    UtilityType,
};
use lease_billing_service::services::Store;
use lease_billing_service::BillingError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

async fn electricity_plan(app: &TestEngine) -> Uuid {
    let (plan, slabs) = app
        .engine
        .setup
        .create_rate_plan(NewRatePlan {
            org_id: app.org_id,
            utility_type: UtilityType::Electricity,
            name: "Residential".to_string(),
            slabs: electricity_slabs(),
        })
        .await
        .unwrap();
    assert_eq!(slabs.len(), 3);
    plan.plan_id
}

async fn record(
    app: &TestEngine,
    lease_id: Uuid,
    basis: StatementBasis,
) -> Result<UtilityStatement, BillingError> {
    app.engine
        .statements
        .record_statement(RecordStatement {
            org_id: app.org_id,
            lease_id,
            utility_type: UtilityType::Electricity,
            period_start: date(2024, 3, 1),
            period_end: date(2024, 3, 31),
            basis,
        })
        .await
}

fn metered(plan_id: Uuid, previous: Decimal, current: Decimal) -> StatementBasis {
    StatementBasis::Metered {
        rate_plan_id: plan_id,
        previous_reading: previous,
        current_reading: current,
    }
}

#[tokio::test]
async fn metered_statement_is_priced_through_slabs() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let plan_id = electricity_plan(&app).await;

    let statement = record(&app, lease.lease_id, metered(plan_id, dec!(1000), dec!(1250)))
        .await
        .unwrap();

    assert_eq!(statement.units_consumed, Some(dec!(250)));
    assert_eq!(statement.amount, dec!(35.00));
    assert_eq!(statement.statement_version, 1);
    assert!(!statement.is_final);
}

#[tokio::test]
async fn one_based_slabs_price_like_zero_based() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let mut slabs = electricity_slabs();
    slabs[0].from_units = Decimal::ONE;
    let (plan, _) = app
        .engine
        .setup
        .create_rate_plan(NewRatePlan {
            org_id: app.org_id,
            utility_type: UtilityType::Electricity,
            name: "Metered from one".to_string(),
            slabs,
        })
        .await
        .unwrap();

    let statement = record(&app, lease.lease_id, metered(plan.plan_id, dec!(0), dec!(250)))
        .await
        .unwrap();

    assert_eq!(statement.amount, dec!(35.00));
}

#[tokio::test]
async fn flat_statement_keeps_amount() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;

    let statement = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(42.5) })
        .await
        .unwrap();

    assert_eq!(statement.amount, dec!(42.50));
    assert_eq!(statement.units_consumed, None);
}

#[tokio::test]
async fn invalid_readings_are_rejected() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let plan_id = electricity_plan(&app).await;

    let err = record(&app, lease.lease_id, metered(plan_id, dec!(-1), dec!(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let err = record(&app, lease.lease_id, metered(Uuid::new_v4(), dec!(0), dec!(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound { .. }));
}

#[tokio::test]
async fn finalizing_a_newer_version_archives_the_previous_final() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;

    let v1 = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(30) })
        .await
        .unwrap();
    app.engine
        .statements
        .finalize_statement(app.org_id, v1.statement_id)
        .await
        .unwrap();

    let v2 = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(32) })
        .await
        .unwrap();
    assert_eq!(v2.statement_version, 2);
    let v2 = app
        .engine
        .statements
        .finalize_statement(app.org_id, v2.statement_id)
        .await
        .unwrap();
    assert!(v2.is_final);

    let v1 = app
        .store
        .get_utility_statement(app.org_id, v1.statement_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1.state, RecordState::Archived);

    let err = app
        .engine
        .statements
        .finalize_statement(app.org_id, v1.statement_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    assert_eq!(generated.invoice.total_amount, dec!(1032.00));
}

#[tokio::test]
async fn invoiced_statement_cannot_be_superseded() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;

    let v1 = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(30) })
        .await
        .unwrap();
    let v2 = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(31) })
        .await
        .unwrap();
    app.engine
        .statements
        .finalize_statement(app.org_id, v1.statement_id)
        .await
        .unwrap();
    app.engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();

    let err = app
        .engine
        .statements
        .finalize_statement(app.org_id, v2.statement_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));

    let err = record(&app, lease.lease_id, StatementBasis::Flat { amount: dec!(33) })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));
}

#[tokio::test]
async fn rate_plan_slabs_are_validated() {
    let app = TestEngine::spawn().await;
    let mut slabs = electricity_slabs();
    slabs[1] = NewRateSlab {
        from_units: dec!(150),
        to_units: Some(dec!(200)),
        rate_per_unit: dec!(0.15),
        fixed_charge: None,
    };

    let err = app
        .engine
        .setup
        .create_rate_plan(NewRatePlan {
            org_id: app.org_id,
            utility_type: UtilityType::Electricity,
            name: "Gapped".to_string(),
            slabs,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn charge_type_tax_rate_must_be_a_fraction() {
    let app = TestEngine::spawn().await;

    let err = app
        .engine
        .setup
        .register_charge_type(NewChargeType {
            org_id: Some(app.org_id),
            code: "PARKING".to_string(),
            name: "Parking".to_string(),
            is_taxable: true,
            tax_rate: dec!(1.5),
            default_amount: Decimal::ZERO,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn recurring_charge_needs_a_known_charge_type() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;

    let err = app
        .engine
        .setup
        .add_recurring_charge(NewRecurringCharge {
            org_id: app.org_id,
            lease_id: lease.lease_id,
            charge_type_id: Uuid::new_v4(),
            description: "Parking".to_string(),
            amount: dec!(50),
            frequency: ChargeFrequency::Monthly,
            start_date: date(2024, 1, 1),
            end_date: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound { .. }));
}

#[tokio::test]
async fn billing_setting_upsert_updates_in_place() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let input = |payment_term_days| UpsertBillingSetting {
        org_id: app.org_id,
        lease_id: lease.lease_id,
        billing_day: 5,
        payment_term_days,
        auto_generate: true,
        invoice_prefix: "RENT".to_string(),
        proration_method: ProrationMethod::ThirtyDayMonth,
    };

    let updated = app
        .engine
        .setup
        .upsert_billing_setting(input(30))
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.payment_term_days, 30);

    let err = app
        .engine
        .setup
        .upsert_billing_setting(input(400))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    assert_eq!(generated.invoice.invoice_number, "RENT-202403-0001");
    assert_eq!(generated.invoice.due_date, date(2024, 3, 31));
}
