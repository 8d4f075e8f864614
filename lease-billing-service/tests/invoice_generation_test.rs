//! Invoice generation integration tests for lease-billing-service.

mod common;

use common::{date, electricity_slabs, TestEngine};
use lease_billing_service::models::{
    ChargeFrequency, InvoiceStatus, Lease, LeaseStatus, LineSource, NewRatePlan, ProrationMethod,
    RecordStatement, StatementBasis, UtilityType,
};
use lease_billing_service::services::Store;
use lease_billing_service::BillingError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn generate_creates_numbered_draft() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1500)).await;

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();

    let invoice = &generated.invoice;
    assert!(!generated.was_updated);
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.invoice_number, "INV-202403-0001");
    assert_eq!(invoice.invoice_date, date(2024, 3, 1));
    assert_eq!(invoice.due_date, date(2024, 3, 16));
    assert_eq!(invoice.total_amount, dec!(1500.00));
    assert_eq!(invoice.paid_amount, Decimal::ZERO);
    assert_eq!(invoice.balance_amount, invoice.total_amount);
    assert_eq!(generated.lines.len(), 1);
    assert_eq!(generated.lines[0].source, LineSource::Rent);
}

#[tokio::test]
async fn numbers_increase_per_org_and_month() {
    let app = TestEngine::spawn().await;
    let first = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let second = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;

    let a = app
        .engine
        .generator
        .generate_invoice(app.org_id, first.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    let b = app
        .engine
        .generator
        .generate_invoice(app.org_id, second.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    let c = app
        .engine
        .generator
        .generate_invoice(app.org_id, first.lease_id, date(2024, 4, 1), date(2024, 4, 30), None)
        .await
        .unwrap();

    assert_eq!(a.invoice.invoice_number, "INV-202403-0001");
    assert_eq!(b.invoice.invoice_number, "INV-202403-0002");
    assert_eq!(c.invoice.invoice_number, "INV-202404-0001");
}

#[tokio::test]
async fn regenerating_a_draft_keeps_identity_and_totals() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1500)).await;
    let generate = || {
        app.engine.generator.generate_invoice(
            app.org_id,
            lease.lease_id,
            date(2024, 3, 1),
            date(2024, 3, 31),
            None,
        )
    };

    let first = generate().await.unwrap();
    let second = generate().await.unwrap();
    let third = generate().await.unwrap();

    assert!(second.was_updated);
    assert!(third.was_updated);
    assert_eq!(first.invoice.invoice_id, third.invoice.invoice_id);
    assert_eq!(first.invoice.invoice_number, third.invoice.invoice_number);
    assert_eq!(first.invoice.total_amount, third.invoice.total_amount);
    assert_eq!(third.invoice.version, first.invoice.version + 2);

    let (_, lines) = app
        .engine
        .lifecycle
        .get_invoice(app.org_id, first.invoice.invoice_id)
        .await
        .unwrap();
    let numbers: Vec<i32> = lines.iter().map(|l| l.line_number).collect();
    assert_eq!(numbers, vec![1]);
}

#[tokio::test]
async fn issued_invoice_cannot_be_regenerated() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1500)).await;
    app.issued_march_invoice(&lease).await;

    let err = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));
}

#[tokio::test]
async fn preconditions_are_enforced() {
    let app = TestEngine::spawn().await;

    let err = app
        .engine
        .generator
        .generate_invoice(app.org_id, Uuid::new_v4(), date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound { .. }));

    let unconfigured = app.seed_lease(date(2024, 1, 1), dec!(900)).await;
    let err = app
        .engine
        .generator
        .generate_invoice(app.org_id, unconfigured.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(msg) if msg.contains("billing settings")));

    let err = app
        .engine
        .generator
        .generate_invoice(app.org_id, unconfigured.lease_id, date(2024, 3, 31), date(2024, 3, 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let terminated = Lease {
        lease_id: Uuid::new_v4(),
        status: LeaseStatus::Terminated,
        ..unconfigured.clone()
    };
    app.store.seed_lease(terminated.clone()).await;
    let err = app
        .engine
        .generator
        .generate_invoice(app.org_id, terminated.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn other_org_cannot_see_the_lease() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1500)).await;

    let err = app
        .engine
        .generator
        .generate_invoice(Uuid::new_v4(), lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound { .. }));
}

#[tokio::test]
async fn leap_february_bills_full_rent() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2023, 6, 1), dec!(1500)).await;

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 2, 1), date(2024, 2, 29), None)
        .await
        .unwrap();

    assert_eq!(generated.invoice.total_amount, dec!(1500.00));
}

#[tokio::test]
async fn proration_follows_setting_unless_overridden() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_lease(date(2024, 3, 16), dec!(3100)).await;
    app.configure(&lease, ProrationMethod::ActualDaysInMonth).await;
    let generate = |method| {
        app.engine.generator.generate_invoice(
            app.org_id,
            lease.lease_id,
            date(2024, 3, 1),
            date(2024, 3, 31),
            method,
        )
    };

    // 16 of 31 days.
    let actual = generate(None).await.unwrap();
    assert_eq!(actual.invoice.total_amount, dec!(1600.00));

    // 16 of 30 days.
    let thirty = generate(Some(ProrationMethod::ThirtyDayMonth)).await.unwrap();
    assert_eq!(thirty.invoice.total_amount, dec!(1653.33));
    assert_eq!(thirty.invoice.invoice_id, actual.invoice.invoice_id);
}

#[tokio::test]
async fn charges_are_taxed_by_charge_type() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    app.charge_type("RENT", false, Decimal::ZERO, true).await;
    let parking = app.charge_type("PARKING", true, dec!(0.05), false).await;
    app.recurring_charge(&lease, &parking, dec!(50), ChargeFrequency::Monthly, date(2024, 1, 1))
        .await;

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();

    let invoice = &generated.invoice;
    assert_eq!(generated.lines.len(), 2);
    assert_eq!(generated.lines[1].source, LineSource::RecurringCharge);
    assert_eq!(generated.lines[1].charge_type_id, Some(parking.charge_type_id));
    assert_eq!(invoice.sub_total, dec!(1050.00));
    assert_eq!(invoice.tax_amount, dec!(2.50));
    assert_eq!(invoice.total_amount, dec!(1052.50));
}

#[tokio::test]
async fn one_time_charge_is_billed_once() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let keys = app.charge_type("KEYS", false, Decimal::ZERO, false).await;
    app.recurring_charge(&lease, &keys, dec!(25), ChargeFrequency::OneTime, date(2024, 3, 10))
        .await;

    let march = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    assert_eq!(march.lines.len(), 2);

    // Regenerating the same draft keeps the charge.
    let march_again = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    assert_eq!(march_again.lines.len(), 2);

    let april = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 4, 1), date(2024, 4, 30), None)
        .await
        .unwrap();
    assert_eq!(april.lines.len(), 1);
}

#[tokio::test]
async fn deactivated_charge_is_no_longer_billed() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let parking = app.charge_type("PARKING", false, Decimal::ZERO, false).await;
    let charge = app
        .recurring_charge(&lease, &parking, dec!(50), ChargeFrequency::Monthly, date(2024, 1, 1))
        .await;

    app.engine
        .setup
        .deactivate_recurring_charge(app.org_id, charge.charge_id)
        .await
        .unwrap();

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    assert_eq!(generated.invoice.total_amount, dec!(1000.00));
}

#[tokio::test]
async fn final_utility_statement_is_billed_and_linked() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    app.charge_type("UTILITY_ELECTRICITY", true, dec!(0.10), true).await;
    let (plan, _) = app
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
    let statement = app
        .engine
        .statements
        .record_statement(RecordStatement {
            org_id: app.org_id,
            lease_id: lease.lease_id,
            utility_type: UtilityType::Electricity,
            period_start: date(2024, 3, 1),
            period_end: date(2024, 3, 31),
            basis: StatementBasis::Metered {
                rate_plan_id: plan.plan_id,
                previous_reading: dec!(1000),
                current_reading: dec!(1250),
            },
        })
        .await
        .unwrap();
    app.engine
        .statements
        .finalize_statement(app.org_id, statement.statement_id)
        .await
        .unwrap();

    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();

    assert_eq!(generated.lines.len(), 2);
    let utility = &generated.lines[1];
    assert_eq!(utility.source, LineSource::Utility);
    assert_eq!(utility.amount, dec!(35.00));
    assert_eq!(utility.tax_amount, dec!(3.50));
    assert_eq!(generated.invoice.total_amount, dec!(1038.50));

    let stored = app
        .store
        .get_utility_statement(app.org_id, statement.statement_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.invoice_id, Some(generated.invoice.invoice_id));
    assert_eq!(stored.invoice_line_id, Some(utility.line_id));

    // Regeneration relinks the statement to the replacement line.
    let regenerated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();
    let stored = app
        .store
        .get_utility_statement(app.org_id, statement.statement_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.invoice_line_id, Some(regenerated.lines[1].line_id));
}

#[tokio::test]
async fn concurrent_generation_yields_one_invoice() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1500)).await;
    let generate = || {
        app.engine.generator.generate_invoice(
            app.org_id,
            lease.lease_id,
            date(2024, 3, 1),
            date(2024, 3, 31),
            None,
        )
    };

    let (a, b) = tokio::join!(generate(), generate());
    for result in [&a, &b] {
        if let Err(e) = result {
            assert!(e.is_retryable(), "unexpected error: {}", e);
        }
    }
    assert!(a.is_ok() || b.is_ok());

    let stored = app
        .store
        .find_invoice_for_period(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.total_amount, dec!(1500.00));
}
