//! Credit note integration tests for lease-billing-service.

mod common;

use common::{date, TestEngine};
use lease_billing_service::models::{
    CreateCreditNote, CreditNoteLineInput, CreditNoteStatus, Invoice, InvoiceLine,
};
use lease_billing_service::services::Store;
use lease_billing_service::BillingError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn credit(
    app: &TestEngine,
    invoice: &Invoice,
    lines: Vec<(&InvoiceLine, Decimal)>,
) -> CreateCreditNote {
    CreateCreditNote {
        org_id: app.org_id,
        invoice_id: invoice.invoice_id,
        reason: "Water outage for five days".to_string(),
        lines: lines
            .into_iter()
            .map(|(line, amount)| CreditNoteLineInput {
                invoice_line_id: line.line_id,
                amount,
                description: None,
            })
            .collect(),
    }
}

#[tokio::test]
async fn credit_note_is_created_as_numbered_draft() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;

    let (note, note_lines) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(150))]))
        .await
        .unwrap();

    assert_eq!(note.credit_note_number, "CN-202403-0001");
    assert_eq!(note.status, CreditNoteStatus::Draft);
    assert_eq!(note.total_amount, dec!(150));
    assert!(note.applied_at_utc.is_none());
    assert_eq!(note_lines.len(), 1);
    assert_eq!(note_lines[0].invoice_line_id, lines[0].line_id);
    assert!(note_lines[0].description.starts_with("Credit: Rent"));

    let (second, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(10))]))
        .await
        .unwrap();
    assert_eq!(second.credit_note_number, "CN-202403-0002");
}

#[tokio::test]
async fn credit_cannot_exceed_line_total() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;

    let err = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(100.01))]))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // Repeated lines are summed before the check.
    let err = app
        .engine
        .credit_notes
        .create_credit_note(credit(
            &app,
            &invoice,
            vec![(&lines[0], dec!(60)), (&lines[0], dec!(41))],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn credit_lines_must_belong_to_the_invoice() {
    let app = TestEngine::spawn().await;
    let first = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let second = app.seed_billable_lease(date(2024, 1, 1), dec!(200)).await;
    let (invoice, _) = app.issued_march_invoice(&first).await;
    let (_, other_lines) = app.issued_march_invoice(&second).await;

    let err = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&other_lines[0], dec!(10))]))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn only_posted_invoices_can_be_credited() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let generated = app
        .engine
        .generator
        .generate_invoice(app.org_id, lease.lease_id, date(2024, 3, 1), date(2024, 3, 31), None)
        .await
        .unwrap();

    let err = app
        .engine
        .credit_notes
        .create_credit_note(credit(
            &app,
            &generated.invoice,
            vec![(&generated.lines[0], dec!(10))],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let voided = app
        .engine
        .lifecycle
        .void(app.org_id, generated.invoice.invoice_id, "duplicate")
        .await
        .unwrap();
    let err = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &voided, vec![(&generated.lines[0], dec!(10))]))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));
}

#[tokio::test]
async fn issuing_applies_credit_without_touching_balance() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(1000)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;
    let (note, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(200))]))
        .await
        .unwrap();

    let issued = app
        .engine
        .credit_notes
        .issue_credit_note(app.org_id, note.credit_note_id)
        .await
        .unwrap();
    assert_eq!(issued.status, CreditNoteStatus::Issued);
    assert!(issued.applied_at_utc.is_some());

    let err = app
        .engine
        .credit_notes
        .issue_credit_note(app.org_id, note.credit_note_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));

    let err = app
        .engine
        .credit_notes
        .cancel_credit_note(app.org_id, note.credit_note_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutableStateViolation(_)));

    let invoice = app.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.balance_amount, dec!(1000.00));
    assert_eq!(invoice.paid_amount, Decimal::ZERO);
}

#[tokio::test]
async fn competing_drafts_are_rechecked_on_issue() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;

    let (first, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();
    let (second, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();

    app.engine
        .credit_notes
        .issue_credit_note(app.org_id, first.credit_note_id)
        .await
        .unwrap();
    let err = app
        .engine
        .credit_notes
        .issue_credit_note(app.org_id, second.credit_note_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // The losing draft can still be cancelled.
    let cancelled = app
        .engine
        .credit_notes
        .cancel_credit_note(app.org_id, second.credit_note_id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, CreditNoteStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_issues_cannot_over_credit_a_line() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;

    let (first, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();
    let (second, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        app.engine
            .credit_notes
            .issue_credit_note(app.org_id, first.credit_note_id),
        app.engine
            .credit_notes
            .issue_credit_note(app.org_id, second.credit_note_id),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let credited = app.store.issued_credit_totals(invoice.invoice_id).await.unwrap();
    assert_eq!(credited[&lines[0].line_id], dec!(60));
}

#[tokio::test]
async fn store_checks_remaining_when_issuing() {
    let app = TestEngine::spawn().await;
    let lease = app.seed_billable_lease(date(2024, 1, 1), dec!(100)).await;
    let (invoice, lines) = app.issued_march_invoice(&lease).await;

    let (first, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();
    let (mut second, _) = app
        .engine
        .credit_notes
        .create_credit_note(credit(&app, &invoice, vec![(&lines[0], dec!(60))]))
        .await
        .unwrap();
    app.engine
        .credit_notes
        .issue_credit_note(app.org_id, first.credit_note_id)
        .await
        .unwrap();

    // Writing the second note as issued directly must still be refused.
    second.status = CreditNoteStatus::Issued;
    let err = app.store.issue_credit_note(&second).await.unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let (stored, _) = app
        .engine
        .credit_notes
        .get_credit_note(app.org_id, second.credit_note_id)
        .await
        .unwrap();
    assert_eq!(stored.status, CreditNoteStatus::Draft);
}
