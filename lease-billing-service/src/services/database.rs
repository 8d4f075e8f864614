//! PostgreSQL store for lease-billing-service.

use crate::billing::credit_notes::check_remaining;
use crate::error::BillingError;
use crate::models::{
    ChargeType, CreditNote, CreditNoteLine, DraftInvoiceWrite, Invoice, InvoiceLine, InvoiceRun,
    InvoiceRunItem, Lease, LeaseBillingSetting, LeaseRecurringCharge, LeaseTerm, Payment,
    PaymentConfirmationRequest, PaymentPosting, PaymentStatusHistory, UtilityRatePlan,
    UtilityRateSlab, UtilityStatement, UtilityType,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::Store;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const LEASE_COLUMNS: &str =
    "l.lease_id, l.org_id, l.unit_id, l.status, l.start_date, l.end_date, l.version, l.created_utc";

const TERM_COLUMNS: &str = "term_id, lease_id, monthly_rent, start_date, end_date, created_utc";

const SETTING_COLUMNS: &str = "setting_id, org_id, lease_id, billing_day, payment_term_days, auto_generate, invoice_prefix, proration_method, version, created_utc, updated_utc";

const CHARGE_TYPE_COLUMNS: &str = "charge_type_id, org_id, code, name, is_taxable, tax_rate, default_amount, state, created_utc";

const RECURRING_CHARGE_COLUMNS: &str = "charge_id, org_id, lease_id, charge_type_id, description, amount, frequency, start_date, end_date, state, version, created_utc, updated_utc";

const PLAN_COLUMNS: &str = "plan_id, org_id, utility_type, name, state, created_utc";

const SLAB_COLUMNS: &str =
    "slab_id, plan_id, slab_order, from_units, to_units, rate_per_unit, fixed_charge";

const STATEMENT_COLUMNS: &str = "statement_id, org_id, lease_id, utility_type, period_start, period_end, statement_version, is_final, rate_plan_id, previous_reading, current_reading, units_consumed, amount, invoice_id, invoice_line_id, state, version, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, org_id, lease_id, invoice_number, period_start, period_end, invoice_date, due_date, sub_total, tax_amount, total_amount, paid_amount, balance_amount, status, has_overpayment, issued_at_utc, voided_at_utc, paid_at_utc, void_reason, write_off_reason, version, created_utc, updated_utc";

const LINE_COLUMNS: &str = "line_id, invoice_id, line_number, description, source, source_ref_id, charge_type_id, quantity, unit_price, amount, tax_rate, tax_amount, total_amount, created_utc";

const RUN_COLUMNS: &str = "run_id, org_id, kind, period_start, period_end, status, started_at_utc, completed_at_utc, total_leases, success_count, failure_count, error_message, version";

const RUN_ITEM_COLUMNS: &str =
    "item_id, run_id, lease_id, is_success, invoice_id, was_updated, error_message, created_utc";

const PAYMENT_COLUMNS: &str = "payment_id, org_id, invoice_id, mode, status, amount, paid_on, reference, notes, is_overpayment, confirmation_request_id, recorded_by, version, created_utc, updated_utc";

const HISTORY_COLUMNS: &str =
    "history_id, payment_id, from_status, to_status, actor, reason, changed_at_utc";

const REQUEST_COLUMNS: &str = "request_id, org_id, invoice_id, amount, paid_on, mode, reference, proof_attachment_ref, submitted_by, status, resolved_by, resolved_at_utc, rejection_reason, payment_id, version, created_utc";

const CREDIT_NOTE_COLUMNS: &str = "credit_note_id, org_id, invoice_id, credit_note_number, reason, status, total_amount, applied_at_utc, version, created_utc, updated_utc";

const CREDIT_NOTE_LINE_COLUMNS: &str =
    "line_id, credit_note_id, invoice_line_id, line_number, description, amount, created_utc";

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> BillingError {
    move |e| BillingError::Database(anyhow::anyhow!("Failed to {}: {}", context, e))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "lease-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, BillingError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_err("connect"))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), BillingError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =============================================================================
// Row writers shared by single statements and transactions
// =============================================================================

async fn update_invoice_row(
    conn: &mut PgConnection,
    invoice: &Invoice,
) -> Result<Invoice, BillingError> {
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET status = $3, sub_total = $4, tax_amount = $5, total_amount = $6, paid_amount = $7,
            balance_amount = $8, has_overpayment = $9, issued_at_utc = $10, voided_at_utc = $11,
            paid_at_utc = $12, void_reason = $13, write_off_reason = $14, invoice_date = $15,
            due_date = $16, updated_utc = $17, version = version + 1
        WHERE invoice_id = $1 AND version = $2
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(invoice.invoice_id)
    .bind(invoice.version)
    .bind(invoice.status)
    .bind(invoice.sub_total)
    .bind(invoice.tax_amount)
    .bind(invoice.total_amount)
    .bind(invoice.paid_amount)
    .bind(invoice.balance_amount)
    .bind(invoice.has_overpayment)
    .bind(invoice.issued_at_utc)
    .bind(invoice.voided_at_utc)
    .bind(invoice.paid_at_utc)
    .bind(&invoice.void_reason)
    .bind(&invoice.write_off_reason)
    .bind(invoice.invoice_date)
    .bind(invoice.due_date)
    .bind(invoice.updated_utc)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("update invoice"))?
    .ok_or_else(|| BillingError::conflict("invoice", invoice.invoice_id))
}

async fn update_request_row(
    conn: &mut PgConnection,
    request: &PaymentConfirmationRequest,
) -> Result<PaymentConfirmationRequest, BillingError> {
    sqlx::query_as::<_, PaymentConfirmationRequest>(&format!(
        r#"
        UPDATE payment_confirmation_requests
        SET status = $3, resolved_by = $4, resolved_at_utc = $5, rejection_reason = $6,
            payment_id = $7, version = version + 1
        WHERE request_id = $1 AND version = $2
        RETURNING {REQUEST_COLUMNS}
        "#
    ))
    .bind(request.request_id)
    .bind(request.version)
    .bind(request.status)
    .bind(&request.resolved_by)
    .bind(request.resolved_at_utc)
    .bind(&request.rejection_reason)
    .bind(request.payment_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("update confirmation request"))?
    .ok_or_else(|| BillingError::conflict("payment_confirmation_request", request.request_id))
}

async fn update_credit_note_row(
    conn: &mut PgConnection,
    note: &CreditNote,
) -> Result<CreditNote, BillingError> {
    sqlx::query_as::<_, CreditNote>(&format!(
        r#"
        UPDATE credit_notes
        SET status = $3, applied_at_utc = $4, updated_utc = $5, version = version + 1
        WHERE credit_note_id = $1 AND version = $2
        RETURNING {CREDIT_NOTE_COLUMNS}
        "#
    ))
    .bind(note.credit_note_id)
    .bind(note.version)
    .bind(note.status)
    .bind(note.applied_at_utc)
    .bind(note.updated_utc)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("update credit note"))?
    .ok_or_else(|| BillingError::conflict("credit_note", note.credit_note_id))
}

async fn issued_credit_rows(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<HashMap<Uuid, Decimal>, BillingError> {
    let rows = sqlx::query_as::<_, (Uuid, Decimal)>(
        r#"
        SELECT l.invoice_line_id, SUM(l.amount)
        FROM credit_note_lines l
        JOIN credit_notes n ON n.credit_note_id = l.credit_note_id
        WHERE n.invoice_id = $1 AND n.status = 'issued'
        GROUP BY l.invoice_line_id
        "#,
    )
    .bind(invoice_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("sum issued credits"))?;
    Ok(rows.into_iter().collect())
}

#[async_trait]
impl Store for PgStore {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("run health check"))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Lease Operations
    // =========================================================================

    #[instrument(skip(self), fields(org_id = %org_id, lease_id = %lease_id))]
    async fn get_lease(&self, org_id: Uuid, lease_id: Uuid) -> Result<Option<Lease>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_lease"])
            .start_timer();

        let lease = sqlx::query_as::<_, Lease>(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases l WHERE l.org_id = $1 AND l.lease_id = $2"
        ))
        .bind(org_id)
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get lease"))?;

        timer.observe_duration();
        Ok(lease)
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn list_rent_run_leases(&self, org_id: Uuid) -> Result<Vec<Lease>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rent_run_leases"])
            .start_timer();

        let leases = sqlx::query_as::<_, Lease>(&format!(
            r#"
            SELECT {LEASE_COLUMNS}
            FROM leases l
            LEFT JOIN lease_billing_settings s ON s.lease_id = l.lease_id
            WHERE l.org_id = $1 AND l.status = 'active' AND COALESCE(s.auto_generate, TRUE)
            ORDER BY l.start_date, l.lease_id
            "#
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list rent run leases"))?;

        timer.observe_duration();
        Ok(leases)
    }

    #[instrument(skip(self), fields(lease_id = %lease_id))]
    async fn list_lease_terms(&self, lease_id: Uuid) -> Result<Vec<LeaseTerm>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_lease_terms"])
            .start_timer();

        let terms = sqlx::query_as::<_, LeaseTerm>(&format!(
            "SELECT {TERM_COLUMNS} FROM lease_terms WHERE lease_id = $1 ORDER BY start_date, term_id"
        ))
        .bind(lease_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list lease terms"))?;

        timer.observe_duration();
        Ok(terms)
    }

    // =========================================================================
    // Billing Setting Operations
    // =========================================================================

    #[instrument(skip(self), fields(org_id = %org_id, lease_id = %lease_id))]
    async fn get_billing_setting(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Option<LeaseBillingSetting>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_setting"])
            .start_timer();

        let setting = sqlx::query_as::<_, LeaseBillingSetting>(&format!(
            "SELECT {SETTING_COLUMNS} FROM lease_billing_settings WHERE org_id = $1 AND lease_id = $2"
        ))
        .bind(org_id)
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get billing setting"))?;

        timer.observe_duration();
        Ok(setting)
    }

    #[instrument(skip(self, setting), fields(lease_id = %setting.lease_id))]
    async fn insert_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_billing_setting"])
            .start_timer();

        let result = sqlx::query_as::<_, LeaseBillingSetting>(&format!(
            r#"
            INSERT INTO lease_billing_settings ({SETTING_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {SETTING_COLUMNS}
            "#
        ))
        .bind(setting.setting_id)
        .bind(setting.org_id)
        .bind(setting.lease_id)
        .bind(setting.billing_day)
        .bind(setting.payment_term_days)
        .bind(setting.auto_generate)
        .bind(&setting.invoice_prefix)
        .bind(setting.proration_method)
        .bind(setting.version)
        .bind(setting.created_utc)
        .bind(setting.updated_utc)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();
        match result {
            Ok(saved) => Ok(saved),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::conflict("lease_billing_setting", setting.lease_id))
            }
            Err(e) => Err(db_err("insert billing setting")(e)),
        }
    }

    #[instrument(skip(self, setting), fields(lease_id = %setting.lease_id, version = setting.version))]
    async fn update_billing_setting(
        &self,
        setting: &LeaseBillingSetting,
    ) -> Result<LeaseBillingSetting, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_billing_setting"])
            .start_timer();

        let updated = sqlx::query_as::<_, LeaseBillingSetting>(&format!(
            r#"
            UPDATE lease_billing_settings
            SET billing_day = $3, payment_term_days = $4, auto_generate = $5, invoice_prefix = $6,
                proration_method = $7, updated_utc = $8, version = version + 1
            WHERE setting_id = $1 AND version = $2
            RETURNING {SETTING_COLUMNS}
            "#
        ))
        .bind(setting.setting_id)
        .bind(setting.version)
        .bind(setting.billing_day)
        .bind(setting.payment_term_days)
        .bind(setting.auto_generate)
        .bind(&setting.invoice_prefix)
        .bind(setting.proration_method)
        .bind(setting.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update billing setting"))?
        .ok_or_else(|| BillingError::conflict("lease_billing_setting", setting.setting_id))?;

        timer.observe_duration();
        Ok(updated)
    }

    // =========================================================================
    // Charge Type Operations
    // =========================================================================

    #[instrument(skip(self, charge_type), fields(code = %charge_type.code))]
    async fn insert_charge_type(
        &self,
        charge_type: &ChargeType,
    ) -> Result<ChargeType, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_charge_type"])
            .start_timer();

        let result = sqlx::query_as::<_, ChargeType>(&format!(
            r#"
            INSERT INTO charge_types ({CHARGE_TYPE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {CHARGE_TYPE_COLUMNS}
            "#
        ))
        .bind(charge_type.charge_type_id)
        .bind(charge_type.org_id)
        .bind(&charge_type.code)
        .bind(&charge_type.name)
        .bind(charge_type.is_taxable)
        .bind(charge_type.tax_rate)
        .bind(charge_type.default_amount)
        .bind(charge_type.state)
        .bind(charge_type.created_utc)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();
        match result {
            Ok(saved) => Ok(saved),
            Err(e) if is_unique_violation(&e) => Err(BillingError::validation(format!(
                "charge type code {} already exists",
                charge_type.code
            ))),
            Err(e) => Err(db_err("insert charge type")(e)),
        }
    }

    #[instrument(skip(self), fields(org_id = %org_id, charge_type_id = %charge_type_id))]
    async fn get_charge_type(
        &self,
        org_id: Uuid,
        charge_type_id: Uuid,
    ) -> Result<Option<ChargeType>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_charge_type"])
            .start_timer();

        let charge_type = sqlx::query_as::<_, ChargeType>(&format!(
            r#"
            SELECT {CHARGE_TYPE_COLUMNS} FROM charge_types
            WHERE charge_type_id = $2 AND (org_id = $1 OR org_id IS NULL)
            "#
        ))
        .bind(org_id)
        .bind(charge_type_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get charge type"))?;

        timer.observe_duration();
        Ok(charge_type)
    }

    #[instrument(skip(self), fields(org_id = %org_id, code = %code))]
    async fn find_charge_type_by_code(
        &self,
        org_id: Uuid,
        code: &str,
    ) -> Result<Option<ChargeType>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_charge_type_by_code"])
            .start_timer();

        let charge_type = sqlx::query_as::<_, ChargeType>(&format!(
            r#"
            SELECT {CHARGE_TYPE_COLUMNS} FROM charge_types
            WHERE code = $2 AND state = 'active' AND (org_id = $1 OR org_id IS NULL)
            ORDER BY org_id NULLS LAST
            LIMIT 1
            "#
        ))
        .bind(org_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find charge type by code"))?;

        timer.observe_duration();
        Ok(charge_type)
    }

    // =========================================================================
    // Recurring Charge Operations
    // =========================================================================

    #[instrument(skip(self, charge), fields(lease_id = %charge.lease_id))]
    async fn insert_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_recurring_charge"])
            .start_timer();

        let saved = sqlx::query_as::<_, LeaseRecurringCharge>(&format!(
            r#"
            INSERT INTO lease_recurring_charges ({RECURRING_CHARGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {RECURRING_CHARGE_COLUMNS}
            "#
        ))
        .bind(charge.charge_id)
        .bind(charge.org_id)
        .bind(charge.lease_id)
        .bind(charge.charge_type_id)
        .bind(&charge.description)
        .bind(charge.amount)
        .bind(charge.frequency)
        .bind(charge.start_date)
        .bind(charge.end_date)
        .bind(charge.state)
        .bind(charge.version)
        .bind(charge.created_utc)
        .bind(charge.updated_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("insert recurring charge"))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(org_id = %org_id, charge_id = %charge_id))]
    async fn get_recurring_charge(
        &self,
        org_id: Uuid,
        charge_id: Uuid,
    ) -> Result<Option<LeaseRecurringCharge>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_recurring_charge"])
            .start_timer();

        let charge = sqlx::query_as::<_, LeaseRecurringCharge>(&format!(
            "SELECT {RECURRING_CHARGE_COLUMNS} FROM lease_recurring_charges WHERE org_id = $1 AND charge_id = $2"
        ))
        .bind(org_id)
        .bind(charge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get recurring charge"))?;

        timer.observe_duration();
        Ok(charge)
    }

    #[instrument(skip(self, charge), fields(charge_id = %charge.charge_id, version = charge.version))]
    async fn update_recurring_charge(
        &self,
        charge: &LeaseRecurringCharge,
    ) -> Result<LeaseRecurringCharge, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_recurring_charge"])
            .start_timer();

        let updated = sqlx::query_as::<_, LeaseRecurringCharge>(&format!(
            r#"
            UPDATE lease_recurring_charges
            SET description = $3, amount = $4, end_date = $5, state = $6, updated_utc = $7,
                version = version + 1
            WHERE charge_id = $1 AND version = $2
            RETURNING {RECURRING_CHARGE_COLUMNS}
            "#
        ))
        .bind(charge.charge_id)
        .bind(charge.version)
        .bind(&charge.description)
        .bind(charge.amount)
        .bind(charge.end_date)
        .bind(charge.state)
        .bind(charge.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update recurring charge"))?
        .ok_or_else(|| BillingError::conflict("lease_recurring_charge", charge.charge_id))?;

        timer.observe_duration();
        Ok(updated)
    }

    #[instrument(skip(self), fields(org_id = %org_id, lease_id = %lease_id))]
    async fn list_active_recurring_charges(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
    ) -> Result<Vec<LeaseRecurringCharge>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_recurring_charges"])
            .start_timer();

        let charges = sqlx::query_as::<_, LeaseRecurringCharge>(&format!(
            r#"
            SELECT {RECURRING_CHARGE_COLUMNS} FROM lease_recurring_charges
            WHERE org_id = $1 AND lease_id = $2 AND state = 'active'
            ORDER BY start_date, charge_id
            "#
        ))
        .bind(org_id)
        .bind(lease_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list recurring charges"))?;

        timer.observe_duration();
        Ok(charges)
    }

    #[instrument(skip(self), fields(lease_id = %lease_id))]
    async fn billed_recurring_charges(
        &self,
        lease_id: Uuid,
        exclude_invoice_id: Option<Uuid>,
    ) -> Result<HashSet<Uuid>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["billed_recurring_charges"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT il.source_ref_id
            FROM invoice_lines il
            JOIN invoices i ON i.invoice_id = il.invoice_id
            WHERE i.lease_id = $1
              AND i.status <> 'voided'
              AND il.source = 'recurring_charge'
              AND il.source_ref_id IS NOT NULL
              AND ($2::uuid IS NULL OR i.invoice_id <> $2)
            "#,
        )
        .bind(lease_id)
        .bind(exclude_invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list billed recurring charges"))?;

        timer.observe_duration();
        Ok(ids.into_iter().collect())
    }

    // =========================================================================
    // Rate Plan Operations
    // =========================================================================

    #[instrument(skip(self, plan, slabs), fields(plan_id = %plan.plan_id, slabs = slabs.len()))]
    async fn insert_rate_plan(
        &self,
        plan: &UtilityRatePlan,
        slabs: &[UtilityRateSlab],
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_rate_plan"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        sqlx::query(&format!(
            "INSERT INTO utility_rate_plans ({PLAN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(plan.plan_id)
        .bind(plan.org_id)
        .bind(plan.utility_type)
        .bind(&plan.name)
        .bind(plan.state)
        .bind(plan.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_err("insert rate plan"))?;

        for slab in slabs {
            sqlx::query(&format!(
                "INSERT INTO utility_rate_slabs ({SLAB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ))
            .bind(slab.slab_id)
            .bind(slab.plan_id)
            .bind(slab.slab_order)
            .bind(slab.from_units)
            .bind(slab.to_units)
            .bind(slab.rate_per_unit)
            .bind(slab.fixed_charge)
            .execute(&mut *tx)
            .await
            .map_err(db_err("insert rate slab"))?;
        }

        tx.commit().await.map_err(db_err("commit rate plan"))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Rate plan created");
        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, plan_id = %plan_id))]
    async fn get_rate_plan(
        &self,
        org_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<(UtilityRatePlan, Vec<UtilityRateSlab>)>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_rate_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, UtilityRatePlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM utility_rate_plans WHERE org_id = $1 AND plan_id = $2 AND state = 'active'"
        ))
        .bind(org_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get rate plan"))?;

        let Some(plan) = plan else {
            timer.observe_duration();
            return Ok(None);
        };

        let slabs = sqlx::query_as::<_, UtilityRateSlab>(&format!(
            "SELECT {SLAB_COLUMNS} FROM utility_rate_slabs WHERE plan_id = $1 ORDER BY slab_order"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get rate slabs"))?;

        timer.observe_duration();
        Ok(Some((plan, slabs)))
    }

    // =========================================================================
    // Utility Statement Operations
    // =========================================================================

    #[instrument(skip(self, statement), fields(lease_id = %statement.lease_id, statement_version = statement.statement_version))]
    async fn insert_utility_statement(
        &self,
        statement: &UtilityStatement,
    ) -> Result<UtilityStatement, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_utility_statement"])
            .start_timer();

        let result = sqlx::query_as::<_, UtilityStatement>(&format!(
            r#"
            INSERT INTO utility_statements ({STATEMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING {STATEMENT_COLUMNS}
            "#
        ))
        .bind(statement.statement_id)
        .bind(statement.org_id)
        .bind(statement.lease_id)
        .bind(statement.utility_type)
        .bind(statement.period_start)
        .bind(statement.period_end)
        .bind(statement.statement_version)
        .bind(statement.is_final)
        .bind(statement.rate_plan_id)
        .bind(statement.previous_reading)
        .bind(statement.current_reading)
        .bind(statement.units_consumed)
        .bind(statement.amount)
        .bind(statement.invoice_id)
        .bind(statement.invoice_line_id)
        .bind(statement.state)
        .bind(statement.version)
        .bind(statement.created_utc)
        .bind(statement.updated_utc)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();
        match result {
            Ok(saved) => Ok(saved),
            // Another writer took the same statement version.
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::conflict("utility_statement", statement.lease_id))
            }
            Err(e) => Err(db_err("insert utility statement")(e)),
        }
    }

    #[instrument(skip(self), fields(org_id = %org_id, statement_id = %statement_id))]
    async fn get_utility_statement(
        &self,
        org_id: Uuid,
        statement_id: Uuid,
    ) -> Result<Option<UtilityStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_utility_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, UtilityStatement>(&format!(
            "SELECT {STATEMENT_COLUMNS} FROM utility_statements WHERE org_id = $1 AND statement_id = $2"
        ))
        .bind(org_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get utility statement"))?;

        timer.observe_duration();
        Ok(statement)
    }

    #[instrument(skip(self), fields(lease_id = %lease_id, utility_type = %utility_type.as_str()))]
    async fn latest_statement_version(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<i32>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_statement_version"])
            .start_timer();

        let version = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT MAX(statement_version) FROM utility_statements
            WHERE lease_id = $1 AND utility_type = $2 AND period_start = $3 AND period_end = $4
            "#,
        )
        .bind(lease_id)
        .bind(utility_type)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("get latest statement version"))?;

        timer.observe_duration();
        Ok(version)
    }

    #[instrument(skip(self), fields(lease_id = %lease_id, utility_type = %utility_type.as_str()))]
    async fn find_final_statement(
        &self,
        lease_id: Uuid,
        utility_type: UtilityType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<UtilityStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_final_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, UtilityStatement>(&format!(
            r#"
            SELECT {STATEMENT_COLUMNS} FROM utility_statements
            WHERE lease_id = $1 AND utility_type = $2 AND period_start = $3 AND period_end = $4
              AND is_final AND state = 'active'
            "#
        ))
        .bind(lease_id)
        .bind(utility_type)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find final statement"))?;

        timer.observe_duration();
        Ok(statement)
    }

    #[instrument(skip(self, statement, superseded), fields(statement_id = %statement.statement_id))]
    async fn finalize_statement(
        &self,
        statement: &UtilityStatement,
        superseded: Option<&UtilityStatement>,
    ) -> Result<UtilityStatement, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_statement"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        if let Some(previous) = superseded {
            let archived = sqlx::query(
                r#"
                UPDATE utility_statements
                SET state = 'archived', updated_utc = $3, version = version + 1
                WHERE statement_id = $1 AND version = $2 AND invoice_line_id IS NULL
                "#,
            )
            .bind(previous.statement_id)
            .bind(previous.version)
            .bind(statement.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_err("archive superseded statement"))?;

            if archived.rows_affected() == 0 {
                return Err(BillingError::conflict(
                    "utility_statement",
                    previous.statement_id,
                ));
            }
        }

        let result = sqlx::query_as::<_, UtilityStatement>(&format!(
            r#"
            UPDATE utility_statements
            SET is_final = TRUE, updated_utc = $3, version = version + 1
            WHERE statement_id = $1 AND version = $2 AND state = 'active'
            RETURNING {STATEMENT_COLUMNS}
            "#
        ))
        .bind(statement.statement_id)
        .bind(statement.version)
        .bind(statement.updated_utc)
        .fetch_optional(&mut *tx)
        .await;

        let finalized = match result {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(BillingError::conflict(
                    "utility_statement",
                    statement.statement_id,
                ))
            }
            Err(e) if is_unique_violation(&e) => {
                return Err(BillingError::conflict(
                    "utility_statement",
                    statement.statement_id,
                ))
            }
            Err(e) => return Err(db_err("finalize statement")(e)),
        };

        tx.commit().await.map_err(db_err("commit statement"))?;

        timer.observe_duration();
        Ok(finalized)
    }

    #[instrument(skip(self), fields(lease_id = %lease_id))]
    async fn list_billable_statements(
        &self,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        draft_invoice_id: Option<Uuid>,
    ) -> Result<Vec<UtilityStatement>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_billable_statements"])
            .start_timer();

        let statements = sqlx::query_as::<_, UtilityStatement>(&format!(
            r#"
            SELECT {STATEMENT_COLUMNS} FROM utility_statements
            WHERE lease_id = $1 AND is_final AND state = 'active'
              AND period_start >= $2 AND period_end <= $3
              AND (invoice_id IS NULL OR invoice_id = $4)
            ORDER BY utility_type, period_start, statement_id
            "#
        ))
        .bind(lease_id)
        .bind(period_start)
        .bind(period_end)
        .bind(draft_invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list billable statements"))?;

        timer.observe_duration();
        Ok(statements)
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn list_utility_run_leases(
        &self,
        org_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Lease>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_utility_run_leases"])
            .start_timer();

        let leases = sqlx::query_as::<_, Lease>(&format!(
            r#"
            SELECT {LEASE_COLUMNS}
            FROM leases l
            WHERE l.org_id = $1 AND l.status = 'active'
              AND EXISTS (
                SELECT 1 FROM utility_statements s
                WHERE s.lease_id = l.lease_id AND s.is_final AND s.state = 'active'
                  AND s.invoice_id IS NULL AND s.period_start >= $2 AND s.period_end <= $3
              )
            ORDER BY l.start_date, l.lease_id
            "#
        ))
        .bind(org_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list utility run leases"))?;

        timer.observe_duration();
        Ok(leases)
    }

    // =========================================================================
    // Numbering
    // =========================================================================

    #[instrument(skip(self), fields(org_id = %org_id, prefix = %prefix, year_month = %year_month))]
    async fn next_sequence(
        &self,
        org_id: Uuid,
        prefix: &str,
        year_month: &str,
    ) -> Result<i64, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_sequence"])
            .start_timer();

        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO document_sequences (org_id, prefix, year_month, last_value)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (org_id, prefix, year_month)
            DO UPDATE SET last_value = document_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(org_id)
        .bind(prefix)
        .bind(year_month)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("advance document sequence"))?;

        timer.observe_duration();
        Ok(value)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self), fields(org_id = %org_id, lease_id = %lease_id))]
    async fn find_invoice_for_period(
        &self,
        org_id: Uuid,
        lease_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_for_period"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE org_id = $1 AND lease_id = $2 AND period_start = $3 AND period_end = $4
            "#
        ))
        .bind(org_id)
        .bind(lease_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find invoice for period"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE org_id = $1 AND invoice_id = $2"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get invoice"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_lines"])
            .start_timer();

        let lines = sqlx::query_as::<_, InvoiceLine>(&format!(
            "SELECT {LINE_COLUMNS} FROM invoice_lines WHERE invoice_id = $1 ORDER BY line_number"
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get invoice lines"))?;

        timer.observe_duration();
        Ok(lines)
    }

    #[instrument(
        skip(self, write),
        fields(invoice_id = %write.invoice.invoice_id, is_new = write.is_new, lines = write.lines.len())
    )]
    async fn save_draft_invoice(&self, write: &DraftInvoiceWrite) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_draft_invoice"])
            .start_timer();

        let invoice = &write.invoice;
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        let saved = if write.is_new {
            let result = sqlx::query_as::<_, Invoice>(&format!(
                r#"
                INSERT INTO invoices ({INVOICE_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
                RETURNING {INVOICE_COLUMNS}
                "#
            ))
            .bind(invoice.invoice_id)
            .bind(invoice.org_id)
            .bind(invoice.lease_id)
            .bind(&invoice.invoice_number)
            .bind(invoice.period_start)
            .bind(invoice.period_end)
            .bind(invoice.invoice_date)
            .bind(invoice.due_date)
            .bind(invoice.sub_total)
            .bind(invoice.tax_amount)
            .bind(invoice.total_amount)
            .bind(invoice.paid_amount)
            .bind(invoice.balance_amount)
            .bind(invoice.status)
            .bind(invoice.has_overpayment)
            .bind(invoice.issued_at_utc)
            .bind(invoice.voided_at_utc)
            .bind(invoice.paid_at_utc)
            .bind(&invoice.void_reason)
            .bind(&invoice.write_off_reason)
            .bind(invoice.version)
            .bind(invoice.created_utc)
            .bind(invoice.updated_utc)
            .fetch_one(&mut *tx)
            .await;

            match result {
                Ok(row) => row,
                // A concurrent generator created the invoice for this period first.
                Err(e) if is_unique_violation(&e) => {
                    return Err(BillingError::conflict("invoice", invoice.invoice_id))
                }
                Err(e) => return Err(db_err("insert invoice")(e)),
            }
        } else {
            let row = update_invoice_row(&mut tx, invoice).await?;

            sqlx::query("DELETE FROM invoice_lines WHERE invoice_id = $1")
                .bind(invoice.invoice_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err("delete invoice lines"))?;

            sqlx::query(
                r#"
                UPDATE utility_statements
                SET invoice_id = NULL, invoice_line_id = NULL, updated_utc = $2, version = version + 1
                WHERE invoice_id = $1
                "#,
            )
            .bind(invoice.invoice_id)
            .bind(invoice.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_err("release utility statements"))?;

            row
        };

        for line in &write.lines {
            sqlx::query(&format!(
                r#"
                INSERT INTO invoice_lines ({LINE_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#
            ))
            .bind(line.line_id)
            .bind(line.invoice_id)
            .bind(line.line_number)
            .bind(&line.description)
            .bind(line.source)
            .bind(line.source_ref_id)
            .bind(line.charge_type_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.amount)
            .bind(line.tax_rate)
            .bind(line.tax_amount)
            .bind(line.total_amount)
            .bind(line.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_err("insert invoice line"))?;
        }

        for (statement_id, line_id) in &write.statement_links {
            let linked = sqlx::query(
                r#"
                UPDATE utility_statements
                SET invoice_id = $2, invoice_line_id = $3, updated_utc = $4, version = version + 1
                WHERE statement_id = $1 AND invoice_id IS NULL AND is_final AND state = 'active'
                "#,
            )
            .bind(statement_id)
            .bind(invoice.invoice_id)
            .bind(line_id)
            .bind(invoice.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_err("link utility statement"))?;

            if linked.rows_affected() == 0 {
                return Err(BillingError::conflict("utility_statement", *statement_id));
            }
        }

        tx.commit().await.map_err(db_err("commit draft invoice"))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id, status = %invoice.status))]
    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        let updated = update_invoice_row(&mut conn, invoice).await?;

        timer.observe_duration();
        Ok(updated)
    }

    #[instrument(skip(self), fields(org_id = %org_id, as_of = %as_of))]
    async fn list_overdue_candidates(
        &self,
        org_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_overdue_candidates"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE org_id = $1 AND status IN ('issued', 'partially_paid')
              AND due_date < $2 AND balance_amount > 0
            ORDER BY due_date, invoice_id
            "#
        ))
        .bind(org_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list overdue candidates"))?;

        timer.observe_duration();
        Ok(invoices)
    }

    // =========================================================================
    // Invoice Run Operations
    // =========================================================================

    #[instrument(skip(self, run), fields(run_id = %run.run_id, kind = %run.kind.as_str()))]
    async fn insert_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice_run"])
            .start_timer();

        let saved = sqlx::query_as::<_, InvoiceRun>(&format!(
            r#"
            INSERT INTO invoice_runs ({RUN_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.run_id)
        .bind(run.org_id)
        .bind(run.kind)
        .bind(run.period_start)
        .bind(run.period_end)
        .bind(run.status)
        .bind(run.started_at_utc)
        .bind(run.completed_at_utc)
        .bind(run.total_leases)
        .bind(run.success_count)
        .bind(run.failure_count)
        .bind(&run.error_message)
        .bind(run.version)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("insert invoice run"))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = %run.status.as_str()))]
    async fn update_invoice_run(&self, run: &InvoiceRun) -> Result<InvoiceRun, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_run"])
            .start_timer();

        let updated = sqlx::query_as::<_, InvoiceRun>(&format!(
            r#"
            UPDATE invoice_runs
            SET status = $3, completed_at_utc = $4, total_leases = $5, success_count = $6,
                failure_count = $7, error_message = $8, version = version + 1
            WHERE run_id = $1 AND version = $2
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.run_id)
        .bind(run.version)
        .bind(run.status)
        .bind(run.completed_at_utc)
        .bind(run.total_leases)
        .bind(run.success_count)
        .bind(run.failure_count)
        .bind(&run.error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update invoice run"))?
        .ok_or_else(|| BillingError::conflict("invoice_run", run.run_id))?;

        timer.observe_duration();
        Ok(updated)
    }

    #[instrument(skip(self, item), fields(run_id = %item.run_id, lease_id = %item.lease_id))]
    async fn insert_invoice_run_item(&self, item: &InvoiceRunItem) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice_run_item"])
            .start_timer();

        sqlx::query(&format!(
            "INSERT INTO invoice_run_items ({RUN_ITEM_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(item.item_id)
        .bind(item.run_id)
        .bind(item.lease_id)
        .bind(item.is_success)
        .bind(item.invoice_id)
        .bind(item.was_updated)
        .bind(&item.error_message)
        .bind(item.created_utc)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert invoice run item"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, run_id = %run_id))]
    async fn get_invoice_run(
        &self,
        org_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<InvoiceRun>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_run"])
            .start_timer();

        let run = sqlx::query_as::<_, InvoiceRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM invoice_runs WHERE org_id = $1 AND run_id = $2"
        ))
        .bind(org_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get invoice run"))?;

        timer.observe_duration();
        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn list_invoice_run_items(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<InvoiceRunItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_run_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceRunItem>(&format!(
            "SELECT {RUN_ITEM_COLUMNS} FROM invoice_run_items WHERE run_id = $1 ORDER BY created_utc, item_id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list invoice run items"))?;

        timer.observe_duration();
        Ok(items)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    #[instrument(
        skip(self, posting),
        fields(payment_id = %posting.payment.payment_id, status = %posting.payment.status)
    )]
    async fn post_payment(&self, posting: &PaymentPosting) -> Result<Payment, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["post_payment"])
            .start_timer();

        let payment = &posting.payment;
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        let saved = if posting.is_new {
            sqlx::query_as::<_, Payment>(&format!(
                r#"
                INSERT INTO payments ({PAYMENT_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                RETURNING {PAYMENT_COLUMNS}
                "#
            ))
            .bind(payment.payment_id)
            .bind(payment.org_id)
            .bind(payment.invoice_id)
            .bind(payment.mode)
            .bind(payment.status)
            .bind(payment.amount)
            .bind(payment.paid_on)
            .bind(&payment.reference)
            .bind(&payment.notes)
            .bind(payment.is_overpayment)
            .bind(payment.confirmation_request_id)
            .bind(&payment.recorded_by)
            .bind(payment.version)
            .bind(payment.created_utc)
            .bind(payment.updated_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("insert payment"))?
        } else {
            sqlx::query_as::<_, Payment>(&format!(
                r#"
                UPDATE payments
                SET status = $3, is_overpayment = $4, updated_utc = $5, version = version + 1
                WHERE payment_id = $1 AND version = $2
                RETURNING {PAYMENT_COLUMNS}
                "#
            ))
            .bind(payment.payment_id)
            .bind(payment.version)
            .bind(payment.status)
            .bind(payment.is_overpayment)
            .bind(payment.updated_utc)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("update payment"))?
            .ok_or_else(|| BillingError::conflict("payment", payment.payment_id))?
        };

        let history = &posting.history;
        sqlx::query(&format!(
            "INSERT INTO payment_status_history ({HISTORY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(history.history_id)
        .bind(history.payment_id)
        .bind(history.from_status)
        .bind(history.to_status)
        .bind(&history.actor)
        .bind(&history.reason)
        .bind(history.changed_at_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_err("insert payment history"))?;

        if let Some(invoice) = &posting.invoice {
            update_invoice_row(&mut tx, invoice).await?;
        }

        if let Some(request) = &posting.request {
            update_request_row(&mut tx, request).await?;
        }

        tx.commit().await.map_err(db_err("commit payment"))?;

        timer.observe_duration();
        info!(payment_id = %saved.payment_id, status = %saved.status, "Payment posted");
        Ok(saved)
    }

    #[instrument(skip(self), fields(org_id = %org_id, payment_id = %payment_id))]
    async fn get_payment(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE org_id = $1 AND payment_id = $2"
        ))
        .bind(org_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get payment"))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_payment_history(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentStatusHistory>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payment_history"])
            .start_timer();

        let history = sqlx::query_as::<_, PaymentStatusHistory>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM payment_status_history WHERE payment_id = $1 ORDER BY changed_at_utc, history_id"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list payment history"))?;

        timer.observe_duration();
        Ok(history)
    }

    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id))]
    async fn insert_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_confirmation_request"])
            .start_timer();

        let saved = sqlx::query_as::<_, PaymentConfirmationRequest>(&format!(
            r#"
            INSERT INTO payment_confirmation_requests ({REQUEST_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(request.request_id)
        .bind(request.org_id)
        .bind(request.invoice_id)
        .bind(request.amount)
        .bind(request.paid_on)
        .bind(request.mode)
        .bind(&request.reference)
        .bind(&request.proof_attachment_ref)
        .bind(&request.submitted_by)
        .bind(request.status)
        .bind(&request.resolved_by)
        .bind(request.resolved_at_utc)
        .bind(&request.rejection_reason)
        .bind(request.payment_id)
        .bind(request.version)
        .bind(request.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("insert confirmation request"))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(org_id = %org_id, request_id = %request_id))]
    async fn get_confirmation_request(
        &self,
        org_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<PaymentConfirmationRequest>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_confirmation_request"])
            .start_timer();

        let request = sqlx::query_as::<_, PaymentConfirmationRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM payment_confirmation_requests WHERE org_id = $1 AND request_id = $2"
        ))
        .bind(org_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get confirmation request"))?;

        timer.observe_duration();
        Ok(request)
    }

    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn update_confirmation_request(
        &self,
        request: &PaymentConfirmationRequest,
    ) -> Result<PaymentConfirmationRequest, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_confirmation_request"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        let updated = update_request_row(&mut conn, request).await?;

        timer.observe_duration();
        Ok(updated)
    }

    // =========================================================================
    // Credit Note Operations
    // =========================================================================

    #[instrument(skip(self, note, lines), fields(invoice_id = %note.invoice_id, lines = lines.len()))]
    async fn insert_credit_note(
        &self,
        note: &CreditNote,
        lines: &[CreditNoteLine],
    ) -> Result<CreditNote, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_credit_note"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        let saved = sqlx::query_as::<_, CreditNote>(&format!(
            r#"
            INSERT INTO credit_notes ({CREDIT_NOTE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {CREDIT_NOTE_COLUMNS}
            "#
        ))
        .bind(note.credit_note_id)
        .bind(note.org_id)
        .bind(note.invoice_id)
        .bind(&note.credit_note_number)
        .bind(&note.reason)
        .bind(note.status)
        .bind(note.total_amount)
        .bind(note.applied_at_utc)
        .bind(note.version)
        .bind(note.created_utc)
        .bind(note.updated_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("insert credit note"))?;

        for line in lines {
            sqlx::query(&format!(
                "INSERT INTO credit_note_lines ({CREDIT_NOTE_LINE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ))
            .bind(line.line_id)
            .bind(line.credit_note_id)
            .bind(line.invoice_line_id)
            .bind(line.line_number)
            .bind(&line.description)
            .bind(line.amount)
            .bind(line.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_err("insert credit note line"))?;
        }

        tx.commit().await.map_err(db_err("commit credit note"))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(org_id = %org_id, credit_note_id = %credit_note_id))]
    async fn get_credit_note(
        &self,
        org_id: Uuid,
        credit_note_id: Uuid,
    ) -> Result<Option<CreditNote>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_note"])
            .start_timer();

        let note = sqlx::query_as::<_, CreditNote>(&format!(
            "SELECT {CREDIT_NOTE_COLUMNS} FROM credit_notes WHERE org_id = $1 AND credit_note_id = $2"
        ))
        .bind(org_id)
        .bind(credit_note_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get credit note"))?;

        timer.observe_duration();
        Ok(note)
    }

    #[instrument(skip(self), fields(credit_note_id = %credit_note_id))]
    async fn get_credit_note_lines(
        &self,
        credit_note_id: Uuid,
    ) -> Result<Vec<CreditNoteLine>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_note_lines"])
            .start_timer();

        let lines = sqlx::query_as::<_, CreditNoteLine>(&format!(
            "SELECT {CREDIT_NOTE_LINE_COLUMNS} FROM credit_note_lines WHERE credit_note_id = $1 ORDER BY line_number"
        ))
        .bind(credit_note_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get credit note lines"))?;

        timer.observe_duration();
        Ok(lines)
    }

    #[instrument(skip(self, note), fields(credit_note_id = %note.credit_note_id, status = %note.status.as_str()))]
    async fn update_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_credit_note"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        let updated = update_credit_note_row(&mut conn, note).await?;

        timer.observe_duration();
        Ok(updated)
    }

    #[instrument(skip(self, note), fields(credit_note_id = %note.credit_note_id, invoice_id = %note.invoice_id))]
    async fn issue_credit_note(&self, note: &CreditNote) -> Result<CreditNote, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["issue_credit_note"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        // Serializes issuers crediting the same invoice.
        sqlx::query("SELECT invoice_id FROM invoices WHERE invoice_id = $1 FOR UPDATE")
            .bind(note.invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock invoice"))?
            .ok_or_else(|| BillingError::not_found("invoice", note.invoice_id))?;

        let invoice_lines = sqlx::query_as::<_, InvoiceLine>(&format!(
            "SELECT {LINE_COLUMNS} FROM invoice_lines WHERE invoice_id = $1 ORDER BY line_number"
        ))
        .bind(note.invoice_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("get invoice lines"))?;

        let requested: HashMap<Uuid, Decimal> = sqlx::query_as::<_, (Uuid, Decimal)>(
            r#"
            SELECT invoice_line_id, SUM(amount)
            FROM credit_note_lines
            WHERE credit_note_id = $1
            GROUP BY invoice_line_id
            "#,
        )
        .bind(note.credit_note_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("sum credit note lines"))?
        .into_iter()
        .collect();

        let credited = issued_credit_rows(&mut tx, note.invoice_id).await?;
        check_remaining(&invoice_lines, &credited, &requested)?;

        let issued = update_credit_note_row(&mut tx, note).await?;
        tx.commit().await.map_err(db_err("commit credit note"))?;

        timer.observe_duration();
        Ok(issued)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn issued_credit_totals(
        &self,
        invoice_id: Uuid,
    ) -> Result<HashMap<Uuid, Decimal>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["issued_credit_totals"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        let totals = issued_credit_rows(&mut conn, invoice_id).await?;

        timer.observe_duration();
        Ok(totals)
    }
}
