//! Batch invoice runs over an organization's leases.

use super::generator::InvoiceGenerator;
use crate::error::BillingError;
use crate::models::{
    InvoiceRun, InvoiceRunItem, InvoiceRunKind, InvoiceRunStatus, Lease, ProrationMethod,
    RunResult,
};
use crate::services::metrics::{record_invoice_run, record_run_lease_failure};
use crate::services::{Clock, Store};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_PARALLEL_LEASES: usize = 4;

#[derive(Clone)]
pub struct InvoiceRunner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    generator: InvoiceGenerator,
    max_parallel_leases: usize,
    retry: RetryConfig,
}

impl InvoiceRunner {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        generator: InvoiceGenerator,
        max_parallel_leases: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            generator,
            max_parallel_leases: max_parallel_leases.max(1),
            retry,
        }
    }

    /// Generate draft invoices for every active lease of the organization.
    #[instrument(skip(self, cancel), fields(org_id = %org_id))]
    pub async fn run_monthly_rent(
        &self,
        org_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        proration_method: Option<ProrationMethod>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, BillingError> {
        let run = self
            .start_run(org_id, InvoiceRunKind::MonthlyRent, period_start, period_end)
            .await?;
        let leases = match self.store.list_rent_run_leases(org_id).await {
            Ok(leases) => leases,
            Err(e) => return Err(self.fail_run(run, e).await),
        };
        self.process(run, leases, proration_method, cancel).await
    }

    /// Generate invoices for leases holding final, unbilled utility statements.
    #[instrument(skip(self, cancel), fields(org_id = %org_id))]
    pub async fn run_utilities(
        &self,
        org_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<RunResult, BillingError> {
        let run = self
            .start_run(org_id, InvoiceRunKind::Utilities, period_start, period_end)
            .await?;
        let leases = match self
            .store
            .list_utility_run_leases(org_id, period_start, period_end)
            .await
        {
            Ok(leases) => leases,
            Err(e) => return Err(self.fail_run(run, e).await),
        };
        self.process(run, leases, None, cancel).await
    }

    async fn start_run(
        &self,
        org_id: Uuid,
        kind: InvoiceRunKind,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<InvoiceRun, BillingError> {
        if period_end < period_start {
            return Err(BillingError::validation(format!(
                "period end {} is before period start {}",
                period_end, period_start
            )));
        }

        let run = self
            .store
            .insert_invoice_run(&InvoiceRun {
                run_id: Uuid::new_v4(),
                org_id,
                kind,
                period_start,
                period_end,
                status: InvoiceRunStatus::InProgress,
                started_at_utc: self.clock.now(),
                completed_at_utc: None,
                total_leases: 0,
                success_count: 0,
                failure_count: 0,
                error_message: None,
                version: 1,
            })
            .await?;

        info!(
            run_id = %run.run_id,
            kind = kind.as_str(),
            period_start = %period_start,
            period_end = %period_end,
            "Starting invoice run"
        );
        Ok(run)
    }

    async fn generate_item(
        &self,
        run: &InvoiceRun,
        lease_id: Uuid,
        proration_method: Option<ProrationMethod>,
    ) -> InvoiceRunItem {
        let result = retry_with_backoff(
            &self.retry,
            "generate_invoice",
            BillingError::is_retryable,
            || {
                self.generator.generate_invoice(
                    run.org_id,
                    lease_id,
                    run.period_start,
                    run.period_end,
                    proration_method,
                )
            },
        )
        .await;

        let (is_success, invoice_id, was_updated, error_message) = match result {
            Ok(generated) => (true, Some(generated.invoice.invoice_id), generated.was_updated, None),
            Err(e) => {
                record_run_lease_failure(&run.org_id.to_string(), e.kind());
                warn!(
                    run_id = %run.run_id,
                    lease_id = %lease_id,
                    kind = e.kind(),
                    error = %e,
                    "Lease failed in invoice run"
                );
                (false, None, false, Some(e.to_string()))
            }
        };

        InvoiceRunItem {
            item_id: Uuid::new_v4(),
            run_id: run.run_id,
            lease_id,
            is_success,
            invoice_id,
            was_updated,
            error_message,
            created_utc: self.clock.now(),
        }
    }

    async fn process(
        &self,
        run: InvoiceRun,
        leases: Vec<Lease>,
        proration_method: Option<ProrationMethod>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, BillingError> {
        let run_ref = &run;
        let mut outcomes = stream::iter(leases)
            .map(|lease| async move {
                // Leases not yet started when the token fires are skipped.
                if cancel.is_cancelled() {
                    return None;
                }
                Some(
                    self.generate_item(run_ref, lease.lease_id, proration_method)
                        .await,
                )
            })
            .buffer_unordered(self.max_parallel_leases);

        let mut items = Vec::new();
        let mut skipped = 0usize;
        while let Some(outcome) = outcomes.next().await {
            let Some(item) = outcome else {
                skipped += 1;
                continue;
            };
            if let Err(e) = self.store.insert_invoice_run_item(&item).await {
                drop(outcomes);
                return Err(self.fail_run(run, e).await);
            }
            items.push(item);
        }
        drop(outcomes);

        let success_count = items.iter().filter(|i| i.is_success).count() as i32;
        let failure_count = items.len() as i32 - success_count;
        let status = InvoiceRunStatus::derive(success_count, failure_count, skipped > 0);

        let mut finished = run.clone();
        finished.status = status;
        finished.completed_at_utc = Some(self.clock.now());
        finished.total_leases = items.len() as i32;
        finished.success_count = success_count;
        finished.failure_count = failure_count;
        finished.error_message = (failure_count > 0).then(|| {
            format!(
                "{} of {} leases failed",
                failure_count, finished.total_leases
            )
        });

        let finished = match self.store.update_invoice_run(&finished).await {
            Ok(saved) => saved,
            Err(e) => return Err(self.fail_run(run, e).await),
        };

        record_invoice_run(
            &finished.org_id.to_string(),
            finished.kind.as_str(),
            finished.status.as_str(),
        );
        info!(
            run_id = %finished.run_id,
            status = finished.status.as_str(),
            total = finished.total_leases,
            succeeded = finished.success_count,
            failed = finished.failure_count,
            skipped,
            "Invoice run finished"
        );

        Ok(RunResult {
            run: finished,
            items,
        })
    }

    /// Mark the run failed on a best-effort basis and hand back the cause.
    async fn fail_run(&self, mut run: InvoiceRun, cause: BillingError) -> BillingError {
        error!(run_id = %run.run_id, error = %cause, "Invoice run aborted");
        run.status = InvoiceRunStatus::Failed;
        run.completed_at_utc = Some(self.clock.now());
        run.error_message = Some(cause.to_string());
        if let Err(e) = self.store.update_invoice_run(&run).await {
            warn!(run_id = %run.run_id, error = %e, "Could not mark invoice run failed");
        }
        record_invoice_run(
            &run.org_id.to_string(),
            run.kind.as_str(),
            InvoiceRunStatus::Failed.as_str(),
        );
        cause
    }
}
