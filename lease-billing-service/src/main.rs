//! Lease billing batch entry point.
//!
//! Executes one invoice run described by the `run` configuration section and
//! exits with a status derived from the run outcome.

use lease_billing_service::config::LeaseBillingConfig;
use lease_billing_service::models::{InvoiceRunKind, InvoiceRunStatus, RunResult};
use lease_billing_service::services::{get_metrics, init_metrics, PgStore, SystemClock};
use lease_billing_service::BillingEngine;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling invoice run");
}

fn run_exit_code(status: InvoiceRunStatus) -> u8 {
    match status {
        InvoiceRunStatus::Completed => 0,
        InvoiceRunStatus::CompletedWithErrors => 5,
        InvoiceRunStatus::Failed | InvoiceRunStatus::InProgress => 6,
        InvoiceRunStatus::Cancelled => 130,
    }
}

async fn execute(config: LeaseBillingConfig) -> Result<RunResult, AppError> {
    let (period_start, period_end) = config.run.period_bounds()?;

    let store = PgStore::new(
        config.database.url.expose_secret(),
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    if config.database.run_migrations {
        store.run_migrations().await?;
    }

    let engine = BillingEngine::new(Arc::new(store), Arc::new(SystemClock), &config.engine);
    engine.store().health_check().await?;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        watcher.cancel();
    });

    let result = match config.run.kind {
        InvoiceRunKind::MonthlyRent => {
            engine
                .runner
                .run_monthly_rent(
                    config.run.org_id,
                    period_start,
                    period_end,
                    config.run.proration_method,
                    &cancel,
                )
                .await
        }
        InvoiceRunKind::Utilities => {
            engine
                .runner
                .run_utilities(config.run.org_id, period_start, period_end, &cancel)
                .await
        }
    };
    signal_task.abort();

    Ok(result?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match LeaseBillingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        org_id = %config.run.org_id,
        kind = config.run.kind.as_str(),
        period = %config.run.period,
        max_parallel_leases = config.engine.max_parallel_leases,
        db_max_connections = config.database.max_connections,
        "Starting lease-billing-service"
    );

    match execute(config).await {
        Ok(result) => {
            for item in result.failed_items() {
                tracing::warn!(
                    lease_id = %item.lease_id,
                    error = item.error_message.as_deref().unwrap_or_default(),
                    "Lease not invoiced"
                );
            }
            match serde_json::to_string(&result.run) {
                Ok(summary) => println!("{}", summary),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize run summary"),
            }
            tracing::debug!(metrics = %get_metrics(), "Final metrics");
            ExitCode::from(run_exit_code(result.run.status))
        }
        Err(e) => {
            tracing::error!(error = %e, "Invoice run failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
