//! AIGC Background Worker
//!
//! Handles scheduled jobs:
//! - Expired credit reservation sweep (every 15 minutes)
//! - Stalled subtask recall (every 5 minutes)
//! - Credit ledger invariant checks (hourly)

use std::sync::Arc;
use std::time::Duration;

use aigc_api::{AppState, Config};
use aigc_billing::{CreditLedger, InvariantChecker, PgCreditLedger};
use aigc_shared::create_worker_pool;
use aigc_tasks::{RecallState, SubTaskRecall};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Subtasks silent for this long are polled instead of waiting on a webhook
const STALLED_AFTER: time::Duration = time::Duration::minutes(10);

fn log_recall_results(results: &[SubTaskRecall]) {
    let count = |state: RecallState| results.iter().filter(|r| r.state == state).count();

    info!(
        recalled = results.len(),
        completed = count(RecallState::Completed),
        failed = count(RecallState::Failed),
        still_running = count(RecallState::StillRunning),
        recall_failed = count(RecallState::RecallFailed),
        "Stalled subtask recall complete"
    );

    for result in results {
        if result.state == RecallState::RecallFailed {
            warn!(
                sub_task_id = %result.sub_task_id,
                message = result.message.as_deref().unwrap_or(""),
                "Could not recall subtask"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting AIGC Worker");

    let config = Config::from_env()?;
    let pool = create_worker_pool(&config.database_url).await?;
    let ledger = Arc::new(PgCreditLedger::new(pool.clone()));
    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    let orchestrator = AppState::new(pool, config)?.orchestrator;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Release reservations whose holder never settled them
    let sweep_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let ledger = sweep_ledger.clone();
            Box::pin(async move {
                info!("Running expired reservation sweep");
                match ledger.cancel_expired_reservations(OffsetDateTime::now_utc()).await {
                    Ok(cancelled) if cancelled.is_empty() => {}
                    Ok(cancelled) => {
                        warn!(count = cancelled.len(), ids = ?cancelled, "Cancelled expired reservations");
                    }
                    Err(e) => error!(error = %e, "Expired reservation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired reservation sweep (every 15 minutes)");

    // Job 2: Poll providers for subtasks whose webhook never arrived
    let recall_orchestrator = orchestrator.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let orchestrator = recall_orchestrator.clone();
            Box::pin(async move {
                match orchestrator.recall_stalled(STALLED_AFTER).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_recall_results(&results),
                    Err(e) => error!(error = %e, "Stalled subtask recall failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stalled subtask recall (every 5 minutes)");

    // Job 3: Ledger consistency checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running credit ledger invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Credit ledger is consistent");
                    }
                    Ok(summary) => {
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            worst = ?summary.worst_severity(),
                            "Credit ledger invariant violations found"
                        );
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                entities = ?violation.entity_ids,
                                description = %violation.description,
                                "Invariant violation"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Credit ledger invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("AIGC Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
