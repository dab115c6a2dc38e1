use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warden_core::clock::Clock;

use crate::config::DaemonConfig;
use crate::http::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSchedule {
    pub audit_interval: Duration,
    pub idempotency_interval: Duration,
    pub batch_size: usize,
}

impl GcSchedule {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            audit_interval: Duration::from_secs(cfg.audit_gc_interval_secs),
            idempotency_interval: Duration::from_secs(cfg.idempotency_gc_interval_secs),
            batch_size: cfg.gc_batch_size,
        }
    }
}

pub async fn run_audit_gc(state: &AppState, batch_size: usize) -> usize {
    let now = state.clock.now_ms();
    match state.ledger.collect_garbage(now, batch_size).await {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!(deleted, "audit retention gc removed expired events");
            }
            state.telemetry.record_gc_deleted("audit", deleted);
            deleted
        }
        Err(err) => {
            tracing::error!(error = %err, "audit retention gc failed");
            0
        }
    }
}

pub async fn run_idempotency_gc(state: &AppState, batch_size: usize) -> usize {
    let now = state.clock.now_ms();
    match state.idempotency.collect_garbage(now, batch_size).await {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!(deleted, "idempotency gc removed expired records");
            }
            state.telemetry.record_gc_deleted("idempotency", deleted);
            deleted
        }
        Err(err) => {
            tracing::error!(error = %err, "idempotency gc failed");
            0
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Starts the retention and TTL sweepers. Both stop once `shutdown` flips or
/// its sender is dropped.
pub fn spawn_gc_jobs(
    state: AppState,
    schedule: GcSchedule,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let audit = {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = ticker(schedule.audit_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        run_audit_gc(&state, schedule.batch_size).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("audit gc stopped");
        })
    };
    let idempotency = {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut interval = ticker(schedule.idempotency_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        run_idempotency_gc(&state, schedule.batch_size).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("idempotency gc stopped");
        })
    };
    vec![audit, idempotency]
}
