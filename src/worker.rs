use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::Events;
use crate::job::{failure_payload, wrap_output, Job};
use crate::queue::RESERVED_PREFIX;
use crate::sql;

/// Type-erased batch handler: receives the fetched jobs, returns an optional
/// output value or an error message.
pub(crate) type HandlerFn = Arc<
    dyn Fn(Vec<Job>) -> Pin<Box<dyn Future<Output = Result<Option<Value>, String>> + Send>>
        + Send
        + Sync,
>;

/// Shared registry of a manager's workers, keyed by worker id.
pub(crate) type WorkerRegistry = Arc<Mutex<HashMap<Uuid, Arc<Worker>>>>;

/// Lifecycle of a polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Active,
    Stopping,
    Stopped,
}

/// Polling configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Idle sleep between fetches; defaults to the manager's polling interval.
    pub poll_interval: Option<Duration>,
    /// Jobs claimed per fetch.
    pub batch_size: usize,
    /// Order candidates by priority before creation time.
    pub priority: bool,
    /// Return the full job row to the handler instead of id/data/deadline.
    pub include_metadata: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            poll_interval: None,
            batch_size: 1,
            priority: true,
            include_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct WorkerStats {
    last_fetched_on: Option<DateTime<Utc>>,
    last_job_started_on: Option<DateTime<Utc>>,
    last_job_ended_on: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_on: Option<DateTime<Utc>>,
}

/// A polling worker. The manager owns the registry; the worker exclusively
/// owns its timer and its in-flight batch until it reports.
pub struct Worker {
    id: Uuid,
    name: String,
    options: WorkerOptions,
    created_on: DateTime<Utc>,
    state: Mutex<WorkerState>,
    wip: Mutex<Vec<Uuid>>,
    stats: Mutex<WorkerStats>,
    notify: tokio::sync::Notify,
}

impl Worker {
    pub(crate) fn new(name: String, options: WorkerOptions) -> Self {
        Worker {
            id: Uuid::new_v4(),
            name,
            options,
            created_on: Utc::now(),
            state: Mutex::new(WorkerState::Created),
            wip: Mutex::new(Vec::new()),
            stats: Mutex::new(WorkerStats::default()),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state lock poisoned")
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("worker state lock poisoned") = state;
    }

    /// Wake the polling loop immediately. The permit persists, so a notify
    /// delivered while the worker is busy shortens its next idle wait to
    /// zero instead of being lost.
    pub(crate) fn notify(&self) {
        self.notify.notify_one();
    }

    /// Ask the loop to exit at its next safe point.
    pub(crate) fn request_stop(&self) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        if matches!(*state, WorkerState::Created | WorkerState::Active) {
            *state = WorkerState::Stopping;
        }
        drop(state);
        self.notify.notify_one();
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state(), WorkerState::Stopping | WorkerState::Stopped)
    }

    fn set_wip(&self, ids: Vec<Uuid>) {
        *self.wip.lock().expect("worker wip lock poisoned") = ids;
    }

    fn clear_wip(&self) {
        self.wip.lock().expect("worker wip lock poisoned").clear();
    }

    /// Drain the in-flight batch, leaving the worker with none. Used by the
    /// ungraceful-shutdown path to fail whatever was still running.
    pub(crate) fn take_wip(&self) -> Vec<Uuid> {
        std::mem::take(&mut *self.wip.lock().expect("worker wip lock poisoned"))
    }

    /// Copy of the in-flight batch, leaving it with the worker. Used by
    /// `stop` to retain the final in-flight set for later reaping.
    pub(crate) fn wip_ids(&self) -> Vec<Uuid> {
        self.wip.lock().expect("worker wip lock poisoned").clone()
    }

    fn record_fetch(&self) {
        self.stats
            .lock()
            .expect("worker stats lock poisoned")
            .last_fetched_on = Some(Utc::now());
    }

    fn record_start(&self) {
        self.stats
            .lock()
            .expect("worker stats lock poisoned")
            .last_job_started_on = Some(Utc::now());
    }

    fn record_end(&self) {
        self.stats
            .lock()
            .expect("worker stats lock poisoned")
            .last_job_ended_on = Some(Utc::now());
    }

    fn record_error(&self, message: &str) {
        let mut stats = self.stats.lock().expect("worker stats lock poisoned");
        stats.last_error = Some(message.to_string());
        stats.last_error_on = Some(Utc::now());
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        let stats = self
            .stats
            .lock()
            .expect("worker stats lock poisoned")
            .clone();

        WorkerSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            count: self.wip.lock().expect("worker wip lock poisoned").len(),
            batch_size: self.options.batch_size,
            created_on: self.created_on,
            last_fetched_on: stats.last_fetched_on,
            last_job_started_on: stats.last_job_started_on,
            last_job_ended_on: stats.last_job_ended_on,
            last_error: stats.last_error,
            last_error_on: stats.last_error_on,
        }
    }
}

/// Point-in-time view of a worker, carried by `wip` events.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub state: WorkerState,
    /// Jobs currently in flight.
    pub count: usize,
    pub batch_size: usize,
    pub created_on: DateTime<Utc>,
    pub last_fetched_on: Option<DateTime<Utc>>,
    pub last_job_started_on: Option<DateTime<Utc>>,
    pub last_job_ended_on: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_on: Option<DateTime<Utc>>,
}

/// Everything the polling loop needs from the manager.
pub(crate) struct WorkerContext {
    pub pool: PgPool,
    pub schema: Arc<String>,
    pub worker: Arc<Worker>,
    pub handler: HandlerFn,
    pub events: Events,
    pub registry: WorkerRegistry,
    pub poll_interval: Duration,
    pub test_throw: bool,
}

/// Snapshot every non-internal worker in the registry.
pub(crate) fn wip_snapshot(registry: &WorkerRegistry) -> Vec<WorkerSnapshot> {
    registry
        .lock()
        .expect("worker registry lock poisoned")
        .values()
        .filter(|w| !w.name().starts_with(RESERVED_PREFIX))
        .map(|w| w.snapshot())
        .collect()
}

/// The per-worker polling loop: sleep, fetch under row locks, dispatch to
/// the handler under a wall-clock deadline, report the outcome, repeat
/// until asked to stop.
pub(crate) async fn run_worker(ctx: WorkerContext) {
    let worker = ctx.worker.clone();
    worker.set_state(WorkerState::Active);
    debug!(worker_id = %worker.id(), queue = worker.name(), "Worker started");

    loop {
        if worker.is_stopping() {
            break;
        }

        tokio::select! {
            _ = sleep(ctx.poll_interval) => {}
            _ = worker.notify.notified() => {}
        }

        if worker.is_stopping() {
            break;
        }

        let batch = fetch_batch(&ctx).await;
        worker.record_fetch();

        if batch.is_empty() {
            continue;
        }

        let ids: Vec<Uuid> = batch.iter().map(|j| *j.id()).collect();
        worker.set_wip(ids.clone());
        worker.record_start();

        ctx.events.emit_wip(wip_snapshot(&ctx.registry));

        // Deadline for the whole batch: the widest per-job allowance.
        let deadline_secs = batch
            .iter()
            .map(|j| *j.expire_in_seconds())
            .fold(0.0_f64, f64::max);
        let deadline = Duration::from_secs_f64(deadline_secs.max(0.001));

        let single = batch.len() == 1;
        let handler_task = tokio::spawn((ctx.handler)(batch));

        // Race the handler against the deadline. A timer win abandons the
        // task (the JoinHandle is dropped, the future keeps running
        // detached) — its eventual result is discarded.
        let outcome = tokio::select! {
            res = handler_task => Some(match res {
                Ok(result) => result,
                Err(join_err) => Err(format!("{join_err:?}")),
            }),
            _ = sleep(deadline) => None,
        };

        match outcome {
            Some(Ok(output)) => {
                let output = if single { wrap_output(output) } else { None };
                if let Err(e) = sql::complete_jobs::complete_jobs(
                    &ctx.pool,
                    &ctx.schema,
                    sql::JOB_TABLE,
                    worker.name(),
                    &ids,
                    output.as_ref(),
                )
                .await
                {
                    report_failure(&ctx, &format!("{e}"));
                }
            }
            Some(Err(message)) => {
                fail_batch(&ctx, &ids, &message).await;
            }
            None => {
                let message = format!("handler execution exceeded {}ms", deadline.as_millis());
                fail_batch(&ctx, &ids, &message).await;
            }
        }

        worker.clear_wip();
        worker.record_end();
    }

    worker.set_state(WorkerState::Stopped);
    debug!(worker_id = %worker.id(), queue = worker.name(), "Worker stopped");
}

/// Fetch a batch, swallowing transport errors: the expected failure class
/// under contention is a serialization hiccup, and the next poll retries
/// anyway.
async fn fetch_batch(ctx: &WorkerContext) -> Vec<Job> {
    if ctx.test_throw {
        report_failure(ctx, "__test__throw_worker");
        return Vec::new();
    }

    match sql::fetch_next_job::fetch_next_job(
        &ctx.pool,
        &ctx.schema,
        sql::JOB_TABLE,
        ctx.worker.name(),
        ctx.worker.options.batch_size as i64,
        ctx.worker.options.priority,
        ctx.worker.options.include_metadata,
    )
    .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            report_failure(ctx, &format!("{e}"));
            Vec::new()
        }
    }
}

async fn fail_batch(ctx: &WorkerContext, ids: &[Uuid], message: &str) {
    report_failure(ctx, message);

    if let Err(e) = sql::fail_jobs::fail_jobs(
        &ctx.pool,
        &ctx.schema,
        sql::JOB_TABLE,
        ctx.worker.name(),
        ids,
        Some(&failure_payload(message)),
    )
    .await
    {
        warn!(worker_id = %ctx.worker.id(), error = %e, "Could not fail batch");
        ctx.events.emit_error(
            format!("{e}"),
            Some(ctx.worker.name().to_string()),
            Some(ctx.worker.id()),
        );
    }
}

fn report_failure(ctx: &WorkerContext, message: &str) {
    warn!(worker_id = %ctx.worker.id(), queue = ctx.worker.name(), message, "Worker error");
    ctx.worker.record_error(message);
    ctx.events.emit_error(
        message.to_string(),
        Some(ctx.worker.name().to_string()),
        Some(ctx.worker.id()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_moves_created_and_active_to_stopping() {
        let worker = Worker::new("q".into(), WorkerOptions::default());
        assert_eq!(worker.state(), WorkerState::Created);

        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::Stopping);

        // A stopped worker stays stopped.
        worker.set_state(WorkerState::Stopped);
        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn take_wip_drains_the_batch() {
        let worker = Worker::new("q".into(), WorkerOptions::default());
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        worker.set_wip(ids.clone());

        assert_eq!(worker.snapshot().count, 2);
        assert_eq!(worker.take_wip(), ids);
        assert_eq!(worker.snapshot().count, 0);
    }

    #[test]
    fn snapshot_reflects_errors() {
        let worker = Worker::new("q".into(), WorkerOptions::default());
        worker.record_error("boom");

        let snap = worker.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert!(snap.last_error_on.is_some());
    }
}
