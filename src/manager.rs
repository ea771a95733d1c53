use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{
    assert_valid_schema, JobDefaults, ManagerOptions, DEFAULT_ARCHIVE_COMPLETED_AFTER,
    DEFAULT_DELETE_ARCHIVED_AFTER, DEFAULT_POLLING_INTERVAL,
};
use crate::errors::{Error, Result};
use crate::events::{Events, QueueEvent};
use crate::job::{wrap_output, BatchOutcome, Job, JobInsert, SendOptions, StartAfter};
use crate::migrations;
use crate::queue::{assert_valid_name, Queue, QueueOptions};
use crate::sql;
use crate::sql::insert_job::debounce_start_after;
use crate::sql::maintenance::StateCount;
use crate::worker::{
    run_worker, wip_snapshot, HandlerFn, Worker, WorkerContext, WorkerOptions, WorkerRegistry,
    WorkerSnapshot,
};

/// Sentinel reason recorded when `fail_wip` reaps in-flight jobs.
pub const SHUTDOWN_MESSAGE: &str = "stevedore shut down while active";

/// Cadence of the queue-metadata and clock-skew refresh task.
const METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Options for a single [`Manager::fetch`] call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub priority: bool,
    pub include_metadata: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            batch_size: 1,
            priority: true,
            include_metadata: false,
        }
    }
}

/// Per-queue outcome of a [`Manager::publish`] fan-out.
#[derive(Debug)]
pub struct PublishOutcome {
    pub queue: String,
    pub result: Result<Option<Uuid>>,
}

/// Row counts from one [`Manager::maintain`] sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceSummary {
    /// Active jobs reaped past their deadline.
    pub expired: i64,
    /// Terminal jobs moved to the archive.
    pub archived: u64,
    /// Archive rows deleted past retention.
    pub dropped: u64,
}

struct Inner {
    pool: PgPool,
    schema: Arc<String>,
    defaults: JobDefaults,
    polling_interval: Duration,
    archive_completed_after: Duration,
    delete_archived_after: Duration,
    test_throw_worker: bool,
    events: Events,
    queues: RwLock<HashMap<String, Queue>>,
    clock_skew_ms: AtomicI64,
    workers: WorkerRegistry,
    worker_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    /// In-flight batches captured when `stop` began draining, kept so a
    /// `fail_wip` after `stop` can still reap anything left unreported.
    final_wip: Mutex<Vec<(String, Vec<Uuid>)>>,
    stopped: AtomicBool,
}

/// The queue manager: owns the connection pool, the queue-metadata cache
/// and the worker registry, and exposes the whole producer/consumer API.
///
/// Cloning is cheap and shares the same manager. A process may host several
/// managers against different schemas; there is no global state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Start configuring a manager.
    pub fn options() -> ManagerOptions {
        ManagerOptions::default()
    }

    pub(crate) async fn connect_with(mut options: ManagerOptions) -> Result<Self> {
        let schema = options
            .schema
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_SCHEMA.to_string());
        assert_valid_schema(&schema)?;

        let pool = options.resolve_pool().await?;

        migrations::migrate(&pool, &schema).await?;

        let inner = Arc::new(Inner {
            pool,
            schema: Arc::new(schema),
            defaults: options.job_defaults(),
            polling_interval: options.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL),
            archive_completed_after: options
                .archive_completed_after
                .unwrap_or(DEFAULT_ARCHIVE_COMPLETED_AFTER),
            delete_archived_after: options
                .delete_archived_after
                .unwrap_or(DEFAULT_DELETE_ARCHIVED_AFTER),
            test_throw_worker: options.test_throw_worker,
            events: Events::new(64),
            queues: RwLock::new(HashMap::new()),
            clock_skew_ms: AtomicI64::new(0),
            workers: Arc::new(Mutex::new(HashMap::new())),
            worker_tasks: Mutex::new(HashMap::new()),
            refresh_task: Mutex::new(None),
            final_wip: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        if let Err(e) = refresh_metadata(&inner).await {
            warn!(error = %e, "Initial metadata refresh failed");
        }

        let refresh = tokio::spawn(metadata_refresh_loop(Arc::downgrade(&inner)));
        *inner
            .refresh_task
            .lock()
            .expect("refresh task lock poisoned") = Some(refresh);

        info!(schema = %inner.schema, "Queue manager started");
        Ok(Manager { inner })
    }

    /// Subscribe to `error` and `wip` events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    // ----- queue registry -----

    /// Create a queue: the metadata row plus its partition of the job table
    /// with the policy's unique partial indexes.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_running()?;
        assert_valid_name(name)?;

        if let Some(dead_letter) = options.dead_letter.as_deref() {
            assert_valid_name(dead_letter)?;
            if dead_letter == name {
                return Err(Error::validation(format!(
                    "queue '{name}' cannot dead-letter to itself"
                )));
            }
        }

        sql::queues::create_queue(&self.inner.pool, &self.inner.schema, name, &options).await?;
        self.refresh_queue(name).await?;

        debug!(queue = name, "Queue created");
        Ok(())
    }

    /// Update the mutable queue fields; unset options keep current values.
    pub async fn update_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_running()?;
        assert_valid_name(name)?;

        if let Some(dead_letter) = options.dead_letter.as_deref() {
            assert_valid_name(dead_letter)?;
            if dead_letter == name {
                return Err(Error::validation(format!(
                    "queue '{name}' cannot dead-letter to itself"
                )));
            }
        }

        let affected =
            sql::queues::update_queue(&self.inner.pool, &self.inner.schema, name, &options).await?;
        if affected == 0 {
            return Err(Error::not_found(format!("queue '{name}'")));
        }

        self.refresh_queue(name).await?;
        Ok(())
    }

    /// Drop the queue's partition (and every job in it) plus its metadata.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        assert_valid_name(name)?;

        if sql::queues::get_queue(&self.inner.pool, &self.inner.schema, name)
            .await?
            .is_none()
        {
            return Err(Error::not_found(format!("queue '{name}'")));
        }

        sql::queues::delete_queue(&self.inner.pool, &self.inner.schema, name).await?;
        self.inner.queues.write().await.remove(name);

        debug!(queue = name, "Queue deleted");
        Ok(())
    }

    /// Delete queued (created or retry) jobs, leaving active and terminal
    /// rows alone.
    pub async fn purge_queue(&self, name: &str) -> Result<u64> {
        self.ensure_running()?;
        self.resolve_queue(name).await?;

        sql::queues::purge_queue(&self.inner.pool, &self.inner.schema, sql::JOB_TABLE, name).await
    }

    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        assert_valid_name(name)?;

        let queue = sql::queues::get_queue(&self.inner.pool, &self.inner.schema, name).await?;
        if let Some(ref q) = queue {
            self.inner
                .queues
                .write()
                .await
                .insert(name.to_string(), q.clone());
        }

        Ok(queue)
    }

    pub async fn get_queues(&self) -> Result<Vec<Queue>> {
        sql::queues::get_queues(&self.inner.pool, &self.inner.schema).await
    }

    /// Count jobs that have not reached a terminal state, optionally only
    /// those eligible before `before`.
    pub async fn get_queue_size(
        &self,
        name: &str,
        before: Option<chrono::DateTime<Utc>>,
    ) -> Result<i64> {
        self.resolve_queue(name).await?;

        sql::queues::get_queue_size(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            before,
        )
        .await
    }

    /// Cache lookup with lazy fill on miss; the cache may briefly lag queue
    /// deletion, the database constraints stay authoritative.
    async fn resolve_queue(&self, name: &str) -> Result<Queue> {
        assert_valid_name(name)?;

        if let Some(queue) = self.inner.queues.read().await.get(name) {
            return Ok(queue.clone());
        }

        let queue = sql::queues::get_queue(&self.inner.pool, &self.inner.schema, name)
            .await?
            .ok_or_else(|| Error::not_found(format!("queue '{name}'")))?;

        self.inner
            .queues
            .write()
            .await
            .insert(name.to_string(), queue.clone());

        Ok(queue)
    }

    async fn refresh_queue(&self, name: &str) -> Result<()> {
        if let Some(queue) =
            sql::queues::get_queue(&self.inner.pool, &self.inner.schema, name).await?
        {
            self.inner
                .queues
                .write()
                .await
                .insert(name.to_string(), queue);
        }
        Ok(())
    }

    // ----- producing -----

    /// Enqueue one job. Returns `None` when a uniqueness policy or throttle
    /// absorbed the send.
    pub async fn send<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        let data = serde_json::to_value(data)?;
        self.send_value(name, data, options).await
    }

    /// Enqueue a job that becomes eligible at `after`.
    pub async fn send_after<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: SendOptions,
        after: impl Into<StartAfter>,
    ) -> Result<Option<Uuid>> {
        let mut options = options;
        options.start_after = Some(after.into().resolve(Utc::now()));
        self.send(name, data, options).await
    }

    /// Keep at most one job per key per `seconds`-wide window; extra sends
    /// in the same window are dropped and report `None`.
    pub async fn send_throttled<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: SendOptions,
        seconds: i32,
        key: Option<&str>,
    ) -> Result<Option<Uuid>> {
        if seconds <= 0 {
            return Err(Error::validation("throttle window must be positive"));
        }

        let mut options = options;
        options.singleton_seconds = Some(seconds);
        options.singleton_key = key.map(str::to_string);
        options.singleton_next_slot = Some(false);
        self.send(name, data, options).await
    }

    /// Like a throttle, but a send colliding with the current window is
    /// retried once into the next window instead of dropped.
    pub async fn send_debounced<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: SendOptions,
        seconds: i32,
        key: Option<&str>,
    ) -> Result<Option<Uuid>> {
        if seconds <= 0 {
            return Err(Error::validation("debounce window must be positive"));
        }

        let data = serde_json::to_value(data)?;

        let mut options = options;
        options.singleton_seconds = Some(seconds);
        options.singleton_key = key.map(str::to_string);
        options.singleton_next_slot = Some(true);

        let first = self.send_value(name, data.clone(), options.clone()).await?;
        if first.is_some() {
            return Ok(first);
        }

        // Current bucket is taken; place the retry at the next boundary,
        // using the database's clock rather than ours.
        let adjusted_now =
            Utc::now().timestamp_millis() + self.inner.clock_skew_ms.load(Ordering::Relaxed);
        let delay = debounce_start_after(seconds, adjusted_now);

        options.start_after = Some(Utc::now() + chrono::Duration::seconds(i64::from(delay)));
        options.singleton_offset = Some(seconds);

        self.send_value(name, data, options).await
    }

    async fn send_value(
        &self,
        name: &str,
        data: Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        self.ensure_running()?;
        self.resolve_queue(name).await?;

        let data = if data.is_null() { None } else { Some(data) };

        let id = sql::insert_job::insert_job(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            data.as_ref(),
            &options,
            &self.inner.defaults,
        )
        .await?;

        if id.is_none() {
            debug!(queue = name, "Send absorbed by uniqueness policy");
        }

        Ok(id)
    }

    /// Bulk enqueue. Rows absorbed by uniqueness policies are missing from
    /// the returned ids.
    pub async fn insert(&self, name: &str, jobs: &[JobInsert]) -> Result<Vec<Uuid>> {
        self.ensure_running()?;

        if jobs.is_empty() {
            return Err(Error::validation("insert requires at least one job"));
        }

        self.resolve_queue(name).await?;

        sql::insert_job::insert_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            jobs,
            &self.inner.defaults,
        )
        .await
    }

    // ----- consuming -----

    /// Claim a batch of jobs. Transport errors are absorbed into an empty
    /// batch (and an `error` event), because the expected failure class
    /// under contention clears on the next poll.
    pub async fn fetch(&self, name: &str, options: FetchOptions) -> Result<Vec<Job>> {
        assert_valid_name(name)?;
        if options.batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }

        match sql::fetch_next_job::fetch_next_job(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            options.batch_size as i64,
            options.priority,
            options.include_metadata,
        )
        .await
        {
            Ok(jobs) => Ok(jobs),
            Err(e) => {
                warn!(queue = name, error = %e, "Fetch failed, returning empty batch");
                self.inner
                    .events
                    .emit_error(format!("{e}"), Some(name.to_string()), None);
                Ok(Vec::new())
            }
        }
    }

    /// Mark active jobs completed, storing `data` as their output.
    pub async fn complete(
        &self,
        name: &str,
        ids: &[Uuid],
        data: Option<Value>,
    ) -> Result<BatchOutcome> {
        assert_valid_name(name)?;
        assert_some_ids(ids)?;

        let output = wrap_output(data);
        let jobs = sql::complete_jobs::complete_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            ids,
            output.as_ref(),
        )
        .await?;

        Ok(outcome(jobs, ids.len()))
    }

    /// Fail jobs: retry when budget remains, otherwise terminal failure
    /// plus dead-letter forwarding when the queue configures it.
    pub async fn fail(&self, name: &str, ids: &[Uuid], data: Option<Value>) -> Result<BatchOutcome> {
        assert_valid_name(name)?;
        assert_some_ids(ids)?;

        let output = wrap_output(data);
        let jobs = sql::fail_jobs::fail_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            ids,
            output.as_ref(),
        )
        .await?;

        Ok(outcome(jobs, ids.len()))
    }

    pub async fn cancel(&self, name: &str, ids: &[Uuid]) -> Result<BatchOutcome> {
        assert_valid_name(name)?;
        assert_some_ids(ids)?;

        let plan = sql::job_updates::cancel_jobs_plan(&self.inner.schema, sql::JOB_TABLE);
        let jobs = sql::job_updates::run_ids_plan(&self.inner.pool, &plan, name, ids).await?;

        Ok(outcome(jobs, ids.len()))
    }

    /// Return terminal jobs to `created`, unless the archive sweep already
    /// moved them.
    pub async fn resume(&self, name: &str, ids: &[Uuid]) -> Result<BatchOutcome> {
        assert_valid_name(name)?;
        assert_some_ids(ids)?;

        let plan = sql::job_updates::resume_jobs_plan(&self.inner.schema, sql::JOB_TABLE);
        let jobs = sql::job_updates::run_ids_plan(&self.inner.pool, &plan, name, ids).await?;

        Ok(outcome(jobs, ids.len()))
    }

    pub async fn delete_job(&self, name: &str, ids: &[Uuid]) -> Result<BatchOutcome> {
        assert_valid_name(name)?;
        assert_some_ids(ids)?;

        let plan = sql::job_updates::delete_jobs_plan(&self.inner.schema, sql::JOB_TABLE);
        let jobs = sql::job_updates::run_ids_plan(&self.inner.pool, &plan, name, ids).await?;

        Ok(outcome(jobs, ids.len()))
    }

    /// Look a job up in the live table, falling back to the archive when
    /// asked.
    pub async fn get_job_by_id(
        &self,
        name: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>> {
        assert_valid_name(name)?;

        let job = sql::get_job::get_job_by_id(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            name,
            id,
        )
        .await?;

        if job.is_some() || !include_archive {
            return Ok(job);
        }

        sql::get_job::get_job_by_id(
            &self.inner.pool,
            &self.inner.schema,
            sql::ARCHIVE_TABLE,
            name,
            id,
        )
        .await
    }

    // ----- workers -----

    /// Start a polling worker against `name`. The handler receives the
    /// fetched batch; its return value becomes the job output when the
    /// batch holds a single job.
    pub async fn work<F, Fut, R, E>(
        &self,
        name: &str,
        options: WorkerOptions,
        handler: F,
    ) -> Result<Uuid>
    where
        F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Debug + Send + 'static,
    {
        self.ensure_running()?;
        assert_valid_name(name)?;
        if options.batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }

        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |jobs| {
            let handler = handler.clone();
            async move {
                match handler(jobs).await {
                    Ok(value) => {
                        let value = serde_json::to_value(value).map_err(|e| format!("{e:?}"))?;
                        Ok(if value.is_null() { None } else { Some(value) })
                    }
                    Err(e) => Err(format!("{e:?}")),
                }
            }
            .boxed()
        });

        let poll_interval = options
            .poll_interval
            .unwrap_or(self.inner.polling_interval);
        let worker = Arc::new(Worker::new(name.to_string(), options));
        let id = worker.id();

        self.inner
            .workers
            .lock()
            .expect("worker registry lock poisoned")
            .insert(id, worker.clone());

        let ctx = WorkerContext {
            pool: self.inner.pool.clone(),
            schema: self.inner.schema.clone(),
            worker,
            handler: erased,
            events: self.inner.events.clone(),
            registry: self.inner.workers.clone(),
            poll_interval,
            test_throw: self.inner.test_throw_worker,
        };

        let task = tokio::spawn(run_worker(ctx));
        self.inner
            .worker_tasks
            .lock()
            .expect("worker tasks lock poisoned")
            .insert(id, task);

        Ok(id)
    }

    /// Stop and remove every worker polling `name`.
    pub async fn off_work(&self, name: &str) -> Result<()> {
        assert_valid_name(name)?;

        let ids: Vec<Uuid> = {
            let workers = self
                .inner
                .workers
                .lock()
                .expect("worker registry lock poisoned");
            workers
                .values()
                .filter(|w| w.name() == name)
                .map(|w| w.id())
                .collect()
        };

        self.remove_workers(&ids).await;
        Ok(())
    }

    /// Stop and remove one worker by id.
    pub async fn off_work_by_id(&self, id: Uuid) -> Result<()> {
        self.remove_workers(&[id]).await;
        Ok(())
    }

    /// Wake a sleeping worker so it fetches immediately.
    pub fn notify_worker(&self, id: Uuid) {
        if let Some(worker) = self
            .inner
            .workers
            .lock()
            .expect("worker registry lock poisoned")
            .get(&id)
        {
            worker.notify();
        }
    }

    /// Snapshot every non-internal worker.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        wip_snapshot(&self.inner.workers)
    }

    async fn remove_workers(&self, ids: &[Uuid]) {
        let mut tasks = Vec::new();
        {
            let workers = self
                .inner
                .workers
                .lock()
                .expect("worker registry lock poisoned");
            for id in ids {
                if let Some(worker) = workers.get(id) {
                    worker.request_stop();
                }
            }
        }
        {
            let mut handles = self
                .inner
                .worker_tasks
                .lock()
                .expect("worker tasks lock poisoned");
            for id in ids {
                if let Some(task) = handles.remove(id) {
                    tasks.push(task);
                }
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let mut workers = self
            .inner
            .workers
            .lock()
            .expect("worker registry lock poisoned");
        for id in ids {
            workers.remove(id);
        }
    }

    /// Stop the manager: refuse new sends, ask every worker to stop, and
    /// wait until each reaches `stopped`. Running handlers get to finish
    /// up to their deadline. The in-flight set at stop time is retained,
    /// so a follow-up [`fail_wip`](Manager::fail_wip) can reap whatever
    /// the drain left unreported.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self
            .inner
            .refresh_task
            .lock()
            .expect("refresh task lock poisoned")
            .take()
        {
            task.abort();
        }

        let (ids, wip) = {
            let workers = self
                .inner
                .workers
                .lock()
                .expect("worker registry lock poisoned");
            let ids: Vec<Uuid> = workers.keys().copied().collect();
            let wip: Vec<(String, Vec<Uuid>)> = workers
                .values()
                .map(|w| (w.name().to_string(), w.wip_ids()))
                .filter(|(_, ids)| !ids.is_empty())
                .collect();
            (ids, wip)
        };

        self.inner
            .final_wip
            .lock()
            .expect("final wip lock poisoned")
            .extend(wip);

        self.remove_workers(&ids).await;
        info!(schema = %self.inner.schema, "Queue manager stopped");
    }

    /// Fail every in-flight batch with the shutdown sentinel.
    ///
    /// Called before `stop`, this is the ungraceful path: batches are
    /// drained from their workers and failed even though handlers are
    /// still running (their eventual reports find nothing active). Called
    /// after `stop`, it sweeps the in-flight set retained at stop time;
    /// jobs the graceful drain already reported are terminal by then, so
    /// only genuinely unreported claims transition.
    pub async fn fail_wip(&self) -> Result<()> {
        let mut wip: Vec<(String, Vec<Uuid>)> = {
            let workers = self
                .inner
                .workers
                .lock()
                .expect("worker registry lock poisoned");
            workers
                .values()
                .map(|w| (w.name().to_string(), w.take_wip()))
                .filter(|(_, ids)| !ids.is_empty())
                .collect()
        };

        wip.extend(std::mem::take(
            &mut *self
                .inner
                .final_wip
                .lock()
                .expect("final wip lock poisoned"),
        ));

        for (name, ids) in wip {
            warn!(queue = %name, count = ids.len(), "Failing in-flight jobs on shutdown");
            self.fail(
                &name,
                &ids,
                Some(serde_json::json!({ "message": SHUTDOWN_MESSAGE })),
            )
            .await?;
        }

        Ok(())
    }

    // ----- pub/sub -----

    /// Route future `publish(event, …)` calls to `name`.
    pub async fn subscribe(&self, event: &str, name: &str) -> Result<()> {
        self.ensure_running()?;
        assert_event(event)?;
        self.resolve_queue(name).await?;

        sql::subscriptions::subscribe(&self.inner.pool, &self.inner.schema, event, name).await
    }

    pub async fn unsubscribe(&self, event: &str, name: &str) -> Result<()> {
        assert_event(event)?;
        assert_valid_name(name)?;

        sql::subscriptions::unsubscribe(&self.inner.pool, &self.inner.schema, event, name).await?;
        Ok(())
    }

    /// Send `data` to every queue subscribed to `event`. Outcomes settle
    /// independently: one queue failing does not cancel the others.
    pub async fn publish<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        options: SendOptions,
    ) -> Result<Vec<PublishOutcome>> {
        self.ensure_running()?;
        assert_event(event)?;

        let names =
            sql::subscriptions::get_queues_for_event(&self.inner.pool, &self.inner.schema, event)
                .await?;

        let sends = names.into_iter().map(|name| {
            let options = options.clone();
            async move {
                let result = self.send(&name, data, options).await;
                if let Err(ref e) = result {
                    error!(queue = %name, error = %e, "Publish delivery failed");
                }
                PublishOutcome {
                    queue: name,
                    result,
                }
            }
        });

        Ok(join_all(sends).await)
    }

    // ----- maintenance -----

    /// One maintenance sweep: reap expired claims, archive terminal jobs
    /// past retention, drop old archive rows. Embedders schedule this;
    /// the manager does not.
    pub async fn maintain(&self) -> Result<MaintenanceSummary> {
        let expired = sql::maintenance::fail_expired_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
        )
        .await?;

        let archived = sql::maintenance::archive_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::JOB_TABLE,
            sql::ARCHIVE_TABLE,
            self.inner.archive_completed_after.as_secs() as i32,
        )
        .await?;

        let dropped = sql::maintenance::drop_archived_jobs(
            &self.inner.pool,
            &self.inner.schema,
            sql::ARCHIVE_TABLE,
            self.inner.delete_archived_after.as_secs() as i32,
        )
        .await?;

        Ok(MaintenanceSummary {
            expired,
            archived,
            dropped,
        })
    }

    /// Per-queue, per-state counts; stamps `monitored_on`.
    pub async fn monitor(&self) -> Result<Vec<StateCount>> {
        sql::maintenance::monitor_states(&self.inner.pool, &self.inner.schema, sql::JOB_TABLE)
            .await
    }
}

fn assert_some_ids(ids: &[Uuid]) -> Result<()> {
    if ids.is_empty() {
        return Err(Error::validation("at least one job id is required"));
    }
    Ok(())
}

fn assert_event(event: &str) -> Result<()> {
    if event.is_empty() {
        return Err(Error::validation("event name cannot be empty"));
    }
    Ok(())
}

fn outcome(jobs: Vec<Uuid>, requested: usize) -> BatchOutcome {
    let affected = jobs.len() as u64;
    BatchOutcome {
        jobs,
        requested,
        affected,
    }
}

/// Reload the queue-metadata cache and remeasure clock skew.
async fn refresh_metadata(inner: &Arc<Inner>) -> Result<()> {
    let queues = sql::queues::get_queues(&inner.pool, &inner.schema).await?;

    let mut cache = inner.queues.write().await;
    cache.clear();
    for queue in queues {
        cache.insert(queue.name().clone(), queue);
    }
    drop(cache);

    let db_ms: i64 =
        sqlx::query_scalar("select (extract(epoch from now()) * 1000)::bigint")
            .fetch_one(&inner.pool)
            .await?;
    inner
        .clock_skew_ms
        .store(db_ms - Utc::now().timestamp_millis(), Ordering::Relaxed);

    Ok(())
}

/// Background refresh: every minute, until the manager is dropped or
/// stopped. Failures surface as `error` events, never as a crash.
async fn metadata_refresh_loop(inner: Weak<Inner>) {
    loop {
        tokio::time::sleep(METADATA_REFRESH_INTERVAL).await;

        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = refresh_metadata(&inner).await {
            warn!(error = %e, "Queue metadata refresh failed");
            inner.events.emit_error(format!("{e}"), None, None);
        }
    }
}
