use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::{PgTypeInfo, PgValueRef};
use sqlx::{Decode, FromRow, Postgres, Type};
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// The declaration order mirrors the `job_state` enum in the database and is
/// total: `created < retry < active < completed < cancelled < failed`. Every
/// partial-index predicate and fetch condition compares against this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    /// States at or past `completed`; jobs in these states are eligible for
    /// resume and for the archive sweep.
    pub fn is_terminal(&self) -> bool {
        *self >= JobState::Completed
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "retry" => Ok(JobState::Retry),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "cancelled" => Ok(JobState::Cancelled),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

// The job_state enum lives in a configurable schema, so rows always cast it
// to text on the way out and this decodes from the text form.
impl Type<Postgres> for JobState {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for JobState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// A job row as returned by fetch and lookup operations.
///
/// When a fetch runs without `include_metadata`, the scheduling and retry
/// columns come back as nulls and only `id`, `name`, `data` and
/// `expire_in_seconds` are populated.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct Job {
    id: Uuid,
    /// Queue name; also the partition key.
    name: String,
    data: Option<Value>,
    /// Handler deadline for this job, from the queue's `expire_seconds`.
    expire_in_seconds: f64,
    state: Option<JobState>,
    priority: Option<i32>,
    retry_limit: Option<i32>,
    retry_count: Option<i32>,
    retry_delay: Option<i32>,
    retry_backoff: Option<bool>,
    start_after: Option<DateTime<Utc>>,
    started_on: Option<DateTime<Utc>>,
    singleton_key: Option<String>,
    singleton_on: Option<DateTime<Utc>>,
    created_on: Option<DateTime<Utc>>,
    completed_on: Option<DateTime<Utc>>,
    keep_until: Option<DateTime<Utc>>,
    output: Option<Value>,
    dead_letter: Option<String>,
    policy: Option<String>,
}

/// When a deferred send should become eligible.
#[derive(Debug, Clone, Copy)]
pub enum StartAfter {
    /// Eligible at this instant.
    At(DateTime<Utc>),
    /// Eligible after this delay from now.
    In(Duration),
}

impl StartAfter {
    pub(crate) fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            StartAfter::At(ts) => *ts,
            StartAfter::In(delay) => {
                now + chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::zero())
            }
        }
    }
}

impl From<DateTime<Utc>> for StartAfter {
    fn from(ts: DateTime<Utc>) -> Self {
        StartAfter::At(ts)
    }
}

impl From<Duration> for StartAfter {
    fn from(delay: Duration) -> Self {
        StartAfter::In(delay)
    }
}

/// Per-send overrides applied on top of the queue's configuration.
///
/// Everything is optional; unset fields fall back to the queue row, then to
/// the manager defaults. Built fluently:
///
/// ```
/// use stevedore::SendOptionsBuilder;
///
/// let opts = SendOptionsBuilder::default()
///     .priority(10)
///     .retry_limit(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Builder, Getters, Debug, Default, Clone)]
#[getset(get = "pub")]
#[builder(setter(strip_option, into), default, pattern = "owned")]
pub struct SendOptions {
    /// Job id; generated when absent. Supplying one makes enqueue idempotent.
    pub id: Option<Uuid>,
    /// Higher runs first; ties break on `created_on`.
    pub priority: Option<i32>,
    pub retry_limit: Option<i32>,
    /// Seconds between retries.
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    /// Defer eligibility; `send_after` fills this in.
    pub start_after: Option<DateTime<Utc>>,
    /// Collapse duplicate sends sharing this key.
    pub singleton_key: Option<String>,
    /// Width of the throttle/debounce time bucket, in seconds.
    pub singleton_seconds: Option<i32>,
    /// Offset added to now before bucketing; used to target the next bucket.
    pub singleton_offset: Option<i32>,
    /// Debounce: retry a first-bucket collision into the next bucket.
    pub singleton_next_slot: Option<bool>,
    /// Handler deadline override.
    pub expire_in: Option<Duration>,
    /// Archive cut-off override.
    pub keep_until: Option<DateTime<Utc>>,
}

/// One row of a bulk `insert` call. Unset fields take queue defaults.
#[derive(Serialize, Debug, Default, Clone)]
pub struct JobInsert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_until: Option<DateTime<Utc>>,
}

/// Result of a batched state transition (complete, fail, cancel, resume,
/// delete). `affected` counts rows actually transitioned; repeats and
/// invalid transitions show up as `affected < requested`.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Ids of the rows the transition touched.
    pub jobs: Vec<Uuid>,
    pub requested: usize,
    pub affected: u64,
}

/// Shape arbitrary completion data into the stored `output` column.
///
/// Objects pass through untouched; scalars and arrays are wrapped as
/// `{"value": …}`; explicit nulls store as null.
pub(crate) fn wrap_output(data: Option<Value>) -> Option<Value> {
    match data {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v),
        Some(other) => Some(json!({ "value": other })),
    }
}

/// Serialize a failure into a plain object: message plus the source chain.
pub(crate) fn error_payload(err: &(dyn std::error::Error + 'static)) -> Value {
    let mut cause = Vec::new();
    let mut current = err.source();
    while let Some(src) = current {
        cause.push(src.to_string());
        current = src.source();
    }

    if cause.is_empty() {
        json!({ "message": err.to_string() })
    } else {
        json!({ "message": err.to_string(), "cause": cause })
    }
}

/// Same shape as [`error_payload`] for failures that are already strings.
pub(crate) fn failure_payload(message: &str) -> Value {
    json!({ "message": message })
}
