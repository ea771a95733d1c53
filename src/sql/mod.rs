//! Parameterized SQL for every queue and job operation.
//!
//! Plan functions are pure: given a schema (and for job operations a table,
//! normally [`JOB_TABLE`] — the partitioned parent), they return the SQL
//! text with positional parameters. The async functions beside them bind and
//! execute those plans. Nothing in this module keeps state.

pub(crate) mod complete_jobs;
pub(crate) mod fail_jobs;
pub(crate) mod fetch_next_job;
pub(crate) mod get_job;
pub(crate) mod insert_job;
pub(crate) mod job_updates;
pub(crate) mod maintenance;
pub(crate) mod queues;
pub(crate) mod subscriptions;

/// The partitioned parent table; inserts and updates route to the queue's
/// partition through it.
pub(crate) const JOB_TABLE: &str = "job";

/// Append-only mirror of archived jobs.
pub(crate) const ARCHIVE_TABLE: &str = "archive";

/// The full job column list selected by lookups and metadata fetches.
/// `state` is cast to text so rows decode without referencing the
/// schema-qualified enum type.
pub(crate) const JOB_COLUMNS: &str = "id, \
     name, \
     data, \
     date_part('epoch', expire_in) as expire_in_seconds, \
     state::text as state, \
     priority, \
     retry_limit, \
     retry_count, \
     retry_delay, \
     retry_backoff, \
     start_after, \
     started_on, \
     singleton_key, \
     singleton_on, \
     created_on, \
     completed_on, \
     keep_until, \
     output, \
     dead_letter, \
     policy";
