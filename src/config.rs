use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::errors::{Error, Result};

/// Default schema holding every queue object.
pub const DEFAULT_SCHEMA: &str = "stevedore";

pub(crate) const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_ARCHIVE_COMPLETED_AFTER: Duration = Duration::from_secs(12 * 60 * 60);
pub(crate) const DEFAULT_DELETE_ARCHIVED_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Manager-level fallbacks applied when neither the send options nor the
/// queue row specify a value. Resolution happens inside the insert plan.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct JobDefaults {
    pub expire_in_seconds: Option<i32>,
    pub keep_until_seconds: Option<i32>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
}

/// Configuration for a [`Manager`](crate::Manager), built fluently:
///
/// ```no_run
/// use std::time::Duration;
/// use stevedore::Manager;
///
/// # async fn example() -> Result<(), stevedore::Error> {
/// let manager = Manager::options()
///     .database_url("postgres://postgres@localhost/app")
///     .schema("jobs")
///     .polling_interval(Duration::from_millis(500))
///     .retry_limit(3)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ManagerOptions {
    pub(crate) pg_pool: Option<PgPool>,
    pub(crate) database_url: Option<String>,
    pub(crate) max_connections: Option<u32>,
    pub(crate) schema: Option<String>,
    pub(crate) polling_interval: Option<Duration>,
    pub(crate) expire_in: Option<Duration>,
    pub(crate) keep_until: Option<Duration>,
    pub(crate) retry_limit: Option<i32>,
    pub(crate) retry_delay: Option<i32>,
    pub(crate) retry_backoff: Option<bool>,
    pub(crate) archive_completed_after: Option<Duration>,
    pub(crate) delete_archived_after: Option<Duration>,
    pub(crate) monitor_state_interval: Option<Duration>,
    pub(crate) test_throw_worker: bool,
}

impl ManagerOptions {
    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    pub fn max_connections(mut self, value: u32) -> Self {
        self.max_connections = Some(value);
        self
    }

    pub fn schema(mut self, value: &str) -> Self {
        self.schema = Some(value.into());
        self
    }

    /// Idle sleep between worker fetches when no notification arrives.
    pub fn polling_interval(mut self, value: Duration) -> Self {
        self.polling_interval = Some(value);
        self
    }

    /// Default handler deadline for queues that do not set one.
    pub fn expire_in(mut self, value: Duration) -> Self {
        self.expire_in = Some(value);
        self
    }

    /// Default retention before terminal jobs become archivable.
    pub fn keep_until(mut self, value: Duration) -> Self {
        self.keep_until = Some(value);
        self
    }

    pub fn retry_limit(mut self, value: i32) -> Self {
        self.retry_limit = Some(value);
        self
    }

    /// Seconds between retries, unless the queue or send overrides it.
    pub fn retry_delay(mut self, value: i32) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn retry_backoff(mut self, value: bool) -> Self {
        self.retry_backoff = Some(value);
        self
    }

    /// How long completed jobs stay live before the archive sweep moves them.
    pub fn archive_completed_after(mut self, value: Duration) -> Self {
        self.archive_completed_after = Some(value);
        self
    }

    /// How long archived rows are kept before deletion.
    pub fn delete_archived_after(mut self, value: Duration) -> Self {
        self.delete_archived_after = Some(value);
        self
    }

    /// Cadence embedders should run `monitor()` at; recorded for them, not
    /// scheduled by the manager.
    pub fn monitor_state_interval(mut self, value: Duration) -> Self {
        self.monitor_state_interval = Some(value);
        self
    }

    /// Makes every worker fetch report a synthetic failure. Exists to test
    /// the error-event path.
    #[doc(hidden)]
    #[allow(non_snake_case)]
    pub fn __test__throw_worker(mut self, value: bool) -> Self {
        self.test_throw_worker = value;
        self
    }

    pub(crate) async fn resolve_pool(&mut self) -> Result<PgPool> {
        if let Some(pool) = self.pg_pool.take() {
            return Ok(pool);
        }

        let url = self
            .database_url
            .take()
            .ok_or_else(|| Error::validation("either pg_pool or database_url is required"))?;

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .connect(&url)
            .await?;

        Ok(pool)
    }

    pub(crate) fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            expire_in_seconds: self.expire_in.map(|d| d.as_secs() as i32),
            keep_until_seconds: self.keep_until.map(|d| d.as_secs() as i32),
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
        }
    }

    /// Connect, migrate the schema if needed, and start the manager.
    pub async fn connect(self) -> Result<crate::Manager> {
        crate::Manager::connect_with(self).await
    }
}

/// A schema identifier ends up interpolated into DDL, so it is held to a
/// strict shape instead of being escaped.
pub(crate) fn assert_valid_schema(schema: &str) -> Result<()> {
    let mut chars = schema.chars();

    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);

    if !valid_start
        || !schema
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        || schema.len() > 50
    {
        return Err(Error::validation(format!(
            "schema '{schema}' must match [a-z_][a-z0-9_]* and be at most 50 characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_strict() {
        assert!(assert_valid_schema("stevedore").is_ok());
        assert!(assert_valid_schema("_private").is_ok());
        assert!(assert_valid_schema("jobs_2").is_ok());

        assert!(assert_valid_schema("").is_err());
        assert!(assert_valid_schema("1jobs").is_err());
        assert!(assert_valid_schema("Jobs").is_err());
        assert!(assert_valid_schema("jobs;drop").is_err());
        assert!(assert_valid_schema(&"x".repeat(51)).is_err());
    }

    #[test]
    fn defaults_convert_to_seconds() {
        let opts = ManagerOptions::default()
            .expire_in(Duration::from_secs(90))
            .keep_until(Duration::from_secs(3600));

        let defaults = opts.job_defaults();
        assert_eq!(defaults.expire_in_seconds, Some(90));
        assert_eq!(defaults.keep_until_seconds, Some(3600));
        assert_eq!(defaults.retry_limit, None);
    }
}
