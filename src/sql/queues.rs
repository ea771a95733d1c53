use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::{query, query_as, query_scalar, PgExecutor};

use crate::errors::Result;
use crate::queue::{Queue, QueueOptions};

const QUEUE_COLUMNS: &str = "name, \
     policy, \
     retry_limit, \
     retry_delay, \
     retry_backoff, \
     expire_seconds, \
     retention_minutes, \
     dead_letter, \
     created_on, \
     updated_on";

/// Queue creation is delegated to the `create_queue(text, json)` function
/// installed with the schema: it inserts the metadata row, creates the
/// queue's partition with the policy unique indexes, and attaches it.
pub(crate) fn create_queue_plan(schema: &str) -> String {
    format!("select {schema}.create_queue($1, $2::json)")
}

/// `delete_queue(text)` detaches and drops the partition, then removes the
/// metadata row.
pub(crate) fn delete_queue_plan(schema: &str) -> String {
    format!("select {schema}.delete_queue($1)")
}

pub(crate) fn update_queue_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            update {schema}.queue
            set policy = coalesce($2, policy),
                retry_limit = coalesce($3, retry_limit),
                retry_delay = coalesce($4, retry_delay),
                retry_backoff = coalesce($5, retry_backoff),
                expire_seconds = coalesce($6, expire_seconds),
                retention_minutes = coalesce($7, retention_minutes),
                dead_letter = coalesce($8, dead_letter),
                updated_on = now()
            where name = $1
        "#
    )
}

pub(crate) fn get_queue_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            select {QUEUE_COLUMNS}
            from {schema}.queue
            where name = $1
        "#
    )
}

pub(crate) fn get_queues_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            select {QUEUE_COLUMNS}
            from {schema}.queue
            order by name
        "#
    )
}

/// Count jobs that have not reached a terminal state, optionally only those
/// eligible before a cut-off.
pub(crate) fn get_queue_size_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            select count(*)
            from {schema}.{table}
            where name = $1
              and state < 'completed'
              and start_after < coalesce($2::timestamptz, 'infinity')
        "#
    )
}

/// Drop queued (not yet active) jobs from the queue's partition.
pub(crate) fn purge_queue_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            delete from {schema}.{table}
            where name = $1
              and state < 'active'
        "#
    )
}

pub(crate) async fn create_queue<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    name: &str,
    options: &QueueOptions,
) -> Result<()> {
    let sql = create_queue_plan(schema);
    let options = serde_json::to_value(options)?;

    query(&sql).bind(name).bind(options).execute(executor).await?;

    Ok(())
}

pub(crate) async fn update_queue<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    name: &str,
    options: &QueueOptions,
) -> Result<u64> {
    let sql = update_queue_plan(schema);

    let done = query(&sql)
        .bind(name)
        .bind(options.policy.map(|p| p.to_string()))
        .bind(options.retry_limit)
        .bind(options.retry_delay)
        .bind(options.retry_backoff)
        .bind(options.expire_in_seconds)
        .bind(options.retention_minutes)
        .bind(options.dead_letter.as_deref())
        .execute(executor)
        .await?;

    Ok(done.rows_affected())
}

pub(crate) async fn delete_queue<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    name: &str,
) -> Result<()> {
    let sql = delete_queue_plan(schema);

    query(&sql).bind(name).execute(executor).await?;

    Ok(())
}

pub(crate) async fn get_queue<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    name: &str,
) -> Result<Option<Queue>> {
    let sql = get_queue_plan(schema);

    let queue = query_as(&sql).bind(name).fetch_optional(executor).await?;

    Ok(queue)
}

pub(crate) async fn get_queues<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
) -> Result<Vec<Queue>> {
    let sql = get_queues_plan(schema);

    let queues = query_as(&sql).fetch_all(executor).await?;

    Ok(queues)
}

pub(crate) async fn get_queue_size<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    before: Option<DateTime<Utc>>,
) -> Result<i64> {
    let sql = get_queue_size_plan(schema, table);

    let size = query_scalar(&sql)
        .bind(name)
        .bind(before)
        .fetch_one(executor)
        .await?;

    Ok(size)
}

pub(crate) async fn purge_queue<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
) -> Result<u64> {
    let sql = purge_queue_plan(schema, table);

    let done = query(&sql).bind(name).execute(executor).await?;

    Ok(done.rows_affected())
}
