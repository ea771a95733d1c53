use indoc::formatdoc;
use sqlx::{query, query_as, PgExecutor};

use crate::errors::Result;

/// Failure message recorded when the expiry sweep reaps an active job whose
/// claim outlived its deadline.
pub(crate) const EXPIRED_MESSAGE: &str = "job failed by timeout in active state";

/// Fail `active` jobs whose claim aged past `started_on + expire_in`,
/// applying the same retry-or-terminal decision as an explicit fail.
pub(crate) fn fail_expired_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with results as (
                update {schema}.{table}
                set state = (case
                        when retry_count < retry_limit then 'retry'
                        else 'failed'
                    end)::{schema}.job_state,
                    completed_on = case
                        when retry_count < retry_limit then null
                        else now()
                    end,
                    start_after = case
                        when retry_count >= retry_limit then start_after
                        when not retry_backoff then now() + retry_delay * interval '1 second'
                        else now() + retry_delay * 2 ^ least(16, retry_count)
                             * (1 + random()) * interval '1 second'
                    end,
                    retry_count = retry_count + 1,
                    output = jsonb_build_object('message', '{EXPIRED_MESSAGE}')
                where state = 'active'
                  and started_on + expire_in < now()
                returning id
            )
            select count(*) from results
        "#
    )
}

/// Move terminal jobs past their retention into the archive, and sweep
/// stale never-fetched jobs whose `keep_until` elapsed. The archive row is
/// sealed with `archived_on = now()` by its column default.
pub(crate) fn archive_jobs_plan(schema: &str, table: &str, archive_table: &str) -> String {
    formatdoc!(
        r#"
            with archived as (
                delete from {schema}.{table}
                where (state >= 'completed' and completed_on + $1::int * interval '1 second' < now())
                   or (state = 'created' and keep_until < now())
                returning id, name, priority, data, state, retry_limit, retry_count,
                          retry_delay, retry_backoff, start_after, started_on,
                          singleton_key, singleton_on, expire_in, created_on,
                          completed_on, keep_until, output, dead_letter, policy
            )
            insert into {schema}.{archive_table} (
                id, name, priority, data, state, retry_limit, retry_count,
                retry_delay, retry_backoff, start_after, started_on,
                singleton_key, singleton_on, expire_in, created_on,
                completed_on, keep_until, output, dead_letter, policy
            )
            select id, name, priority, data, state, retry_limit, retry_count,
                   retry_delay, retry_backoff, start_after, started_on,
                   singleton_key, singleton_on, expire_in, created_on,
                   completed_on, keep_until, output, dead_letter, policy
            from archived
        "#
    )
}

/// Drop archive rows older than the archive retention window.
pub(crate) fn drop_archived_jobs_plan(schema: &str, archive_table: &str) -> String {
    formatdoc!(
        r#"
            delete from {schema}.{archive_table}
            where archived_on < now() - $1::int * interval '1 second'
        "#
    )
}

/// Per-queue, per-state counts for the monitoring loop; stamps
/// `monitored_on` as a side effect.
pub(crate) fn monitor_states_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with stamped as (
                update {schema}.version set monitored_on = now()
            )
            select name, state::text as state, count(*) as size
            from {schema}.{table}
            group by name, state
        "#
    )
}

/// One row of monitor output.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct StateCount {
    pub name: String,
    pub state: String,
    pub size: i64,
}

pub(crate) async fn fail_expired_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
) -> Result<i64> {
    let sql = fail_expired_jobs_plan(schema, table);

    let count: i64 = sqlx::query_scalar(&sql).fetch_one(executor).await?;

    Ok(count)
}

pub(crate) async fn archive_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    archive_table: &str,
    completed_after_seconds: i32,
) -> Result<u64> {
    let sql = archive_jobs_plan(schema, table, archive_table);

    let done = query(&sql)
        .bind(completed_after_seconds)
        .execute(executor)
        .await?;

    Ok(done.rows_affected())
}

pub(crate) async fn drop_archived_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    archive_table: &str,
    older_than_seconds: i32,
) -> Result<u64> {
    let sql = drop_archived_jobs_plan(schema, archive_table);

    let done = query(&sql).bind(older_than_seconds).execute(executor).await?;

    Ok(done.rows_affected())
}

pub(crate) async fn monitor_states<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
) -> Result<Vec<StateCount>> {
    let sql = monitor_states_plan(schema, table);

    let counts = query_as(&sql).fetch_all(executor).await?;

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_measures_from_claim_time() {
        let plan = fail_expired_jobs_plan("stevedore", "job");
        assert!(plan.contains("started_on + expire_in < now()"));
        assert!(plan.contains(EXPIRED_MESSAGE));
    }

    #[test]
    fn archive_moves_terminal_and_stale_created() {
        let plan = archive_jobs_plan("stevedore", "job", "archive");
        assert!(plan.contains("state >= 'completed'"));
        assert!(plan.contains("state = 'created'"));
        assert!(plan.contains("insert into stevedore.archive"));
    }
}
