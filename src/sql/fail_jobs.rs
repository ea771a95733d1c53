use indoc::formatdoc;
use serde_json::Value;
use sqlx::{query_scalar, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;

/// Fail jobs by id: jobs with retry budget left go to `retry` with a
/// recomputed `start_after`; exhausted jobs go terminal `failed` and, when
/// the queue names a dead-letter queue, a copy of the payload is enqueued
/// there as a fresh `created` job.
///
/// The retry decision compares the pre-increment `retry_count` against
/// `retry_limit`. Backoff doubles per attempt with jitter:
/// `retry_delay * 2 ^ least(16, retry_count) * (1 + random())` seconds.
pub(crate) fn fail_jobs_plan(schema: &str, table: &str) -> String {
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
                    output = $3::jsonb
                where name = $1
                  and id in (select unnest($2::uuid[]))
                  and state < 'completed'
                returning *
            ),
            dlq as (
                insert into {schema}.job (name, data, retry_limit, keep_until, policy)
                select r.dead_letter,
                       r.data,
                       r.retry_limit,
                       now() + coalesce(q.retention_minutes * interval '1 minute', interval '14 days'),
                       q.policy
                from results r
                join {schema}.queue q on q.name = r.dead_letter
                where r.state = 'failed'
                  and r.dead_letter is not null
                  and r.name <> r.dead_letter
                on conflict do nothing
            )
            select id from results
        "#
    )
}

pub(crate) async fn fail_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    ids: &[Uuid],
    output: Option<&Value>,
) -> Result<Vec<Uuid>> {
    let sql = fail_jobs_plan(schema, table);

    let failed = query_scalar(&sql)
        .bind(name)
        .bind(ids)
        .bind(output)
        .fetch_all(executor)
        .await?;

    Ok(failed)
}
