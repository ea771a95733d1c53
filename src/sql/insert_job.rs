use indoc::formatdoc;
use serde_json::Value;
use sqlx::{query_scalar, PgExecutor};
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::errors::Result;
use crate::job::{JobInsert, SendOptions};

/// Insert one job, resolving every unset option against the queue row and
/// then the manager defaults.
///
/// Positional parameters, in order: id, name, data, priority, start_after,
/// singleton_key, singleton_seconds, singleton_offset, expire_in,
/// expire_in_default, keep_until, keep_until_default, retry_limit,
/// retry_limit_default, retry_delay, retry_delay_default, retry_backoff,
/// retry_backoff_default.
///
/// Returns zero rows on a unique-index collision (`on conflict do nothing`);
/// the caller treats that as a dropped duplicate, not an error. When
/// `singleton_seconds` is set, `singleton_on` is the enclosing time bucket:
/// `floor((epoch(now()) + offset) / seconds) * seconds`.
pub(crate) fn insert_job_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with q as (
                select name, policy, retry_limit, retry_delay, retry_backoff,
                       expire_seconds, retention_minutes, dead_letter
                from {schema}.queue
                where name = $2
            )
            insert into {schema}.{table} (
                id, name, data, priority, start_after, singleton_key, singleton_on,
                expire_in, keep_until, retry_limit, retry_delay, retry_backoff,
                dead_letter, policy
            )
            select
                coalesce($1::uuid, gen_random_uuid()),
                q.name,
                $3::jsonb,
                coalesce($4::int, 0),
                coalesce($5::timestamptz, now()),
                $6::text,
                case
                    when $7::int is not null
                    then 'epoch'::timestamptz + interval '1 second'
                         * ($7 * floor((date_part('epoch', now()) + coalesce($8::int, 0)) / $7))
                end,
                coalesce($9::int * interval '1 second',
                         q.expire_seconds * interval '1 second',
                         $10::int * interval '1 second',
                         interval '15 minutes'),
                coalesce($11::timestamptz,
                         now() + coalesce(q.retention_minutes * interval '1 minute',
                                          $12::int * interval '1 second',
                                          interval '14 days')),
                coalesce($13::int, q.retry_limit, $14::int, 2),
                coalesce($15::int, q.retry_delay, $16::int, 0),
                coalesce($17::bool, q.retry_backoff, $18::bool, false),
                q.dead_letter,
                q.policy
            from q
            on conflict do nothing
            returning id
        "#
    )
}

/// Bulk insert from a JSON array of rows; per-row overrides fall back to the
/// queue configuration, then the manager defaults.
pub(crate) fn insert_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with q as (
                select name, policy, retry_limit, retry_delay, retry_backoff,
                       expire_seconds, retention_minutes, dead_letter
                from {schema}.queue
                where name = $1
            )
            insert into {schema}.{table} (
                id, name, data, priority, start_after, singleton_key,
                expire_in, keep_until, retry_limit, retry_delay, retry_backoff,
                dead_letter, policy
            )
            select
                coalesce(j.id, gen_random_uuid()),
                q.name,
                j.data,
                coalesce(j.priority, 0),
                coalesce(j.start_after, now()),
                j.singleton_key,
                coalesce(j.expire_in_seconds * interval '1 second',
                         q.expire_seconds * interval '1 second',
                         $3::int * interval '1 second',
                         interval '15 minutes'),
                coalesce(j.keep_until,
                         now() + coalesce(q.retention_minutes * interval '1 minute',
                                          $4::int * interval '1 second',
                                          interval '14 days')),
                coalesce(j.retry_limit, q.retry_limit, $5::int, 2),
                coalesce(j.retry_delay, q.retry_delay, $6::int, 0),
                coalesce(j.retry_backoff, q.retry_backoff, $7::bool, false),
                q.dead_letter,
                q.policy
            from jsonb_to_recordset($2::jsonb) as j (
                id uuid,
                data jsonb,
                priority int,
                retry_limit int,
                retry_delay int,
                retry_backoff bool,
                start_after timestamptz,
                singleton_key text,
                expire_in_seconds int,
                keep_until timestamptz
            )
            cross join q
            on conflict do nothing
            returning id
        "#
    )
}

pub(crate) async fn insert_job<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    data: Option<&Value>,
    opts: &SendOptions,
    defaults: &JobDefaults,
) -> Result<Option<Uuid>> {
    let sql = insert_job_plan(schema, table);

    let id = query_scalar(&sql)
        .bind(opts.id)
        .bind(name)
        .bind(data)
        .bind(opts.priority)
        .bind(opts.start_after)
        .bind(opts.singleton_key.as_deref())
        .bind(opts.singleton_seconds)
        .bind(opts.singleton_offset)
        .bind(opts.expire_in.map(|d| d.as_secs() as i32))
        .bind(defaults.expire_in_seconds)
        .bind(opts.keep_until)
        .bind(defaults.keep_until_seconds)
        .bind(opts.retry_limit)
        .bind(defaults.retry_limit)
        .bind(opts.retry_delay)
        .bind(defaults.retry_delay)
        .bind(opts.retry_backoff)
        .bind(defaults.retry_backoff)
        .fetch_optional(executor)
        .await?;

    Ok(id)
}

pub(crate) async fn insert_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    jobs: &[JobInsert],
    defaults: &JobDefaults,
) -> Result<Vec<Uuid>> {
    let sql = insert_jobs_plan(schema, table);
    let rows = serde_json::to_value(jobs)?;

    let ids = query_scalar(&sql)
        .bind(name)
        .bind(rows)
        .bind(defaults.expire_in_seconds)
        .bind(defaults.keep_until_seconds)
        .bind(defaults.retry_limit)
        .bind(defaults.retry_delay)
        .bind(defaults.retry_backoff)
        .fetch_all(executor)
        .await?;

    Ok(ids)
}

/// Seconds until the next singleton bucket boundary, from a skew-adjusted
/// epoch. Always at least 1, and padded by one extra second for buckets
/// wider than a second so a send landing exactly on the boundary cannot
/// alias back into the closing bucket.
pub(crate) fn debounce_start_after(singleton_seconds: i32, adjusted_epoch_ms: i64) -> i32 {
    let seconds = i64::from(singleton_seconds);
    let epoch = adjusted_epoch_ms / 1000;
    let slot = epoch / seconds * seconds;
    let mut start_after = seconds - (epoch - slot) - 1;
    if seconds > 1 {
        start_after += 1;
    }
    start_after.max(1) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_plan_has_all_eighteen_parameters() {
        let plan = insert_job_plan("stevedore", "job");
        for n in 1..=18 {
            assert!(plan.contains(&format!("${n}")), "missing parameter ${n}");
        }
        assert!(!plan.contains("$19"));
        assert!(plan.contains("on conflict do nothing"));
        assert!(plan.contains("returning id"));
    }

    #[test]
    fn insert_plan_buckets_singleton_on() {
        let plan = insert_job_plan("stevedore", "job");
        assert!(plan.contains("floor((date_part('epoch', now()) + coalesce($8::int, 0)) / $7)"));
    }

    #[test]
    fn debounce_lands_in_next_bucket() {
        // 10 s buckets, 3 s into the bucket: 10 - 3 - 1 + 1 = 7 s to boundary.
        assert_eq!(debounce_start_after(10, 13_000), 7);
        // Exactly on a boundary the padding keeps us out of the closing bucket.
        assert_eq!(debounce_start_after(10, 20_000), 10);
        // 1 s buckets never pad but still wait at least a second.
        assert_eq!(debounce_start_after(1, 5_500), 1);
    }

    #[test]
    fn debounce_start_after_is_at_least_one() {
        for epoch_ms in [0, 999, 9_999, 19_999] {
            assert!(debounce_start_after(10, epoch_ms) >= 1);
        }
    }
}
