use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Claim up to `limit` eligible jobs under row locks and mark them active.
///
/// Eligible means `state < 'active'` (created or retry) and `start_after`
/// reached. Contending workers skip each other's rows via
/// `for update skip locked`; the chosen rows are updated to `active` with
/// `started_on = now()` in the same statement and returned in claim order.
pub(crate) fn fetch_next_job_plan(
    schema: &str,
    table: &str,
    priority: bool,
    include_metadata: bool,
) -> String {
    let order = if priority {
        "priority desc, created_on, id"
    } else {
        "created_on, id"
    };

    let output = if include_metadata {
        "j.id, \
         j.name, \
         j.data, \
         date_part('epoch', j.expire_in) as expire_in_seconds, \
         j.state::text as state, \
         j.priority, \
         j.retry_limit, \
         j.retry_count, \
         j.retry_delay, \
         j.retry_backoff, \
         j.start_after, \
         j.started_on, \
         j.singleton_key, \
         j.singleton_on, \
         j.created_on, \
         j.completed_on, \
         j.keep_until, \
         j.output, \
         j.dead_letter, \
         j.policy"
    } else {
        "j.id, \
         j.name, \
         j.data, \
         date_part('epoch', j.expire_in) as expire_in_seconds, \
         null::text as state, \
         null::int as priority, \
         null::int as retry_limit, \
         null::int as retry_count, \
         null::int as retry_delay, \
         null::bool as retry_backoff, \
         null::timestamptz as start_after, \
         null::timestamptz as started_on, \
         null::text as singleton_key, \
         null::timestamptz as singleton_on, \
         null::timestamptz as created_on, \
         null::timestamptz as completed_on, \
         null::timestamptz as keep_until, \
         null::jsonb as output, \
         null::text as dead_letter, \
         null::text as policy"
    };

    // The outer select re-sorts because UPDATE .. RETURNING does not
    // preserve the claim order of the locking CTE.
    formatdoc!(
        r#"
            with next as (
                select id
                from {schema}.{table}
                where name = $1
                  and state < 'active'
                  and start_after <= now()
                order by {order}
                limit $2
                for update skip locked
            ),
            claimed as (
                update {schema}.{table} j
                set state = 'active',
                    started_on = now()
                from next
                where j.name = $1
                  and j.id = next.id
                returning j.*
            )
            select {output}
            from claimed j
            order by {order}
        "#
    )
}

pub(crate) async fn fetch_next_job<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    limit: i64,
    priority: bool,
    include_metadata: bool,
) -> Result<Vec<Job>> {
    let sql = fetch_next_job_plan(schema, table, priority, include_metadata);

    let jobs = query_as(&sql)
        .bind(name)
        .bind(limit)
        .fetch_all(executor)
        .await?;

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_under_skip_locked() {
        let plan = fetch_next_job_plan("stevedore", "job", true, false);
        assert!(plan.contains("for update skip locked"));
        assert!(plan.contains("state < 'active'"));
        assert!(plan.contains("order by priority desc, created_on, id"));
        assert!(plan.contains("started_on = now()"));
    }

    #[test]
    fn priority_ordering_is_optional() {
        let plan = fetch_next_job_plan("stevedore", "job", false, false);
        assert!(plan.contains("order by created_on, id"));
        assert!(!plan.contains("priority desc"));
    }

    #[test]
    fn metadata_toggles_column_list() {
        let lean = fetch_next_job_plan("stevedore", "job", true, false);
        assert!(lean.contains("null::text as state"));

        let full = fetch_next_job_plan("stevedore", "job", true, true);
        assert!(full.contains("j.state::text as state"));
        assert!(full.contains("j.singleton_on"));
    }
}
