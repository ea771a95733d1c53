use indoc::formatdoc;
use sqlx::{query_scalar, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;

/// Cancel jobs that have not yet reached a terminal state.
pub(crate) fn cancel_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with results as (
                update {schema}.{table}
                set state = 'cancelled',
                    completed_on = now()
                where name = $1
                  and id in (select unnest($2::uuid[]))
                  and state < 'completed'
                returning id
            )
            select id from results
        "#
    )
}

/// Put terminal jobs (completed, cancelled or failed) back to `created`.
/// Jobs already swept into the archive are out of reach.
pub(crate) fn resume_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with results as (
                update {schema}.{table}
                set state = 'created',
                    completed_on = null,
                    started_on = null
                where name = $1
                  and id in (select unnest($2::uuid[]))
                  and state > 'active'
                returning id
            )
            select id from results
        "#
    )
}

/// Remove jobs from the live table outright, whatever their state.
pub(crate) fn delete_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with results as (
                delete from {schema}.{table}
                where name = $1
                  and id in (select unnest($2::uuid[]))
                returning id
            )
            select id from results
        "#
    )
}

pub(crate) async fn run_ids_plan<'e>(
    executor: impl PgExecutor<'e>,
    sql: &str,
    name: &str,
    ids: &[Uuid],
) -> Result<Vec<Uuid>> {
    let affected = query_scalar(sql)
        .bind(name)
        .bind(ids)
        .fetch_all(executor)
        .await?;

    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_skips_terminal_states() {
        let plan = cancel_jobs_plan("stevedore", "job");
        assert!(plan.contains("state < 'completed'"));
        assert!(plan.contains("state = 'cancelled'"));
    }

    #[test]
    fn resume_only_touches_terminal_states() {
        let plan = resume_jobs_plan("stevedore", "job");
        assert!(plan.contains("state > 'active'"));
        assert!(plan.contains("state = 'created'"));
        assert!(plan.contains("completed_on = null"));
    }
}
