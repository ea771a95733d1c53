use indoc::formatdoc;
use serde_json::Value;
use sqlx::{query_scalar, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;

/// Move `active` jobs to `completed`, stamping `completed_on` and storing
/// the handler output. Jobs in any other state are untouched, which makes
/// the operation idempotent: repeating it reports zero affected rows.
pub(crate) fn complete_jobs_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            with results as (
                update {schema}.{table}
                set state = 'completed',
                    completed_on = now(),
                    output = $3::jsonb
                where name = $1
                  and id in (select unnest($2::uuid[]))
                  and state = 'active'
                returning id
            )
            select id from results
        "#
    )
}

pub(crate) async fn complete_jobs<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    ids: &[Uuid],
    output: Option<&Value>,
) -> Result<Vec<Uuid>> {
    let sql = complete_jobs_plan(schema, table);

    let completed = query_scalar(&sql)
        .bind(name)
        .bind(ids)
        .bind(output)
        .fetch_all(executor)
        .await?;

    Ok(completed)
}
