use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;
use crate::job::Job;
use crate::sql::JOB_COLUMNS;

pub(crate) fn get_job_by_id_plan(schema: &str, table: &str) -> String {
    formatdoc!(
        r#"
            select {JOB_COLUMNS}
            from {schema}.{table}
            where name = $1
              and id = $2
        "#
    )
}

/// The archive carries the same shape as the live table, so the same column
/// list applies.
pub(crate) fn get_archived_job_by_id_plan(schema: &str, table: &str) -> String {
    get_job_by_id_plan(schema, table)
}

pub(crate) async fn get_job_by_id<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    table: &str,
    name: &str,
    id: Uuid,
) -> Result<Option<Job>> {
    let sql = get_job_by_id_plan(schema, table);

    let job = query_as(&sql)
        .bind(name)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_selects_text_cast_state() {
        let plan = get_job_by_id_plan("stevedore", "job");
        assert!(plan.contains("state::text as state"));
        assert!(plan.contains("date_part('epoch', expire_in) as expire_in_seconds"));
    }
}
