use indoc::formatdoc;
use sqlx::{query, query_scalar, PgExecutor};

use crate::errors::Result;

pub(crate) fn subscribe_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            insert into {schema}.subscription (event, name)
            values ($1, $2)
            on conflict (event, name) do update set updated_on = now()
        "#
    )
}

pub(crate) fn unsubscribe_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            delete from {schema}.subscription
            where event = $1
              and name = $2
        "#
    )
}

pub(crate) fn get_queues_for_event_plan(schema: &str) -> String {
    formatdoc!(
        r#"
            select name
            from {schema}.subscription
            where event = $1
        "#
    )
}

pub(crate) async fn subscribe<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    event: &str,
    name: &str,
) -> Result<()> {
    let sql = subscribe_plan(schema);

    query(&sql).bind(event).bind(name).execute(executor).await?;

    Ok(())
}

pub(crate) async fn unsubscribe<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    event: &str,
    name: &str,
) -> Result<u64> {
    let sql = unsubscribe_plan(schema);

    let done = query(&sql).bind(event).bind(name).execute(executor).await?;

    Ok(done.rows_affected())
}

pub(crate) async fn get_queues_for_event<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    event: &str,
) -> Result<Vec<String>> {
    let sql = get_queues_for_event_plan(schema);

    let names = query_scalar(&sql).bind(event).fetch_all(executor).await?;

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_an_upsert() {
        let plan = subscribe_plan("stevedore");
        assert!(plan.contains("on conflict (event, name) do update"));
    }
}
