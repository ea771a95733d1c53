#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgConnectOptions;
use sqlx::{FromRow, PgPool};
use stevedore::ManagerOptions;
use uuid::Uuid;

/// A live job row, read straight from the schema for assertions.
#[derive(FromRow, Debug)]
pub struct JobRow {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    pub priority: i32,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub data: Option<Value>,
    pub output: Option<Value>,
    pub start_after: DateTime<Utc>,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub policy: Option<String>,
}

#[derive(Clone)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn create_manager_options(&self) -> ManagerOptions {
        stevedore::Manager::options()
            .pg_pool(self.test_pool.clone())
            .schema("stevedore")
    }

    pub async fn get_jobs(&self, queue: &str) -> Vec<JobRow> {
        sqlx::query_as(
            r#"
                select id, name, state::text as state, priority, retry_limit, retry_count,
                       data, output, start_after, singleton_key, singleton_on, completed_on, policy
                from stevedore.job
                where name = $1
                order by created_on, id
            "#,
        )
        .bind(queue)
        .fetch_all(&self.test_pool)
        .await
        .expect("Failed to get jobs")
    }

    pub async fn get_archived_jobs(&self, queue: &str) -> Vec<JobRow> {
        sqlx::query_as(
            r#"
                select id, name, state::text as state, priority, retry_limit, retry_count,
                       data, output, start_after, singleton_key, singleton_on, completed_on, policy
                from stevedore.archive
                where name = $1
                order by created_on, id
            "#,
        )
        .bind(queue)
        .fetch_all(&self.test_pool)
        .await
        .expect("Failed to get archived jobs")
    }

    /// Make queued jobs immediately eligible, ignoring retry backoff.
    pub async fn make_jobs_run_now(&self, queue: &str) {
        sqlx::query("update stevedore.job set start_after = now() where name = $1")
            .bind(queue)
            .execute(&self.test_pool)
            .await
            .expect("Failed to reset start_after");
    }

    pub async fn count_in_state(&self, queue: &str, state: &str) -> i64 {
        sqlx::query_scalar(
            "select count(*) from stevedore.job where name = $1 and state::text = $2",
        )
        .bind(queue)
        .bind(state)
        .fetch_one(&self.test_pool)
        .await
        .expect("Failed to count jobs")
    }
}

async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pg_conn_options: PgConnectOptions = db_url.parse().expect("Failed to parse DATABASE_URL");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = Uuid::new_v4();
    let db_name = format!("__test_stevedore_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let test_db = create_test_database().await;
    let test_db_2 = test_db.clone();

    let result = tokio::spawn(async move {
        test_fn(test_db_2).await;
    })
    .await;

    test_db.drop().await;
    result.expect("Test failed");
}
