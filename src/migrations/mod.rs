//! Versioned linear schema evolution.
//!
//! Migrations form a chain: each entry declares the version it produces,
//! the version it starts from, and paired `install` / `uninstall`
//! statement lists. Every statement is its own array element — plans are
//! concatenated, never spliced. A plan executes inside one transaction
//! that holds a schema-scoped advisory lock and first asserts the stored
//! version matches the plan's source, so concurrent migrators serialize
//! and stale ones fail with a version mismatch instead of corrupting the
//! schema.

mod m000001;
mod m000002;
mod m000003;

use indoc::formatdoc;
use sqlx::{query, query_scalar, PgPool};
use tracing::info;

use crate::errors::{Error, Result};

use m000001::M000001_MIGRATION;
use m000002::M000002_MIGRATION;
use m000003::M000003_MIGRATION;

/// Placeholder replaced with the configured schema in every statement.
const SCHEMA_PLACEHOLDER: &str = ":SCHEMA";

/// The version a fully-migrated schema reports.
pub const CURRENT_VERSION: i32 = 3;

/// One hop in the migration chain.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub previous: i32,
    pub install: &'static [&'static str],
    pub uninstall: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    M000001_MIGRATION,
    M000002_MIGRATION,
    M000003_MIGRATION,
];

/// A resolved sequence of statements taking the schema from `source` to
/// `target`, with the schema name already substituted.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub source: i32,
    pub target: i32,
    pub statements: Vec<String>,
}

fn substitute(statements: &[&str], schema: &str) -> Vec<String> {
    statements
        .iter()
        .map(|s| s.replace(SCHEMA_PLACEHOLDER, schema))
        .collect()
}

/// The single forward hop out of `current`.
pub fn next(schema: &str, current: i32) -> Result<MigrationPlan> {
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.previous == current)
        .ok_or_else(|| Error::not_found(format!("no migration from version {current}")))?;

    Ok(MigrationPlan {
        source: current,
        target: migration.version,
        statements: substitute(migration.install, schema),
    })
}

/// The single backward hop undoing `current`.
pub fn rollback(schema: &str, current: i32) -> Result<MigrationPlan> {
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == current)
        .ok_or_else(|| Error::not_found(format!("no migration at version {current}")))?;

    Ok(MigrationPlan {
        source: current,
        target: migration.previous,
        statements: substitute(migration.uninstall, schema),
    })
}

/// Every forward hop whose `previous` is at or past `from`, ascending,
/// concatenated into one plan targeting the highest version.
pub fn migrate_plan(schema: &str, from: i32) -> Result<MigrationPlan> {
    let mut pending: Vec<&Migration> =
        MIGRATIONS.iter().filter(|m| m.previous >= from).collect();
    pending.sort_by_key(|m| m.version);

    let target = pending
        .last()
        .map(|m| m.version)
        .ok_or_else(|| Error::not_found(format!("no migration past version {from}")))?;

    let statements = pending
        .iter()
        .flat_map(|m| substitute(m.install, schema))
        .collect();

    Ok(MigrationPlan {
        source: from,
        target,
        statements,
    })
}

fn advisory_lock_sql() -> &'static str {
    "select pg_advisory_xact_lock(('x' || md5(current_database() || '.stevedore.' || $1))::bit(64)::bigint)"
}

/// Create the schema and version table if absent, seeding version 0 so the
/// chain has a source to assert against.
async fn bootstrap(pool: &PgPool, schema: &str) -> Result<()> {
    let statements = [
        format!("create schema if not exists {schema}"),
        formatdoc!(
            r#"
                create table if not exists {schema}.version (
                    version int primary key
                )
            "#
        ),
        format!(
            "insert into {schema}.version (version) select 0 \
             where not exists (select 1 from {schema}.version)"
        ),
    ];

    let mut tx = pool.begin().await?;
    for statement in &statements {
        query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Execute a plan: advisory lock, version assertion, statements, bump.
pub async fn apply(pool: &PgPool, schema: &str, plan: &MigrationPlan) -> Result<()> {
    let mut tx = pool.begin().await?;

    query(advisory_lock_sql())
        .bind(schema)
        .execute(&mut *tx)
        .await?;

    let found: i32 = query_scalar(&format!("select version from {schema}.version"))
        .fetch_one(&mut *tx)
        .await?;

    if found != plan.source {
        return Err(Error::VersionMismatch {
            expected: plan.source,
            found,
        });
    }

    for statement in &plan.statements {
        query(statement).execute(&mut *tx).await?;
    }

    query(&format!("update {schema}.version set version = $1"))
        .bind(plan.target)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Bring the schema to [`CURRENT_VERSION`], installing from scratch when
/// the schema does not exist yet.
pub async fn migrate(pool: &PgPool, schema: &str) -> Result<()> {
    bootstrap(pool, schema).await?;

    let stored: i32 = query_scalar(&format!("select version from {schema}.version"))
        .fetch_one(pool)
        .await?;

    if stored == CURRENT_VERSION {
        return Ok(());
    }

    if stored > CURRENT_VERSION {
        return Err(Error::VersionMismatch {
            expected: CURRENT_VERSION,
            found: stored,
        });
    }

    let plan = migrate_plan(schema, stored)?;
    info!(from = stored, to = plan.target, "Migrating schema");
    apply(pool, schema, &plan).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_linear_and_contiguous() {
        let mut versions: Vec<i32> = MIGRATIONS.iter().map(|m| m.version).collect();
        versions.sort_unstable();
        for (i, v) in versions.iter().enumerate() {
            assert_eq!(*v, i as i32 + 1);
        }
        for m in MIGRATIONS {
            assert_eq!(m.previous, m.version - 1);
            assert!(!m.install.is_empty());
            assert!(!m.uninstall.is_empty());
        }
        assert_eq!(versions.last().copied(), Some(CURRENT_VERSION));
    }

    #[test]
    fn next_finds_the_forward_hop() {
        let plan = next("qa", 1).unwrap();
        assert_eq!(plan.source, 1);
        assert_eq!(plan.target, 2);
        assert!(plan.statements[0].contains("qa.version"));

        assert!(matches!(
            next("qa", CURRENT_VERSION),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rollback_targets_the_previous_version() {
        let plan = rollback("qa", 3).unwrap();
        assert_eq!(plan.source, 3);
        assert_eq!(plan.target, 2);
        assert!(plan.statements[0].contains("drop table qa.subscription"));

        assert!(matches!(rollback("qa", 99), Err(Error::NotFound(_))));
    }

    #[test]
    fn migrate_plan_concatenates_ascending() {
        let plan = migrate_plan("qa", 0).unwrap();
        assert_eq!(plan.source, 0);
        assert_eq!(plan.target, CURRENT_VERSION);

        let monitored = plan
            .statements
            .iter()
            .position(|s| s.contains("monitored_on"))
            .unwrap();
        let subscription = plan
            .statements
            .iter()
            .position(|s| s.contains("create table qa.subscription"))
            .unwrap();
        assert!(monitored < subscription);
    }

    #[test]
    fn migrate_plan_from_mid_chain_skips_applied_hops() {
        let plan = migrate_plan("qa", 1).unwrap();
        assert!(!plan
            .statements
            .iter()
            .any(|s| s.contains("create table qa.job ")));
        assert!(plan.statements.iter().any(|s| s.contains("monitored_on")));
    }

    #[test]
    fn no_statement_keeps_the_placeholder() {
        let plan = migrate_plan("qa", 0).unwrap();
        for statement in &plan.statements {
            assert!(!statement.contains(SCHEMA_PLACEHOLDER));
        }
    }
}
