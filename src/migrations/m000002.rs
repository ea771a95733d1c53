use super::Migration;

/// Adds the monitoring timestamp consulted by the state-count loop.
pub const M000002_MIGRATION: Migration = Migration {
    version: 2,
    previous: 1,
    install: &[
        r#"
            alter table :SCHEMA.version add column monitored_on timestamptz;
        "#,
    ],
    uninstall: &[
        r#"
            alter table :SCHEMA.version drop column monitored_on;
        "#,
    ],
};
