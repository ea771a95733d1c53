use super::Migration;

/// Event subscriptions for publish fan-out.
pub const M000003_MIGRATION: Migration = Migration {
    version: 3,
    previous: 2,
    install: &[
        r#"
            create table :SCHEMA.subscription (
                event text not null,
                name text not null references :SCHEMA.queue (name) on delete cascade,
                created_on timestamptz not null default now(),
                updated_on timestamptz not null default now(),
                primary key (event, name)
            );
        "#,
    ],
    uninstall: &[
        r#"
            drop table :SCHEMA.subscription;
        "#,
    ],
};
