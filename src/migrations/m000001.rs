use super::Migration;

/// Baseline schema: the job state enum, queue registry, partitioned job
/// table, archive mirror, and the partition-management functions. The
/// `version` table itself is created by the bootstrap step so the chain has
/// something to assert against.
pub const M000001_MIGRATION: Migration = Migration {
    version: 1,
    previous: 0,
    install: &[
        r#"
            create type :SCHEMA.job_state as enum (
                'created',
                'retry',
                'active',
                'completed',
                'cancelled',
                'failed'
            );
        "#,
        r#"
            create table :SCHEMA.queue (
                name text primary key,
                policy text not null default 'standard',
                retry_limit int,
                retry_delay int,
                retry_backoff bool,
                expire_seconds int,
                retention_minutes int,
                dead_letter text references :SCHEMA.queue (name),
                partition_name text not null,
                created_on timestamptz not null default now(),
                updated_on timestamptz not null default now()
            );
        "#,
        r#"
            create table :SCHEMA.job (
                id uuid not null default gen_random_uuid(),
                name text not null,
                priority int not null default 0,
                data jsonb,
                state :SCHEMA.job_state not null default 'created',
                retry_limit int not null default 2,
                retry_count int not null default 0,
                retry_delay int not null default 0,
                retry_backoff bool not null default false,
                start_after timestamptz not null default now(),
                started_on timestamptz,
                singleton_key text,
                singleton_on timestamptz,
                expire_in interval not null default interval '15 minutes',
                created_on timestamptz not null default now(),
                completed_on timestamptz,
                keep_until timestamptz not null default now() + interval '14 days',
                output jsonb,
                dead_letter text,
                policy text,
                primary key (name, id)
            ) partition by list (name);
        "#,
        r#"
            create table :SCHEMA.archive (
                like :SCHEMA.job,
                archived_on timestamptz not null default now()
            );
        "#,
        r#"
            alter table :SCHEMA.archive add primary key (name, id);
        "#,
        r#"
            create index archive_archived_on_idx on :SCHEMA.archive (archived_on);
        "#,
        r#"
            create function :SCHEMA.create_queue(queue_name text, options json)
            returns void as
            $$
            declare
              table_name varchar := 'j' || encode(sha224(convert_to(queue_name, 'UTF8')), 'hex');
              queue_created_on timestamptz;
            begin
              with q as (
                insert into :SCHEMA.queue (
                  name, policy, retry_limit, retry_delay, retry_backoff,
                  expire_seconds, retention_minutes, dead_letter, partition_name
                )
                values (
                  queue_name,
                  coalesce(options->>'policy', 'standard'),
                  (options->>'retryLimit')::int,
                  (options->>'retryDelay')::int,
                  (options->>'retryBackoff')::bool,
                  (options->>'expireInSeconds')::int,
                  (options->>'retentionMinutes')::int,
                  options->>'deadLetter',
                  table_name
                )
                on conflict do nothing
                returning created_on
              )
              select created_on into queue_created_on from q;

              if queue_created_on is null then
                return;
              end if;

              execute format('create table :SCHEMA.%I (like :SCHEMA.job including defaults)', table_name);
              execute format('alter table :SCHEMA.%I add primary key (name, id)', table_name);
              execute format('alter table :SCHEMA.%I add constraint q_fkey foreign key (name) references :SCHEMA.queue (name) on delete restrict deferrable initially deferred', table_name);
              execute format('create unique index %1$s_i1 on :SCHEMA.%1$I (name) where state = ''created'' and policy = ''short''', table_name);
              execute format('create unique index %1$s_i2 on :SCHEMA.%1$I (name) where state = ''active'' and policy = ''singleton''', table_name);
              execute format('create unique index %1$s_i3 on :SCHEMA.%1$I (name, state) where state <= ''active'' and policy = ''stately''', table_name);
              execute format('create unique index %1$s_i4 on :SCHEMA.%1$I (name, singleton_key) where state <= ''completed'' and singleton_on is null', table_name);
              execute format('create unique index %1$s_i5 on :SCHEMA.%1$I (name, singleton_on, coalesce(singleton_key, '''')) where state <= ''completed'' and singleton_on is not null', table_name);
              execute format('create index %1$s_i6 on :SCHEMA.%1$I (name, start_after) include (priority, created_on, id) where state < ''active''', table_name);
              execute format('alter table :SCHEMA.job attach partition :SCHEMA.%I for values in (%L)', table_name, queue_name);
            end;
            $$
            language plpgsql;
        "#,
        r#"
            create function :SCHEMA.delete_queue(queue_name text)
            returns void as
            $$
            declare
              table_name varchar;
            begin
              select partition_name into table_name
              from :SCHEMA.queue
              where name = queue_name;

              if table_name is null then
                return;
              end if;

              execute format('alter table :SCHEMA.job detach partition :SCHEMA.%I', table_name);
              execute format('drop table :SCHEMA.%I', table_name);
              delete from :SCHEMA.queue where name = queue_name;
            end;
            $$
            language plpgsql;
        "#,
    ],
    uninstall: &[
        r#"
            drop function :SCHEMA.delete_queue(text);
        "#,
        r#"
            drop function :SCHEMA.create_queue(text, json);
        "#,
        r#"
            drop table :SCHEMA.archive;
        "#,
        r#"
            drop table :SCHEMA.job;
        "#,
        r#"
            drop table :SCHEMA.queue;
        "#,
        r#"
            drop type :SCHEMA.job_state;
        "#,
    ],
};
