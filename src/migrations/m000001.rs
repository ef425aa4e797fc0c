pub const M000001_MIGRATION: &[&str] = &[
    r#"
        create table :RELAY_SCHEMA.jobs (
            id uuid primary key,
            session_id text not null,
            kind text not null,
            queue text not null,
            priority smallint not null default 0,
            payload jsonb not null,
            status text not null default 'queued',
            attempts smallint not null default 0,
            max_attempts smallint not null,
            last_error text,
            result jsonb,
            run_at timestamptz not null default now(),
            expires_at timestamptz not null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            locked_at timestamptz,
            locked_by text
        );
    "#,
    r#"
        create index jobs_dequeue_idx
            on :RELAY_SCHEMA.jobs (queue, priority desc, run_at asc)
            where status in ('queued', 'retrying');
    "#,
    r#"
        create index jobs_session_idx on :RELAY_SCHEMA.jobs (session_id);
    "#,
    r#"
        create table :RELAY_SCHEMA.rate_buckets (
            key text primary key,
            tokens double precision not null,
            updated_at timestamptz not null default now()
        );
    "#,
];
