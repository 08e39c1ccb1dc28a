//! Postgres schema for the engine tables. Idempotent; applied by
//! [`super::PostgresStore::migrate`].

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS custom_job (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    workflow_key TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    trigger_type VARCHAR(64) NOT NULL,
    day_of_week INTEGER,
    hour INTEGER,
    minute INTEGER,
    timezone TEXT,
    next_run_at TIMESTAMPTZ,
    last_scheduled_at TIMESTAMPTZ,
    trigger_source_type TEXT,
    trigger_source_config JSONB,
    job_config JSONB NOT NULL,
    retention_days INTEGER NOT NULL DEFAULT 90 CHECK (retention_days BETWEEN 1 AND 36500),
    created_by UUID,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS custom_job_trigger_event (
    id UUID PRIMARY KEY,
    custom_job_id UUID NOT NULL REFERENCES custom_job(id) ON DELETE CASCADE,
    source_type TEXT NOT NULL,
    source_event_id TEXT,
    dedupe_key TEXT NOT NULL,
    dedupe_key_prefix TEXT,
    event_time TIMESTAMPTZ,
    payload_json JSONB,
    status VARCHAR(64) NOT NULL,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT uq_custom_job_trigger_event_dedupe UNIQUE (custom_job_id, dedupe_key)
);

CREATE TABLE IF NOT EXISTS custom_job_trigger_state (
    custom_job_id UUID NOT NULL REFERENCES custom_job(id) ON DELETE CASCADE,
    source_key TEXT NOT NULL,
    cursor_json JSONB,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (custom_job_id, source_key)
);

CREATE TABLE IF NOT EXISTS custom_job_run (
    id UUID PRIMARY KEY,
    custom_job_id UUID NOT NULL REFERENCES custom_job(id) ON DELETE CASCADE,
    status VARCHAR(64) NOT NULL,
    scheduled_for TIMESTAMPTZ,
    trigger_event_id UUID REFERENCES custom_job_trigger_event(id) ON DELETE SET NULL,
    idempotency_key TEXT,
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    error_message TEXT,
    metrics_json JSONB,
    output_preview TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS custom_job_run_step (
    id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES custom_job_run(id) ON DELETE CASCADE,
    step_index INTEGER NOT NULL,
    step_id TEXT NOT NULL,
    step_key TEXT NOT NULL,
    status VARCHAR(64) NOT NULL,
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    error_message TEXT,
    output_json JSONB,
    CONSTRAINT uq_custom_job_run_step_index UNIQUE (run_id, step_index),
    CONSTRAINT uq_custom_job_run_step_id UNIQUE (run_id, step_id)
);

CREATE TABLE IF NOT EXISTS custom_job_audit_log (
    id UUID PRIMARY KEY,
    custom_job_id UUID NOT NULL REFERENCES custom_job(id) ON DELETE CASCADE,
    user_id UUID,
    action TEXT NOT NULL,
    details_json JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS ix_custom_job_tenant ON custom_job (tenant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS ix_custom_job_next_run_enabled ON custom_job (next_run_at) WHERE enabled = true;

CREATE UNIQUE INDEX IF NOT EXISTS uq_custom_job_run_scheduled
    ON custom_job_run (custom_job_id, scheduled_for) WHERE scheduled_for IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_custom_job_run_trigger_event
    ON custom_job_run (custom_job_id, trigger_event_id) WHERE trigger_event_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_custom_job_run_idempotency
    ON custom_job_run (custom_job_id, idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS ix_custom_job_run_job_created ON custom_job_run (custom_job_id, created_at DESC);
CREATE INDEX IF NOT EXISTS ix_custom_job_run_status ON custom_job_run (status);
CREATE INDEX IF NOT EXISTS ix_custom_job_run_step_run ON custom_job_run_step (run_id, step_index);
CREATE INDEX IF NOT EXISTS ix_custom_job_trigger_event_claim
    ON custom_job_trigger_event (custom_job_id, status, event_time);
CREATE INDEX IF NOT EXISTS ix_custom_job_trigger_event_status ON custom_job_trigger_event (status);
CREATE INDEX IF NOT EXISTS ix_custom_job_audit_log_job_created
    ON custom_job_audit_log (custom_job_id, created_at DESC);
"#;

#[cfg(test)]
mod tests {
    use super::SCHEMA_SQL;

    #[test]
    fn run_uniqueness_indexes_are_partial() {
        for name in [
            "uq_custom_job_run_scheduled",
            "uq_custom_job_run_trigger_event",
            "uq_custom_job_run_idempotency",
        ] {
            let line = SCHEMA_SQL
                .lines()
                .position(|l| l.contains(name))
                .unwrap_or_else(|| panic!("missing index {name}"));
            let next = SCHEMA_SQL.lines().nth(line + 1).unwrap();
            assert!(next.contains("IS NOT NULL"), "{name} must be partial");
        }
    }
}
