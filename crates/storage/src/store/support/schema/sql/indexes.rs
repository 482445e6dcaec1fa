#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_origin_source
          ON jobs(origin_source_id)
          WHERE origin_source_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_jobs_reconcile
          ON jobs(reply_posted, status, completed_at_ms)
          WHERE origin_source_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_jobs_updated
          ON jobs(updated_at_ms DESC, id);

        CREATE INDEX IF NOT EXISTS idx_job_status_updates_job
          ON job_status_updates(job_id, created_at_ms, seq);

        CREATE INDEX IF NOT EXISTS idx_dispatch_queue_visible
          ON dispatch_queue(state, visible_at_ms, id);

        CREATE INDEX IF NOT EXISTS idx_dispatch_queue_job
          ON dispatch_queue(job_id, state);
"#;
