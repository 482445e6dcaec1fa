#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          revision INTEGER NOT NULL,
          persona_id TEXT NOT NULL,
          query TEXT NOT NULL,
          status TEXT NOT NULL,
          origin_source_id TEXT,
          origin_author_id TEXT,
          result_ref TEXT,
          error TEXT,
          reply_posted INTEGER NOT NULL DEFAULT 0,
          reply_posted_at_ms INTEGER,
          reply_receipt TEXT,
          reply_claimed_by TEXT,
          reply_claim_expires_at_ms INTEGER,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS job_status_updates (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL REFERENCES jobs(id),
          status TEXT NOT NULL,
          message TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS job_status_updates_no_update
        BEFORE UPDATE ON job_status_updates
        BEGIN
          SELECT RAISE(ABORT, 'job_status_updates is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS job_status_updates_no_delete
        BEFORE DELETE ON job_status_updates
        BEGIN
          SELECT RAISE(ABORT, 'job_status_updates is append-only');
        END;
"#;
