#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS dispatch_queue (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL REFERENCES jobs(id),
          payload_json TEXT NOT NULL,
          state TEXT NOT NULL,
          deliveries INTEGER NOT NULL DEFAULT 0,
          visible_at_ms INTEGER NOT NULL,
          lease_owner TEXT,
          lease_expires_at_ms INTEGER,
          enqueued_at_ms INTEGER NOT NULL,
          acked_at_ms INTEGER
        );
"#;
