#![forbid(unsafe_code)]

use super::*;
use cx_core::{ArtifactRef, JobId, JobStatus, OriginRef, PersonaId};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};

const MAX_QUERY_LEN: usize = 2_000;
const MAX_MESSAGE_LEN: usize = 400;
const MAX_ERROR_LEN: usize = 4_000;
const MAX_RESULT_REF_LEN: usize = 1_024;
const MAX_RECEIPT_LEN: usize = 1_024;
const MAX_CLAIMANT_LEN: usize = 128;
const MAX_LIST_LIMIT: usize = 200;
const MIN_REPLY_CLAIM_TTL_MS: u64 = 1_000;
const MAX_REPLY_CLAIM_TTL_MS: u64 = 300_000;

const JOB_COLUMNS: &str = "id, revision, persona_id, query, status, origin_source_id, origin_author_id, \
     result_ref, error, reply_posted, reply_posted_at_ms, reply_receipt, created_at_ms, updated_at_ms, \
     completed_at_ms";

fn normalize_query(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("job.query must not be empty"));
    }
    if raw.chars().count() > MAX_QUERY_LEN {
        return Err(StoreError::InvalidInput("job.query is too long"));
    }
    Ok(raw.to_string())
}

fn normalize_message(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput(
            "job_status_update.message must not be empty",
        ));
    }
    Ok(raw.chars().take(MAX_MESSAGE_LEN).collect())
}

fn normalize_error(raw: Option<String>) -> Result<String, StoreError> {
    let trimmed = raw.as_deref().map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("status error requires error text"));
    }
    Ok(trimmed.chars().take(MAX_ERROR_LEN).collect())
}

fn normalize_result_ref(raw: Option<ArtifactRef>) -> Result<ArtifactRef, StoreError> {
    let Some(raw) = raw else {
        return Err(StoreError::InvalidInput(
            "status completed requires result_ref",
        ));
    };
    let trimmed = raw.as_str().trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("result_ref must not be empty"));
    }
    if trimmed.len() > MAX_RESULT_REF_LEN {
        return Err(StoreError::InvalidInput("result_ref is too long"));
    }
    Ok(ArtifactRef::new(trimmed))
}

fn normalize_claimant(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("claimant must not be empty"));
    }
    if trimmed.len() > MAX_CLAIMANT_LEN {
        return Err(StoreError::InvalidInput("claimant is too long"));
    }
    Ok(trimmed.to_string())
}

struct RawJobRow {
    id: String,
    revision: i64,
    persona_id: String,
    query: String,
    status: String,
    origin_source_id: Option<String>,
    origin_author_id: Option<String>,
    result_ref: Option<String>,
    error: Option<String>,
    reply_posted: i64,
    reply_posted_at_ms: Option<i64>,
    reply_receipt: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    completed_at_ms: Option<i64>,
}

fn read_raw_job(row: &rusqlite::Row<'_>) -> Result<RawJobRow, rusqlite::Error> {
    Ok(RawJobRow {
        id: row.get(0)?,
        revision: row.get(1)?,
        persona_id: row.get(2)?,
        query: row.get(3)?,
        status: row.get(4)?,
        origin_source_id: row.get(5)?,
        origin_author_id: row.get(6)?,
        result_ref: row.get(7)?,
        error: row.get(8)?,
        reply_posted: row.get(9)?,
        reply_posted_at_ms: row.get(10)?,
        reply_receipt: row.get(11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
        completed_at_ms: row.get(14)?,
    })
}

impl RawJobRow {
    fn into_job(self) -> Result<JobRow, StoreError> {
        let id = JobId::try_new(self.id).map_err(|_| StoreError::InvalidRow("jobs.id"))?;
        let persona_id = PersonaId::try_new(self.persona_id)
            .map_err(|_| StoreError::InvalidRow("jobs.persona_id"))?;
        let status =
            JobStatus::parse(&self.status).ok_or(StoreError::InvalidRow("jobs.status"))?;
        let origin = self.origin_source_id.map(|source_id| OriginRef {
            source_id,
            author_id: self.origin_author_id,
        });
        Ok(JobRow {
            id,
            revision: self.revision,
            persona_id,
            query: self.query,
            status,
            origin,
            result_ref: self.result_ref.map(ArtifactRef::new),
            error: self.error,
            reply_posted: self.reply_posted != 0,
            reply_posted_at_ms: self.reply_posted_at_ms,
            reply_receipt: self.reply_receipt,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            completed_at_ms: self.completed_at_ms,
        })
    }
}

fn job_by_id_tx(conn: &Connection, id: &str) -> Result<Option<JobRow>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
            params![id],
            read_raw_job,
        )
        .optional()?;
    raw.map(RawJobRow::into_job).transpose()
}

fn collect_jobs(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<JobRow>, StoreError> {
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_raw_job(row)?.into_job()?);
    }
    Ok(out)
}

/// Appends one status update. Timestamps never go backwards within a job, so
/// ordering by `(created_at_ms, seq)` always ends at the latest transition.
fn insert_status_update_tx(
    tx: &Transaction<'_>,
    job_id: &JobId,
    status: JobStatus,
    message: &str,
    now_ms: i64,
) -> Result<JobStatusUpdateRow, StoreError> {
    let last_ts: Option<i64> = tx.query_row(
        "SELECT MAX(created_at_ms) FROM job_status_updates WHERE job_id=?1",
        params![job_id.as_str()],
        |row| row.get(0),
    )?;
    let created_at_ms = last_ts.map_or(now_ms, |last| last.max(now_ms));

    tx.execute(
        r#"
        INSERT INTO job_status_updates(job_id, status, message, created_at_ms)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![job_id.as_str(), status.as_str(), message, created_at_ms],
    )?;

    Ok(JobStatusUpdateRow {
        seq: tx.last_insert_rowid(),
        job_id: job_id.clone(),
        status,
        message: message.to_string(),
        created_at_ms,
    })
}

fn map_job_insert_conflict(err: rusqlite::Error, request: &JobCreateRequest) -> StoreError {
    if !is_constraint_violation(&err) {
        return StoreError::Sql(err);
    }
    let on_origin = constraint_message(&err).is_some_and(|m| m.contains("origin_source_id"));
    match (&request.origin, on_origin) {
        (Some(origin), true) => StoreError::DuplicateOrigin {
            source_id: origin.source_id.clone(),
        },
        _ => StoreError::DuplicateJobId(request.id.to_string()),
    }
}

impl SqliteStore {
    pub fn job_create(&mut self, request: JobCreateRequest) -> Result<JobCreateResult, StoreError> {
        let query = normalize_query(&request.query)?;
        let now_ms = self.now_ms();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(origin) = request.origin.as_ref() {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE origin_source_id=?1",
                    params![origin.source_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StoreError::DuplicateOrigin {
                    source_id: origin.source_id.clone(),
                });
            }
        }

        let insert = tx.execute(
            r#"
            INSERT INTO jobs(
              id, revision, persona_id, query, status, origin_source_id, origin_author_id,
              reply_posted, created_at_ms, updated_at_ms
            )
            VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
            "#,
            params![
                request.id.as_str(),
                request.persona_id.as_str(),
                query,
                JobStatus::Created.as_str(),
                request.origin.as_ref().map(|o| o.source_id.as_str()),
                request.origin.as_ref().and_then(|o| o.author_id.as_deref()),
                now_ms,
            ],
        );
        if let Err(err) = insert {
            return Err(map_job_insert_conflict(err, &request));
        }

        let message: String = format!(
            "job created for {} explaining {}",
            request.persona_id, query
        )
        .chars()
        .take(MAX_MESSAGE_LEN)
        .collect();
        let created_update =
            insert_status_update_tx(&tx, &request.id, JobStatus::Created, &message, now_ms)?;

        let job = JobRow {
            id: request.id,
            revision: 0,
            persona_id: request.persona_id,
            query,
            status: JobStatus::Created,
            origin: request.origin,
            result_ref: None,
            error: None,
            reply_posted: false,
            reply_posted_at_ms: None,
            reply_receipt: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            completed_at_ms: None,
        };

        tx.commit()?;
        Ok(JobCreateResult {
            job,
            created_update,
        })
    }

    /// Moves a job to `request.status` and appends the matching update in one
    /// transaction; the row write is conditional on the revision read inside it.
    pub fn job_append_status(
        &mut self,
        request: JobStatusRequest,
    ) -> Result<JobStatusResult, StoreError> {
        let message = normalize_message(&request.message)?;
        let (result_ref, error) = match request.status {
            JobStatus::Completed => {
                if request.error.is_some() {
                    return Err(StoreError::InvalidInput(
                        "status completed must not carry an error",
                    ));
                }
                (Some(normalize_result_ref(request.result_ref)?), None)
            }
            JobStatus::Error => {
                if request.result_ref.is_some() {
                    return Err(StoreError::InvalidInput(
                        "status error must not carry a result_ref",
                    ));
                }
                (None, Some(normalize_error(request.error)?))
            }
            JobStatus::Created | JobStatus::Processing => {
                if request.result_ref.is_some() || request.error.is_some() {
                    return Err(StoreError::InvalidInput(
                        "non-terminal status must not carry result_ref or error",
                    ));
                }
                (None, None)
            }
        };

        let now_ms = self.now_ms();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(i64, String)> = tx
            .query_row(
                "SELECT revision, status FROM jobs WHERE id=?1",
                params![request.job_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((revision, raw_status)) = current else {
            return Err(StoreError::UnknownId);
        };
        let from = JobStatus::parse(&raw_status).ok_or(StoreError::InvalidRow("jobs.status"))?;
        if !from.can_transition_to(request.status) {
            return Err(StoreError::InvalidTransition {
                from,
                to: request.status,
            });
        }

        let completed_at_ms = request.status.is_terminal().then_some(now_ms);
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET revision=?2, status=?3, result_ref=?4, error=?5, updated_at_ms=?6, completed_at_ms=?7
            WHERE id=?1 AND revision=?8 AND status=?9
            "#,
            params![
                request.job_id.as_str(),
                revision + 1,
                request.status.as_str(),
                result_ref.as_ref().map(ArtifactRef::as_str),
                error.as_deref(),
                now_ms,
                completed_at_ms,
                revision,
                raw_status,
            ],
        )?;
        if changed != 1 {
            let actual: i64 = tx.query_row(
                "SELECT revision FROM jobs WHERE id=?1",
                params![request.job_id.as_str()],
                |row| row.get(0),
            )?;
            return Err(StoreError::RevisionMismatch {
                expected: revision,
                actual,
            });
        }

        let update =
            insert_status_update_tx(&tx, &request.job_id, request.status, &message, now_ms)?;
        let job = job_by_id_tx(&tx, request.job_id.as_str())?.ok_or(StoreError::UnknownId)?;

        tx.commit()?;
        Ok(JobStatusResult { job, update })
    }

    pub fn job_get(&self, id: &JobId) -> Result<JobRow, StoreError> {
        job_by_id_tx(&self.conn, id.as_str())?.ok_or(StoreError::UnknownId)
    }

    pub fn job_status_log(&self, id: &JobId) -> Result<Vec<JobStatusUpdateRow>, StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id=?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownId);
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, status, message, created_at_ms
            FROM job_status_updates
            WHERE job_id=?1
            ORDER BY created_at_ms ASC, seq ASC
            "#,
        )?;
        let mut rows = stmt.query(params![id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_status: String = row.get(1)?;
            out.push(JobStatusUpdateRow {
                seq: row.get(0)?,
                job_id: id.clone(),
                status: JobStatus::parse(&raw_status)
                    .ok_or(StoreError::InvalidRow("job_status_updates.status"))?,
                message: row.get(2)?,
                created_at_ms: row.get(3)?,
            });
        }
        Ok(out)
    }

    pub fn job_find_by_origin(&self, source_id: &str) -> Result<Option<JobRow>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE origin_source_id=?1"),
                params![source_id.trim()],
                read_raw_job,
            )
            .optional()?;
        raw.map(RawJobRow::into_job).transpose()
    }

    pub fn jobs_list(&self, request: JobsListRequest) -> Result<JobsListResult, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR status=?1)
            ORDER BY updated_at_ms DESC, id ASC
            LIMIT ?2
            "#
        ))?;
        let mut jobs = collect_jobs(
            &mut stmt,
            params![
                request.status.map(JobStatus::as_str),
                to_sqlite_i64(limit + 1)?
            ],
        )?;

        let has_more = jobs.len() > limit;
        if has_more {
            jobs.truncate(limit);
        }
        Ok(JobsListResult { jobs, has_more })
    }

    /// Terminal jobs that came from an external request and still owe a reply,
    /// oldest first. Pass the cursor of the last row seen to read the next page.
    pub fn jobs_reconcilable(
        &self,
        after: Option<&ReconcileCursor>,
        limit: usize,
    ) -> Result<Vec<JobRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE origin_source_id IS NOT NULL
              AND reply_posted=0
              AND status IN ('completed', 'error')
              AND (?1 IS NULL
                   OR COALESCE(completed_at_ms, 0) > ?1
                   OR (COALESCE(completed_at_ms, 0) = ?1 AND id > ?2))
            ORDER BY COALESCE(completed_at_ms, 0) ASC, id ASC
            LIMIT ?3
            "#
        ))?;
        collect_jobs(
            &mut stmt,
            params![
                after.map(|cursor| cursor.completed_at_ms),
                after.map(|cursor| cursor.job_id.as_str()),
                to_sqlite_i64(limit)?
            ],
        )
    }

    /// Takes the right to attempt the external reply for `ttl_ms`.
    ///
    /// Succeeds when nobody holds the claim, the previous lease expired, or the
    /// caller already holds it. Returns false once the reply has been posted.
    pub fn reply_claim(&mut self, request: ReplyClaimRequest) -> Result<bool, StoreError> {
        let claimant = normalize_claimant(&request.claimant)?;
        let ttl_ms = request
            .ttl_ms
            .clamp(MIN_REPLY_CLAIM_TTL_MS, MAX_REPLY_CLAIM_TTL_MS);
        let now_ms = self.now_ms();
        let expires_at_ms = ttl_deadline(now_ms, ttl_ms);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, i64, Option<String>)> = tx
            .query_row(
                "SELECT status, reply_posted, origin_source_id FROM jobs WHERE id=?1",
                params![request.job_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((raw_status, reply_posted, origin)) = current else {
            return Err(StoreError::UnknownId);
        };
        if reply_posted != 0 {
            return Ok(false);
        }
        if origin.is_none() {
            return Err(StoreError::InvalidInput("job has no origin to reply to"));
        }
        let status = JobStatus::parse(&raw_status).ok_or(StoreError::InvalidRow("jobs.status"))?;
        if !status.is_terminal() {
            return Err(StoreError::InvalidInput(
                "reply claim requires a terminal job",
            ));
        }

        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET reply_claimed_by=?2, reply_claim_expires_at_ms=?3, revision=revision+1, updated_at_ms=?4
            WHERE id=?1 AND reply_posted=0
              AND (reply_claimed_by IS NULL
                   OR reply_claimed_by=?2
                   OR reply_claim_expires_at_ms IS NULL
                   OR reply_claim_expires_at_ms <= ?4)
            "#,
            params![
                request.job_id.as_str(),
                claimant,
                expires_at_ms,
                now_ms
            ],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn reply_release(&mut self, job_id: &JobId, claimant: &str) -> Result<bool, StoreError> {
        let claimant = normalize_claimant(claimant)?;
        let changed = self.conn.execute(
            r#"
            UPDATE jobs
            SET reply_claimed_by=NULL, reply_claim_expires_at_ms=NULL
            WHERE id=?1 AND reply_claimed_by=?2 AND reply_posted=0
            "#,
            params![job_id.as_str(), claimant],
        )?;
        Ok(changed == 1)
    }

    /// Records that the external reply for a job was sent. Idempotent: returns
    /// true only for the call that performed the false -> true transition.
    pub fn mark_reply_posted(
        &mut self,
        job_id: &JobId,
        receipt: Option<&str>,
    ) -> Result<bool, StoreError> {
        let receipt = receipt
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| r.chars().take(MAX_RECEIPT_LEN).collect::<String>());
        let now_ms = self.now_ms();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, i64, Option<String>)> = tx
            .query_row(
                "SELECT status, reply_posted, origin_source_id FROM jobs WHERE id=?1",
                params![job_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((raw_status, reply_posted, origin)) = current else {
            return Err(StoreError::UnknownId);
        };
        if reply_posted != 0 {
            return Ok(false);
        }
        if origin.is_none() {
            return Err(StoreError::InvalidInput("job has no origin to reply to"));
        }
        let status = JobStatus::parse(&raw_status).ok_or(StoreError::InvalidRow("jobs.status"))?;
        if !status.is_terminal() {
            return Err(StoreError::InvalidInput(
                "reply can only be recorded for a terminal job",
            ));
        }

        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET reply_posted=1, reply_posted_at_ms=?2, reply_receipt=?3,
                reply_claimed_by=NULL, reply_claim_expires_at_ms=NULL,
                revision=revision+1, updated_at_ms=?2
            WHERE id=?1 AND reply_posted=0
            "#,
            params![job_id.as_str(), now_ms, receipt],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }
}
