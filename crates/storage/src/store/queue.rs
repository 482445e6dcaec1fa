#![forbid(unsafe_code)]

use super::*;
use cx_core::JobId;
use rusqlite::{OptionalExtension, TransactionBehavior, params};

const MIN_LEASE_TTL_MS: u64 = 1_000;
const MAX_LEASE_TTL_MS: u64 = 300_000;
const MAX_RETRY_DELAY_MS: u64 = 3_600_000;
const MAX_WORKER_ID_LEN: usize = 128;

fn normalize_worker_id(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("worker_id must not be empty"));
    }
    if trimmed.len() > MAX_WORKER_ID_LEN {
        return Err(StoreError::InvalidInput("worker_id is too long"));
    }
    Ok(trimmed.to_string())
}

fn clamp_lease_ttl(ttl_ms: u64) -> u64 {
    ttl_ms.clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS)
}

fn read_message_row(row: &rusqlite::Row<'_>) -> Result<QueueMessageRow, StoreError> {
    let job_id: String = row.get(1)?;
    let state: String = row.get(2)?;
    let deliveries: i64 = row.get(3)?;
    Ok(QueueMessageRow {
        id: row.get(0)?,
        job_id: JobId::try_new(job_id).map_err(|_| StoreError::InvalidRow("dispatch_queue.job_id"))?,
        state: QueueState::parse(&state).ok_or(StoreError::InvalidRow("dispatch_queue.state"))?,
        deliveries: u32::try_from(deliveries)
            .map_err(|_| StoreError::InvalidRow("dispatch_queue.deliveries"))?,
        visible_at_ms: row.get(4)?,
        lease_owner: row.get(5)?,
        lease_expires_at_ms: row.get(6)?,
        enqueued_at_ms: row.get(7)?,
        acked_at_ms: row.get(8)?,
    })
}

impl SqliteStore {
    pub fn queue_enqueue(
        &mut self,
        request: QueueEnqueueRequest,
    ) -> Result<QueueMessageRow, StoreError> {
        let payload_json = serde_json::to_string(&request.payload)
            .map_err(|_| StoreError::InvalidInput("dispatch payload is not serializable"))?;
        let now_ms = self.now_ms();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE id=?1",
                params![request.payload.job_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownId);
        }

        tx.execute(
            r#"
            INSERT INTO dispatch_queue(job_id, payload_json, state, deliveries, visible_at_ms, enqueued_at_ms)
            VALUES (?1, ?2, ?3, 0, ?4, ?4)
            "#,
            params![
                request.payload.job_id.as_str(),
                payload_json,
                QueueState::Ready.as_str(),
                now_ms
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(QueueMessageRow {
            id,
            job_id: request.payload.job_id,
            state: QueueState::Ready,
            deliveries: 0,
            visible_at_ms: now_ms,
            lease_owner: None,
            lease_expires_at_ms: None,
            enqueued_at_ms: now_ms,
            acked_at_ms: None,
        })
    }

    /// Hands the oldest visible message to `worker_id`.
    ///
    /// A message is visible when it is ready and its delay elapsed, or when a
    /// previous lease on it expired. Messages for a job that already has a live
    /// lease are skipped so one job never runs on two workers at once.
    pub fn queue_lease(
        &mut self,
        request: QueueLeaseRequest,
    ) -> Result<Option<QueueDelivery>, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;
        let ttl_ms = clamp_lease_ttl(request.lease_ttl_ms);
        let now_ms = self.now_ms();
        let lease_expires_at_ms = ttl_deadline(now_ms, ttl_ms);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<(i64, String, i64)> = tx
            .query_row(
                r#"
                SELECT q.id, q.payload_json, q.deliveries
                FROM dispatch_queue q
                WHERE ((q.state='ready' AND q.visible_at_ms <= ?1)
                       OR (q.state='leased' AND q.lease_expires_at_ms <= ?1))
                  AND NOT EXISTS (
                    SELECT 1 FROM dispatch_queue o
                    WHERE o.job_id=q.job_id
                      AND o.id<>q.id
                      AND o.state='leased'
                      AND o.lease_expires_at_ms > ?1
                  )
                ORDER BY q.visible_at_ms ASC, q.id ASC
                LIMIT 1
                "#,
                params![now_ms],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((message_id, payload_json, deliveries)) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            r#"
            UPDATE dispatch_queue
            SET state='leased', lease_owner=?2, lease_expires_at_ms=?3, deliveries=deliveries+1
            WHERE id=?1 AND deliveries=?4
            "#,
            params![message_id, worker_id, lease_expires_at_ms, deliveries],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        tx.commit()?;

        let payload: DispatchPayload = serde_json::from_str(&payload_json)
            .map_err(|_| StoreError::InvalidRow("dispatch_queue.payload_json"))?;
        let deliveries = u32::try_from(deliveries.saturating_add(1))
            .map_err(|_| StoreError::InvalidRow("dispatch_queue.deliveries"))?;

        tracing::debug!(
            message_id,
            job_id = %payload.job_id,
            deliveries,
            worker = %worker_id,
            "leased dispatch message"
        );
        Ok(Some(QueueDelivery {
            message_id,
            payload,
            deliveries,
            lease_expires_at_ms,
            redelivered: deliveries > 1,
        }))
    }

    /// Extends a lease the caller still owns. Returns false when the message
    /// was acked, released, or handed to another worker in the meantime.
    pub fn queue_renew(
        &mut self,
        message_id: i64,
        worker_id: &str,
        lease_ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let lease_expires_at_ms = ttl_deadline(self.now_ms(), clamp_lease_ttl(lease_ttl_ms));
        let changed = self.conn.execute(
            r#"
            UPDATE dispatch_queue
            SET lease_expires_at_ms=?3
            WHERE id=?1 AND state='leased' AND lease_owner=?2
            "#,
            params![message_id, worker_id, lease_expires_at_ms],
        )?;
        Ok(changed == 1)
    }

    pub fn queue_ack(&mut self, message_id: i64, worker_id: &str) -> Result<bool, StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let now_ms = self.now_ms();
        let changed = self.conn.execute(
            r#"
            UPDATE dispatch_queue
            SET state='acked', acked_at_ms=?3, lease_owner=NULL, lease_expires_at_ms=NULL
            WHERE id=?1 AND state='leased' AND lease_owner=?2
            "#,
            params![message_id, worker_id, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Returns a leased message to the ready set, visible again after
    /// `retry_delay_ms`. The delivery count is kept.
    pub fn queue_release(
        &mut self,
        message_id: i64,
        worker_id: &str,
        retry_delay_ms: u64,
    ) -> Result<bool, StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let visible_at_ms = ttl_deadline(self.now_ms(), retry_delay_ms.min(MAX_RETRY_DELAY_MS));
        let changed = self.conn.execute(
            r#"
            UPDATE dispatch_queue
            SET state='ready', visible_at_ms=?3, lease_owner=NULL, lease_expires_at_ms=NULL
            WHERE id=?1 AND state='leased' AND lease_owner=?2
            "#,
            params![message_id, worker_id, visible_at_ms],
        )?;
        Ok(changed == 1)
    }

    pub fn queue_depth(&self) -> Result<QueueDepth, StoreError> {
        let (ready, leased): (i64, i64) = self.conn.query_row(
            r#"
            SELECT
              COALESCE(SUM(CASE WHEN state='ready' THEN 1 ELSE 0 END), 0),
              COALESCE(SUM(CASE WHEN state='leased' THEN 1 ELSE 0 END), 0)
            FROM dispatch_queue
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueDepth {
            ready: u64::try_from(ready).unwrap_or(0),
            leased: u64::try_from(leased).unwrap_or(0),
        })
    }

    pub fn queue_message_get(&self, message_id: i64) -> Result<QueueMessageRow, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, job_id, state, deliveries, visible_at_ms, lease_owner,
                   lease_expires_at_ms, enqueued_at_ms, acked_at_ms
            FROM dispatch_queue
            WHERE id=?1
            "#,
        )?;
        let mut rows = stmt.query(params![message_id])?;
        match rows.next()? {
            Some(row) => read_message_row(row),
            None => Err(StoreError::UnknownId),
        }
    }

    pub fn queue_messages_for_job(&self, job_id: &JobId) -> Result<Vec<QueueMessageRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, job_id, state, deliveries, visible_at_ms, lease_owner,
                   lease_expires_at_ms, enqueued_at_ms, acked_at_ms
            FROM dispatch_queue
            WHERE job_id=?1
            ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![job_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_message_row(row)?);
        }
        Ok(out)
    }
}
