#![forbid(unsafe_code)]

use crate::error::EngineError;
use crate::pipeline::{Pipeline, RunOutcome};
use crate::store_handle::StoreHandle;
use async_trait::async_trait;
use cx_core::JobId;
use cx_storage::{
    DispatchPayload, JobStatusRequest, QueueDelivery, QueueEnqueueRequest, QueueLeaseRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Durable hand-off between intake and the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns the broker's message id.
    async fn enqueue(&self, payload: DispatchPayload) -> Result<i64, EngineError>;
    async fn lease(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<QueueDelivery>, EngineError>;
    async fn renew(
        &self,
        message_id: i64,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<bool, EngineError>;
    async fn ack(&self, message_id: i64, worker_id: &str) -> Result<bool, EngineError>;
    async fn release(
        &self,
        message_id: i64,
        worker_id: &str,
        retry_delay: Duration,
    ) -> Result<bool, EngineError>;
}

fn duration_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// Queue backed by the `dispatch_queue` table of the job store.
#[derive(Clone, Debug)]
pub struct SqliteJobQueue {
    store: StoreHandle,
}

impl SqliteJobQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, payload: DispatchPayload) -> Result<i64, EngineError> {
        let row = self
            .store
            .call(move |store| store.queue_enqueue(QueueEnqueueRequest { payload }))
            .await?;
        Ok(row.id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<QueueDelivery>, EngineError> {
        let request = QueueLeaseRequest {
            worker_id: worker_id.to_string(),
            lease_ttl_ms: duration_ms(lease_ttl),
        };
        self.store.call(move |store| store.queue_lease(request)).await
    }

    async fn renew(
        &self,
        message_id: i64,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<bool, EngineError> {
        let worker_id = worker_id.to_string();
        let ttl_ms = duration_ms(lease_ttl);
        self.store
            .call(move |store| store.queue_renew(message_id, &worker_id, ttl_ms))
            .await
    }

    async fn ack(&self, message_id: i64, worker_id: &str) -> Result<bool, EngineError> {
        let worker_id = worker_id.to_string();
        self.store
            .call(move |store| store.queue_ack(message_id, &worker_id))
            .await
    }

    async fn release(
        &self,
        message_id: i64,
        worker_id: &str,
        retry_delay: Duration,
    ) -> Result<bool, EngineError> {
        let worker_id = worker_id.to_string();
        let delay_ms = duration_ms(retry_delay);
        self.store
            .call(move |store| store.queue_release(message_id, &worker_id, delay_ms))
            .await
    }
}

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub worker_prefix: String,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub retry_delay: Duration,
    /// Deliveries allowed per message before the job is failed for good.
    pub max_deliveries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_prefix: format!("cx-{}", std::process::id()),
            poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            max_deliveries: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    /// The pipeline reached a terminal state and the message was acked.
    Finished { job_id: JobId, outcome: RunOutcome },
    /// The message exceeded `max_deliveries`; the job was failed and acked.
    Exhausted { job_id: JobId, deliveries: u32 },
    /// Infrastructure failure; the message goes back to the queue.
    Released { job_id: JobId, reason: String },
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    store: StoreHandle,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<Pipeline>,
        store: StoreHandle,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            pipeline,
            store,
            config,
        }
    }

    /// Runs `workers` loops until `shutdown` flips to true. A worker finishes
    /// the job it holds before it observes the flag.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();
        for idx in 0..self.config.workers.max(1) {
            let worker_id = format!("{}-w{idx}", self.config.worker_prefix);
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker task ended abnormally");
            }
        }
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(worker = %worker_id, error = %err, "dispatch poll failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker = %worker_id, "worker stopped");
    }

    /// Leases and handles at most one message. `Ok(None)` means the queue had
    /// nothing visible.
    pub async fn process_next(
        &self,
        worker_id: &str,
    ) -> Result<Option<DeliveryOutcome>, EngineError> {
        let Some(delivery) = self.queue.lease(worker_id, self.config.lease_ttl).await? else {
            return Ok(None);
        };
        let job_id = delivery.payload.job_id.clone();
        tracing::info!(
            worker = %worker_id,
            job_id = %job_id,
            message_id = delivery.message_id,
            deliveries = delivery.deliveries,
            redelivered = delivery.redelivered,
            "picked up job"
        );

        if delivery.deliveries > self.config.max_deliveries {
            self.exhaust(&job_id).await?;
            self.ack(worker_id, &delivery).await?;
            return Ok(Some(DeliveryOutcome::Exhausted {
                job_id,
                deliveries: delivery.deliveries,
            }));
        }

        match self.run_with_heartbeat(worker_id, &delivery).await {
            Ok(outcome) => {
                self.ack(worker_id, &delivery).await?;
                Ok(Some(DeliveryOutcome::Finished { job_id, outcome }))
            }
            Err(err) => {
                tracing::warn!(
                    worker = %worker_id,
                    job_id = %job_id,
                    error = %err,
                    retry_in_ms = duration_ms(self.config.retry_delay),
                    "pipeline interrupted; releasing message"
                );
                self.queue
                    .release(delivery.message_id, worker_id, self.config.retry_delay)
                    .await?;
                Ok(Some(DeliveryOutcome::Released {
                    job_id,
                    reason: err.to_string(),
                }))
            }
        }
    }

    async fn run_with_heartbeat(
        &self,
        worker_id: &str,
        delivery: &QueueDelivery,
    ) -> Result<RunOutcome, EngineError> {
        let every = (self.config.lease_ttl / 3).max(Duration::from_millis(100));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        let run = self.pipeline.run(&delivery.payload.job_id);
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .renew(delivery.message_id, worker_id, self.config.lease_ttl)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            worker = %worker_id,
                            message_id = delivery.message_id,
                            "lease lost while the pipeline is running"
                        ),
                        Err(err) => tracing::warn!(
                            worker = %worker_id,
                            message_id = delivery.message_id,
                            error = %err,
                            "lease renewal failed"
                        ),
                    }
                }
            }
        }
    }

    async fn exhaust(&self, job_id: &JobId) -> Result<(), EngineError> {
        let max = self.config.max_deliveries;
        let id = job_id.clone();
        let failed = self
            .store
            .call(move |store| {
                let job = store.job_get(&id)?;
                if job.status.is_terminal() {
                    return Ok(false);
                }
                store.job_append_status(JobStatusRequest::failed(
                    &id,
                    format!("dispatch retries exhausted after {max} deliveries"),
                ))?;
                Ok(true)
            })
            .await?;
        if failed {
            tracing::error!(job_id = %job_id, max_deliveries = max, "giving up on job");
        }
        Ok(())
    }

    async fn ack(&self, worker_id: &str, delivery: &QueueDelivery) -> Result<(), EngineError> {
        if !self.queue.ack(delivery.message_id, worker_id).await? {
            tracing::warn!(
                worker = %worker_id,
                message_id = delivery.message_id,
                "ack ignored; lease was taken over"
            );
        }
        Ok(())
    }
}
