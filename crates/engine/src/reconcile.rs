#![forbid(unsafe_code)]

//! Turns finished jobs that came from an external request into exactly one
//! outbound reply each.
//!
//! The store's `reply_posted` flag is the only commit point. Delivery attempts
//! are counted per process; a job is given up on after `max_attempts` failed
//! calls until the process restarts.

use crate::error::EngineError;
use crate::reply::{ReplyFormat, compose_reply};
use crate::store_handle::StoreHandle;
use cx_core::{
    ArtifactStore, DeliveryReceipt, JobId, JobStatus, PersonaDirectory, ReplyDelivery,
    ReplyRequest,
};
use cx_storage::{JobRow, ReconcileCursor, ReplyClaimRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub batch_limit: usize,
    /// Take a reply claim in the store before calling out.
    pub claims: bool,
    pub claim_ttl: Duration,
    pub claimant: String,
    pub reply: ReplyFormat,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 2,
            batch_limit: 50,
            claims: true,
            claim_ttl: Duration::from_secs(120),
            claimant: format!("cx-{}", std::process::id()),
            reply: ReplyFormat::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub delivered: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub claimed_elsewhere: usize,
    pub committed_late: usize,
}

pub struct Reconciler {
    store: StoreHandle,
    delivery: Arc<dyn ReplyDelivery>,
    artifacts: Arc<dyn ArtifactStore>,
    personas: Arc<PersonaDirectory>,
    config: ReconcileConfig,
    attempts: HashMap<JobId, u32>,
    // Delivered but not yet recorded; retried without calling out again.
    pending_commits: HashMap<JobId, DeliveryReceipt>,
}

impl Reconciler {
    pub fn new(
        store: StoreHandle,
        delivery: Arc<dyn ReplyDelivery>,
        artifacts: Arc<dyn ArtifactStore>,
        personas: Arc<PersonaDirectory>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            artifacts,
            personas,
            config,
            attempts: HashMap::new(),
            pending_commits: HashMap::new(),
        }
    }

    pub fn attempts_for(&self, job_id: &JobId) -> u32 {
        self.attempts.get(job_id).copied().unwrap_or(0)
    }

    pub fn pending_commits(&self) -> usize {
        self.pending_commits.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            claims = self.config.claims,
            "reconciler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(report) if report != CycleReport::default() => {
                    tracing::info!(?report, "reconcile cycle finished");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "reconcile cycle failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::default();
        self.retry_pending_commits(&mut report).await;

        // Jobs this process has stopped retrying stay unposted in the store,
        // so page past them until `batch_limit` deliveries were attempted.
        let limit = self.config.batch_limit.max(1);
        let mut attempted = 0;
        let mut cursor: Option<ReconcileCursor> = None;
        'pages: loop {
            let after = cursor.clone();
            let page = self
                .store
                .call(move |store| store.jobs_reconcilable(after.as_ref(), limit))
                .await?;
            // The store may clamp the page size, so only an empty page ends the scan.
            cursor = page.last().map(ReconcileCursor::after);

            for job in page {
                report.candidates += 1;
                if self.pending_commits.contains_key(&job.id) {
                    continue;
                }
                if self.attempts_for(&job.id) >= self.config.max_attempts {
                    report.exhausted += 1;
                    continue;
                }
                if self.config.claims && !self.claim(&job.id, &mut report).await {
                    continue;
                }
                self.deliver(job, &mut report).await;
                attempted += 1;
                if attempted >= limit {
                    break 'pages;
                }
            }
            if cursor.is_none() {
                break;
            }
        }
        Ok(report)
    }

    async fn retry_pending_commits(&mut self, report: &mut CycleReport) {
        let pending: Vec<(JobId, DeliveryReceipt)> = self.pending_commits.drain().collect();
        for (job_id, receipt) in pending {
            let id = job_id.clone();
            let stored = receipt.0.clone();
            match self
                .store
                .call(move |store| store.mark_reply_posted(&id, Some(stored.as_str())))
                .await
            {
                Ok(_) => {
                    report.committed_late += 1;
                    tracing::info!(job_id = %job_id, "recorded earlier reply");
                }
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "reply commit still failing");
                    self.pending_commits.insert(job_id, receipt);
                }
            }
        }
    }

    async fn claim(&self, job_id: &JobId, report: &mut CycleReport) -> bool {
        let request = ReplyClaimRequest {
            job_id: job_id.clone(),
            claimant: self.config.claimant.clone(),
            ttl_ms: u64::try_from(self.config.claim_ttl.as_millis()).unwrap_or(u64::MAX),
        };
        match self.store.call(move |store| store.reply_claim(request)).await {
            Ok(true) => true,
            Ok(false) => {
                report.claimed_elsewhere += 1;
                tracing::debug!(job_id = %job_id, "reply claimed by another instance");
                false
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "reply claim failed");
                false
            }
        }
    }

    async fn deliver(&mut self, job: JobRow, report: &mut CycleReport) {
        let Some(origin) = job.origin.clone() else {
            return;
        };
        let media = job
            .result_ref
            .clone()
            .filter(|artifact| {
                job.status == JobStatus::Completed && self.artifacts.is_retrievable(artifact)
            });
        let text = compose_reply(
            &job,
            self.personas.name_for(&job.persona_id),
            media.is_some(),
            &self.config.reply,
        );

        let attempt = {
            let counter = self.attempts.entry(job.id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let request = ReplyRequest {
            origin,
            text,
            media,
        };

        match self.delivery.deliver(&request).await {
            Ok(receipt) => {
                report.delivered += 1;
                let id = job.id.clone();
                let stored = receipt.0.clone();
                match self
                    .store
                    .call(move |store| store.mark_reply_posted(&id, Some(stored.as_str())))
                    .await
                {
                    Ok(true) => tracing::info!(job_id = %job.id, attempt, "reply posted"),
                    Ok(false) => {
                        tracing::info!(job_id = %job.id, "reply was already recorded");
                    }
                    Err(err) => {
                        tracing::warn!(
                            job_id = %job.id,
                            error = %err,
                            "reply sent but not recorded; will retry the commit"
                        );
                        self.pending_commits.insert(job.id, receipt);
                    }
                }
            }
            Err(err) => {
                report.failed += 1;
                tracing::warn!(
                    job_id = %job.id,
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = %err,
                    "reply delivery failed"
                );
                if attempt >= self.config.max_attempts {
                    tracing::warn!(job_id = %job.id, "no more reply attempts in this process");
                }
                if self.config.claims {
                    let id = job.id.clone();
                    let claimant = self.config.claimant.clone();
                    if let Err(err) = self
                        .store
                        .call(move |store| store.reply_release(&id, &claimant))
                        .await
                    {
                        tracing::warn!(job_id = %job.id, error = %err, "reply release failed");
                    }
                }
            }
        }
    }
}
