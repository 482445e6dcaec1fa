#![forbid(unsafe_code)]

mod support;

use cx_core::{
    ArtifactRef, JobId, JobStatus, OriginRef, PersonaId, PersonaVideoError, VisualsError,
};
use cx_engine::{DeliveryOutcome, IntakeError, JobIntake, JobQueue, PipelineConfig, RunOutcome};
use cx_storage::{
    DispatchPayload, JobCreateRequest, JobStatusRequest, JobsListRequest, QueueLeaseRequest,
    QueueState,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{DownQueue, FakeStages, Harness, quick_pool_config};

fn intake(harness: &Harness) -> JobIntake {
    let queue: Arc<dyn JobQueue> = harness.queue.clone();
    JobIntake::new(harness.store.clone(), queue)
}

async fn status_of(harness: &Harness, job_id: &JobId) -> cx_storage::JobRow {
    let id = job_id.clone();
    harness
        .store
        .call(move |store| store.job_get(&id))
        .await
        .expect("job get")
}

async fn log_of(harness: &Harness, job_id: &JobId) -> Vec<cx_storage::JobStatusUpdateRow> {
    let id = job_id.clone();
    harness
        .store
        .call(move |store| store.job_status_log(&id))
        .await
        .expect("status log")
}

#[tokio::test]
async fn all_stages_succeed_and_job_completes() {
    let harness = Harness::new(FakeStages::default());
    let origin = OriginRef::try_new("tweet:42", Some("u7".to_string())).expect("origin");
    let job_id = intake(&harness)
        .submit("P1", "black holes", Some(origin))
        .await
        .expect("submit");

    let pool = harness.pool(quick_pool_config());
    let outcome = pool
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("a delivery");
    let DeliveryOutcome::Finished { outcome, .. } = outcome else {
        panic!("expected a finished delivery");
    };
    let RunOutcome::Completed(final_ref) = outcome else {
        panic!("expected completion");
    };

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_ref.as_ref(), Some(&final_ref));
    assert!(job.error.is_none());
    assert!(!job.reply_posted);

    let log = log_of(&harness, &job_id).await;
    let messages: Vec<&str> = log.iter().map(|u| u.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "job created for P1 explaining black holes",
            "generating explanation",
            "synthesizing speech",
            "rendering persona video and visuals",
            "composing final video",
            "video ready",
        ]
    );
    assert_eq!(log.last().map(|u| u.status), Some(job.status));

    let mut calls = harness.stages.calls();
    calls[2..4].sort_unstable();
    assert_eq!(
        calls,
        vec![
            "explanation",
            "speech",
            "persona_video",
            "visuals",
            "composition"
        ]
    );

    let messages = harness
        .store
        .call({
            let id = job_id.clone();
            move |store| store.queue_messages_for_job(&id)
        })
        .await
        .expect("queue rows");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].state, QueueState::Acked);
}

#[tokio::test]
async fn visuals_failure_fails_job_and_stops_persona_video() {
    let harness = Harness::new(FakeStages {
        fail_visuals: Some(VisualsError::PlanningFailed("no scenes".to_string())),
        persona_video_delay: Some(Duration::from_secs(30)),
        ..FakeStages::default()
    });
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");

    let pipeline = harness.pipeline(PipelineConfig::default());
    let outcome = tokio::time::timeout(Duration::from_secs(5), pipeline.run(&job_id))
        .await
        .expect("fork must not wait for the slow sibling")
        .expect("run");
    let RunOutcome::Failed(failure) = outcome else {
        panic!("expected a stage failure");
    };
    assert_eq!(failure.kind, "PlanningFailed");

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.result_ref.is_none());
    let error = job.error.expect("error text");
    assert!(error.contains("planning"), "unexpected error: {error}");
    assert!(error.starts_with("produce visuals failed: "));

    assert!(!harness.stages.calls().contains(&"composition"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.stages.persona_video_finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn persona_video_failure_discards_visuals() {
    let harness = Harness::new(FakeStages {
        fail_persona_video: Some(PersonaVideoError::SourceVideoMissing("P1".to_string())),
        ..FakeStages::default()
    });
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");

    let outcome = harness
        .pipeline(PipelineConfig::default())
        .run(&job_id)
        .await
        .expect("run");
    assert!(matches!(outcome, RunOutcome::Failed(ref f) if f.kind == "SourceVideoMissing"));

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.result_ref.is_none());
    let log = log_of(&harness, &job_id).await;
    assert_eq!(log.last().map(|u| u.status), Some(JobStatus::Error));
    assert!(
        log.iter()
            .all(|u| u.message != "composing final video")
    );
}

#[tokio::test]
async fn explanation_failure_stops_before_speech() {
    let harness = Harness::new(FakeStages {
        fail_explanation: Some(cx_core::ExplanationError::PersonaNotFound("P9".to_string())),
        ..FakeStages::default()
    });
    let job_id = intake(&harness)
        .submit("P9", "tides", None)
        .await
        .expect("submit");

    harness
        .pipeline(PipelineConfig::default())
        .run(&job_id)
        .await
        .expect("run");

    assert_eq!(harness.stages.calls(), vec!["explanation"]);
    let job = status_of(&harness, &job_id).await;
    assert_eq!(
        job.error.as_deref(),
        Some("generate explanation failed: persona not found: P9")
    );
}

#[tokio::test]
async fn slow_stage_times_out() {
    let harness = Harness::new(FakeStages {
        persona_video_delay: Some(Duration::from_secs(30)),
        ..FakeStages::default()
    });
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");

    let outcome = harness
        .pipeline(PipelineConfig {
            stage_timeout: Some(Duration::from_millis(50)),
        })
        .run(&job_id)
        .await
        .expect("run");
    let RunOutcome::Failed(failure) = outcome else {
        panic!("expected a timeout failure");
    };
    assert_eq!(failure.kind, "TimedOut");
    assert_eq!(
        status_of(&harness, &job_id).await.error.as_deref(),
        Some("produce persona video failed: timed out after 0.05s")
    );
}

#[tokio::test]
async fn duplicate_origin_is_rejected_at_intake() {
    let harness = Harness::new(FakeStages::default());
    let intake = intake(&harness);
    let origin = OriginRef::try_new("tweet:42", None).expect("origin");

    let first = intake
        .submit("P1", "black holes", Some(origin.clone()))
        .await
        .expect("first submit");
    let err = intake
        .submit("P2", "quasars", Some(origin))
        .await
        .expect_err("second submit must fail");
    match err {
        IntakeError::DuplicateOrigin {
            source_id,
            existing,
        } => {
            assert_eq!(source_id, "tweet:42");
            assert_eq!(existing, Some(first));
        }
        other => panic!("expected DuplicateOrigin, got {other:?}"),
    }

    let listed = harness
        .store
        .call(|store| {
            store.jobs_list(JobsListRequest {
                status: None,
                limit: 10,
            })
        })
        .await
        .expect("list");
    assert_eq!(listed.jobs.len(), 1);
}

#[tokio::test]
async fn intake_validates_input() {
    let harness = Harness::new(FakeStages::default());
    let intake = intake(&harness);

    assert!(matches!(
        intake.submit("P1", "   ", None).await,
        Err(IntakeError::InvalidInput(_))
    ));
    assert!(matches!(
        intake.submit("bad persona", "tides", None).await,
        Err(IntakeError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn dispatch_failure_marks_job_error() {
    let harness = Harness::new(FakeStages::default());
    let intake = JobIntake::new(harness.store.clone(), Arc::new(DownQueue));

    let err = intake
        .submit("P1", "black holes", None)
        .await
        .expect_err("dispatch must fail");
    let IntakeError::Dispatch { job_id, reason } = err else {
        panic!("expected a dispatch failure");
    };
    assert!(reason.contains("broker unreachable"));

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(
        job.error
            .as_deref()
            .is_some_and(|e| e.starts_with("dispatch failed: "))
    );
}

#[tokio::test]
async fn redelivered_processing_job_restarts_from_the_first_stage() {
    let harness = Harness::new(FakeStages::default());
    let job_id = JobId::try_new("J1").expect("job id");
    let persona_id = PersonaId::try_new("P1").expect("persona id");
    let request = JobCreateRequest {
        id: job_id.clone(),
        persona_id: persona_id.clone(),
        query: "black holes".to_string(),
        origin: None,
    };
    let id = job_id.clone();
    harness
        .store
        .call(move |store| {
            store.job_create(request)?;
            store.job_append_status(JobStatusRequest::progress(&id, "generating explanation"))?;
            store.job_append_status(JobStatusRequest::progress(&id, "synthesizing speech"))
        })
        .await
        .expect("seed crashed job");
    harness
        .queue
        .enqueue(DispatchPayload {
            job_id: job_id.clone(),
            persona_id,
            query: "black holes".to_string(),
        })
        .await
        .expect("enqueue");

    // First worker takes the message and dies without acking.
    harness
        .store
        .call(|store| {
            store.queue_lease(QueueLeaseRequest {
                worker_id: "crashed".to_string(),
                lease_ttl_ms: 5_000,
            })
        })
        .await
        .expect("lease")
        .expect("delivery");
    harness.advance(5_000);

    let outcome = harness
        .pool(quick_pool_config())
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("redelivery");
    assert!(matches!(
        outcome,
        DeliveryOutcome::Finished {
            outcome: RunOutcome::Completed(_),
            ..
        }
    ));

    let log = log_of(&harness, &job_id).await;
    assert_eq!(log[3].message, "restarting pipeline after redelivery");
    assert_eq!(harness.stages.calls().first(), Some(&"explanation"));
    assert_eq!(log.last().map(|u| u.status), Some(JobStatus::Completed));
}

#[tokio::test]
async fn redelivery_of_finished_job_runs_no_stage() {
    let harness = Harness::new(FakeStages::default());
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");
    let id = job_id.clone();
    harness
        .store
        .call(move |store| {
            store.job_append_status(JobStatusRequest::progress(&id, "generating explanation"))?;
            store.job_append_status(JobStatusRequest::completed(
                &id,
                ArtifactRef::new("final.mp4"),
                "video ready",
            ))
        })
        .await
        .expect("finish job out of band");

    let outcome = harness
        .pool(quick_pool_config())
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("delivery");
    assert!(matches!(
        outcome,
        DeliveryOutcome::Finished {
            outcome: RunOutcome::AlreadyTerminal(JobStatus::Completed),
            ..
        }
    ));
    assert!(harness.stages.calls().is_empty());
}

#[tokio::test]
async fn too_many_deliveries_fail_the_job() {
    let harness = Harness::new(FakeStages::default());
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");

    for _ in 0..2 {
        harness
            .store
            .call(|store| {
                store.queue_lease(QueueLeaseRequest {
                    worker_id: "crashed".to_string(),
                    lease_ttl_ms: 1_000,
                })
            })
            .await
            .expect("lease")
            .expect("delivery");
        harness.advance(1_000);
    }

    let mut config = quick_pool_config();
    config.max_deliveries = 2;
    let outcome = harness
        .pool(config)
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("delivery");
    assert_eq!(
        outcome,
        DeliveryOutcome::Exhausted {
            job_id: job_id.clone(),
            deliveries: 3
        }
    );

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("dispatch retries exhausted after 2 deliveries")
    );
    assert!(harness.stages.calls().is_empty());
}

#[tokio::test]
async fn crashed_stage_releases_message_for_retry() {
    let harness = Harness::new(FakeStages {
        panic_persona_video: true,
        ..FakeStages::default()
    });
    let job_id = intake(&harness)
        .submit("P1", "black holes", None)
        .await
        .expect("submit");

    let outcome = harness
        .pool(quick_pool_config())
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("delivery");
    assert!(matches!(outcome, DeliveryOutcome::Released { .. }));

    let job = status_of(&harness, &job_id).await;
    assert_eq!(job.status, JobStatus::Processing);

    let id = job_id.clone();
    let rows = harness
        .store
        .call(move |store| store.queue_messages_for_job(&id))
        .await
        .expect("queue rows");
    assert_eq!(rows[0].state, QueueState::Ready);
    assert_eq!(rows[0].deliveries, 1);
    assert!(rows[0].visible_at_ms >= 1_000_000 + 60_000);
}

#[tokio::test]
async fn crash_in_a_sequential_stage_keeps_the_worker_alive() {
    let harness = Harness::new(FakeStages {
        panic_explanation: true,
        ..FakeStages::default()
    });
    let intake = intake(&harness);
    let crashing = intake
        .submit("P1", "black holes", None)
        .await
        .expect("submit");
    let pool = harness.pool(quick_pool_config());

    let outcome = pool
        .process_next("test-w0")
        .await
        .expect("process")
        .expect("delivery");
    assert!(matches!(outcome, DeliveryOutcome::Released { .. }));
    assert_eq!(harness.stages.calls(), vec!["explanation"]);

    let id = crashing.clone();
    let rows = harness
        .store
        .call(move |store| store.queue_messages_for_job(&id))
        .await
        .expect("queue rows");
    assert_eq!(rows[0].state, QueueState::Ready);
    assert_eq!(rows[0].deliveries, 1);
    assert_eq!(status_of(&harness, &crashing).await.status, JobStatus::Processing);

    // The same worker keeps taking deliveries after the crash.
    harness.advance(60_000);
    let again = pool
        .process_next("test-w0")
        .await
        .expect("process after crash")
        .expect("redelivery");
    assert!(matches!(again, DeliveryOutcome::Released { .. }));
    assert_eq!(harness.stages.calls().len(), 2);
}

#[tokio::test]
async fn worker_pool_drains_queue_and_stops_on_shutdown() {
    let harness = Harness::new(FakeStages::default());
    let intake = intake(&harness);
    let mut jobs = Vec::new();
    for topic in ["tides", "gravity", "entropy"] {
        jobs.push(intake.submit("P1", topic, None).await.expect("submit"));
    }

    let mut config = quick_pool_config();
    config.workers = 2;
    let pool = harness.pool(config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn(pool.run(shutdown_rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut done = 0;
        for job_id in &jobs {
            if status_of(&harness, job_id).await.status == JobStatus::Completed {
                done += 1;
            }
        }
        if done == jobs.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("pool stops")
        .expect("pool task");
}
