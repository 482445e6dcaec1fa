#![forbid(unsafe_code)]

use cx_core::{JobId, PersonaId};
use cx_storage::{
    Clock, DispatchPayload, JobCreateRequest, QueueEnqueueRequest, QueueLeaseRequest, QueueState,
    SqliteStore, StoreError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("cx_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open_at(test_name: &str, start_ms: i64) -> (SqliteStore, Arc<AtomicI64>) {
    let now = Arc::new(AtomicI64::new(start_ms));
    let handle = Arc::clone(&now);
    let clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst));
    let store = SqliteStore::open_with_clock(temp_dir(test_name), clock).expect("open store");
    (store, now)
}

fn enqueue_job(store: &mut SqliteStore, id: &str) -> i64 {
    let job_id = JobId::try_new(id).expect("job id");
    let persona_id = PersonaId::try_new("einstein").expect("persona id");
    store
        .job_create(JobCreateRequest {
            id: job_id.clone(),
            persona_id: persona_id.clone(),
            query: "gravity".to_string(),
            origin: None,
        })
        .expect("create job");
    store
        .queue_enqueue(QueueEnqueueRequest {
            payload: DispatchPayload {
                job_id,
                persona_id,
                query: "gravity".to_string(),
            },
        })
        .expect("enqueue")
        .id
}

fn lease(store: &mut SqliteStore, worker: &str, ttl_ms: u64) -> Option<cx_storage::QueueDelivery> {
    store
        .queue_lease(QueueLeaseRequest {
            worker_id: worker.to_string(),
            lease_ttl_ms: ttl_ms,
        })
        .expect("lease")
}

#[test]
fn enqueue_requires_existing_job() {
    let (mut store, _now) = open_at("enqueue_requires_existing_job", 1_000);
    let err = store
        .queue_enqueue(QueueEnqueueRequest {
            payload: DispatchPayload {
                job_id: JobId::try_new("ghost").expect("job id"),
                persona_id: PersonaId::try_new("einstein").expect("persona id"),
                query: "gravity".to_string(),
            },
        })
        .expect_err("unknown job must not be enqueued");
    assert!(matches!(err, StoreError::UnknownId));
}

#[test]
fn lease_hands_out_messages_in_order_and_only_once() {
    let (mut store, _now) = open_at("lease_hands_out_messages_in_order_and_only_once", 1_000);
    let first = enqueue_job(&mut store, "J1");
    let second = enqueue_job(&mut store, "J2");

    let a = lease(&mut store, "w1", 30_000).expect("first delivery");
    let b = lease(&mut store, "w2", 30_000).expect("second delivery");
    assert_eq!(a.message_id, first);
    assert_eq!(b.message_id, second);
    assert_eq!(a.payload.job_id.as_str(), "J1");
    assert_eq!(a.deliveries, 1);
    assert!(!a.redelivered);

    assert!(lease(&mut store, "w3", 30_000).is_none());
    let depth = store.queue_depth().expect("depth");
    assert_eq!(depth.ready, 0);
    assert_eq!(depth.leased, 2);
}

#[test]
fn expired_lease_is_redelivered_to_another_worker() {
    let (mut store, now) = open_at("expired_lease_is_redelivered_to_another_worker", 1_000);
    let message_id = enqueue_job(&mut store, "J1");

    let first = lease(&mut store, "w1", 5_000).expect("first delivery");
    assert_eq!(first.lease_expires_at_ms, 6_000);

    now.store(5_999, Ordering::SeqCst);
    assert!(lease(&mut store, "w2", 5_000).is_none());

    now.store(6_000, Ordering::SeqCst);
    let second = lease(&mut store, "w2", 5_000).expect("redelivery");
    assert_eq!(second.message_id, message_id);
    assert_eq!(second.deliveries, 2);
    assert!(second.redelivered);

    assert!(
        !store.queue_ack(message_id, "w1").expect("stale ack"),
        "the first worker lost its lease"
    );
    assert!(store.queue_ack(message_id, "w2").expect("ack"));
    let row = store.queue_message_get(message_id).expect("message row");
    assert_eq!(row.state, QueueState::Acked);
    assert_eq!(row.deliveries, 2);
    assert!(row.lease_owner.is_none());
}

#[test]
fn renew_keeps_the_message_away_from_other_workers() {
    let (mut store, now) = open_at("renew_keeps_the_message_away_from_other_workers", 1_000);
    let message_id = enqueue_job(&mut store, "J1");
    lease(&mut store, "w1", 5_000).expect("delivery");

    now.store(4_000, Ordering::SeqCst);
    assert!(store.queue_renew(message_id, "w1", 5_000).expect("renew"));
    assert!(!store.queue_renew(message_id, "w2", 5_000).expect("foreign renew"));

    now.store(8_000, Ordering::SeqCst);
    assert!(lease(&mut store, "w2", 5_000).is_none());
    let row = store.queue_message_get(message_id).expect("message row");
    assert_eq!(row.lease_expires_at_ms, Some(9_000));
}

#[test]
fn release_delays_visibility_and_keeps_delivery_count() {
    let (mut store, now) = open_at("release_delays_visibility_and_keeps_delivery_count", 1_000);
    let message_id = enqueue_job(&mut store, "J1");
    lease(&mut store, "w1", 5_000).expect("delivery");

    assert!(store.queue_release(message_id, "w1", 60_000).expect("release"));
    assert!(!store.queue_release(message_id, "w1", 60_000).expect("double release"));

    now.store(60_999, Ordering::SeqCst);
    assert!(lease(&mut store, "w1", 5_000).is_none());

    now.store(61_000, Ordering::SeqCst);
    let again = lease(&mut store, "w1", 5_000).expect("redelivery");
    assert_eq!(again.message_id, message_id);
    assert_eq!(again.deliveries, 2);
}

#[test]
fn lease_ttl_is_clamped() {
    let (mut store, _now) = open_at("lease_ttl_is_clamped", 1_000);
    enqueue_job(&mut store, "J1");
    enqueue_job(&mut store, "J2");

    let short = lease(&mut store, "w1", 1).expect("delivery");
    assert_eq!(short.lease_expires_at_ms, 2_000);
    let long = lease(&mut store, "w1", u64::MAX).expect("delivery");
    assert_eq!(long.lease_expires_at_ms, 301_000);
}

#[test]
fn second_message_for_a_leased_job_waits() {
    let (mut store, _now) = open_at("second_message_for_a_leased_job_waits", 1_000);
    enqueue_job(&mut store, "J1");
    store
        .queue_enqueue(QueueEnqueueRequest {
            payload: DispatchPayload {
                job_id: JobId::try_new("J1").expect("job id"),
                persona_id: PersonaId::try_new("einstein").expect("persona id"),
                query: "gravity".to_string(),
            },
        })
        .expect("second enqueue");

    assert!(lease(&mut store, "w1", 5_000).is_some());
    assert!(lease(&mut store, "w2", 5_000).is_none());
    assert_eq!(
        store
            .queue_messages_for_job(&JobId::try_new("J1").expect("job id"))
            .expect("messages")
            .len(),
        2
    );
}

#[test]
fn worker_id_must_not_be_blank() {
    let (mut store, _now) = open_at("worker_id_must_not_be_blank", 1_000);
    let err = store
        .queue_lease(QueueLeaseRequest {
            worker_id: "   ".to_string(),
            lease_ttl_ms: 5_000,
        })
        .expect_err("blank worker id");
    assert!(matches!(err, StoreError::InvalidInput("worker_id must not be empty")));
}
