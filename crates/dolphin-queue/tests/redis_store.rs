//! Redis store and gate integration tests.

use std::sync::Arc;
use std::time::Duration;

use dolphin_models::{JobPayload, JobResult, JobState, Language};
use dolphin_queue::{
    AdmissionConfig, AdmissionGate, AdmissionSlot, JobStatusFacade, JobStore, RedisAdmissionGate,
    RedisJobStore, StoreConfig,
};

const LEASE: Duration = Duration::from_secs(30);

/// Config isolated under a fresh key prefix.
fn isolated_config() -> StoreConfig {
    dotenvy::dotenv().ok();
    StoreConfig {
        key_prefix: format!("dolphin-test-{}", uuid::Uuid::new_v4()),
        ..StoreConfig::from_env()
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_connection() {
    let store = RedisJobStore::new(isolated_config()).expect("Failed to create store");
    store.ping().await.expect("Failed to ping Redis");

    let depth = store.depth().await.expect("Failed to read depth");
    assert_eq!(depth.waiting, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_dequeue_complete() {
    let store = Arc::new(RedisJobStore::new(isolated_config()).expect("Failed to create store"));
    let job = store
        .enqueue(JobPayload::certificate("Sara", Language::En), 3)
        .await
        .expect("Failed to enqueue");

    let taken = store
        .dequeue("worker-a", LEASE)
        .await
        .expect("Failed to dequeue")
        .expect("Queue was empty");
    assert_eq!(taken.id, job.id);
    assert_eq!(taken.state, JobState::Active);

    // A second worker gets nothing and cannot write.
    assert!(store.dequeue("worker-b", LEASE).await.unwrap().is_none());
    assert!(store
        .report_progress(&job.id, "worker-b", 10, "stolen")
        .await
        .unwrap_err()
        .is_lease_lost());

    store
        .report_progress(&job.id, "worker-a", 40, "drawing")
        .await
        .unwrap();
    store
        .report_progress(&job.id, "worker-a", 20, "late")
        .await
        .unwrap();

    let result = JobResult {
        url: "http://localhost:5000/api/certificates/download/x_en.png".into(),
        path: "/out/x_en.png".into(),
        file_name: "x_en.png".into(),
    };
    store.complete(&job.id, "worker-a", &result).await.unwrap();

    let status = JobStatusFacade::new(store.clone())
        .get_status(&job.id)
        .await
        .unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.stage_log, vec!["drawing", "late"]);
    assert_eq!(status.result, Some(result));
    assert_eq!(store.depth().await.unwrap().active, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_goes_through_delayed_set() {
    let store = RedisJobStore::new(isolated_config()).expect("Failed to create store");
    let job = store.enqueue(JobPayload::video("Omar"), 2).await.unwrap();
    store.dequeue("worker-a", LEASE).await.unwrap().unwrap();
    store
        .report_progress(&job.id, "worker-a", 50, "half")
        .await
        .unwrap();

    let attempt = store
        .schedule_retry(&job.id, "worker-a", Duration::from_millis(200), "exit 1")
        .await
        .unwrap();
    assert_eq!(attempt, 2);

    let record = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.progress, 0);
    assert_eq!(record.stage_log.last().unwrap(), "Retrying (attempt 2) in 0.2s");
    assert_eq!(store.depth().await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.promote_due().await.unwrap(), 1);

    let again = store.dequeue("worker-a", LEASE).await.unwrap().unwrap();
    assert_eq!(again.attempt, 2);

    // Last attempt: no further retry is allowed.
    assert!(store
        .schedule_retry(&job.id, "worker-a", Duration::ZERO, "exit 1")
        .await
        .is_err());
    store
        .fail(&job.id, "worker-a", "Media processing failed")
        .await
        .unwrap();
    let record = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_reaper_reclaims_expired_lease() {
    let store = RedisJobStore::new(isolated_config()).expect("Failed to create store");
    let job = store.enqueue(JobPayload::video("Omar"), 3).await.unwrap();
    store
        .dequeue("crashed", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reaped = store.reap_expired("worker-b", LEASE).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, job.id);
    assert!(store.renew_lease(&job.id, "worker-b", LEASE).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_gate_bounds_holders() {
    let config = isolated_config();
    let gate: Arc<dyn AdmissionGate> = Arc::new(
        RedisAdmissionGate::new(
            &config,
            AdmissionConfig {
                max_concurrent: 1,
                slot_ttl: Duration::from_secs(30),
            },
        )
        .expect("Failed to create gate"),
    );

    let slot = AdmissionSlot::try_acquire(gate.clone(), "worker-a")
        .await
        .unwrap()
        .expect("First slot denied");
    assert!(AdmissionSlot::try_acquire(gate.clone(), "worker-b")
        .await
        .unwrap()
        .is_none());
    assert!(slot.renew().await.unwrap());

    slot.release().await;
    assert_eq!(gate.active_count().await.unwrap(), 0);
}
