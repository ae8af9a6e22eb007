//! Several orchestrators on one SQLite file stand in for separate executor
//! and worker processes: each opens its own connection, and only the
//! database is shared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::config::AppConfig;
use drover_core::traits::{RecordStore, WorkQueue};
use drover_core::types::{Job, JobStatus, WorkItem, WorkItemStatus};
use drover_engine::{CapabilityRegistry, Orchestrator, StepSpec};
use drover_store::{Database, SqliteQueue, SqliteStore};
use drover_test_utils::{test_config, EchoCapability, RecordingCapability};

fn file_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = test_config();
    config.store.path = dir.path().join("shared.db").display().to_string();
    config
}

fn recording_registry(capability: &RecordingCapability) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(capability.clone());
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executor_and_workers_in_separate_processes() {
    let dir = tempfile::tempdir().unwrap();

    // The executor side registers nothing: it never runs a capability itself
    let executor = Orchestrator::open(file_config(&dir), CapabilityRegistry::new()).unwrap();

    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    let workers = Orchestrator::open(file_config(&dir), registry).unwrap();
    let pool = workers.spawn_workers(2, CancellationToken::new());

    let report = executor
        .run_flat(
            "tester",
            "split",
            vec![
                StepSpec::new("a", "echo").with_text("from a"),
                StepSpec::new("b", "echo").with_text("from b").with_deps(["a"]),
            ],
        )
        .await
        .unwrap();
    pool.shutdown().await;

    assert!(report.succeeded(), "{:?}", report);
    let output = report.output.unwrap();
    assert!(output.contains("from a"));
    assert!(output.contains("from b"));

    // Both processes see the same final record
    let seen_by_workers = workers.job_status(&report.job_id).await.unwrap();
    assert_eq!(seen_by_workers.job.status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_worker_processes_never_share_an_item() {
    let dir = tempfile::tempdir().unwrap();
    let left = RecordingCapability::new("record");
    let right = RecordingCapability::new("record");

    let submitter = Orchestrator::open(file_config(&dir), CapabilityRegistry::new()).unwrap();
    let left_side = Orchestrator::open(file_config(&dir), recording_registry(&left)).unwrap();
    let right_side = Orchestrator::open(file_config(&dir), recording_registry(&right)).unwrap();

    let job = Job::new("tester", "fan-out");
    let store = submitter.store();
    let queue = submitter.queue();
    store.create_job(&job).await.unwrap();
    store
        .set_job_status(&job.id, JobStatus::Running, None, None)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..30 {
        let mut input = drover_core::types::Payload::new();
        input.insert("n".into(), serde_json::json!(i));
        let item = WorkItem::new(job.id.clone(), format!("step-{}", i), "record", input);
        store.create_work_item(&item).await.unwrap();
        queue.enqueue(&item.id, 0).await.unwrap();
        ids.push(item.id);
    }

    let left_pool = left_side.spawn_workers(3, CancellationToken::new());
    let right_pool = right_side.spawn_workers(3, CancellationToken::new());

    let mut finished = false;
    for _ in 0..500 {
        let items = store.list_work_items(&job.id).await.unwrap();
        if items.iter().all(|i| i.status == WorkItemStatus::Completed) {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    left_pool.shutdown().await;
    right_pool.shutdown().await;
    assert!(finished, "work items never completed");

    // Every item ran exactly once across both processes
    assert_eq!(left.call_count() + right.call_count(), 30);
    let seen: HashSet<i64> = left
        .inputs()
        .iter()
        .chain(right.inputs().iter())
        .map(|input| input["n"].as_i64().unwrap())
        .collect();
    assert_eq!(seen.len(), 30);

    // With no step records, the item rule finalizes the job
    let job = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.output.unwrap().contains("### step-0\nrecord saw 0 upstream"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recover_requeues_items_of_a_crashed_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = file_config(&dir);
    config.queue.stale_after_secs = 0;

    // A worker that dequeued and claimed an item, then died
    let db = Database::open(&config.store_path()).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(db.clone()));
    let queue: Arc<dyn WorkQueue> = Arc::new(SqliteQueue::new(db, config.queue.clone()));

    let job = Job::new("tester", "crash");
    store.create_job(&job).await.unwrap();
    let mut input = drover_core::types::Payload::new();
    input.insert("text".into(), serde_json::json!("survived"));
    let item = WorkItem::new(job.id.clone(), "only", "echo", input);
    store.create_work_item(&item).await.unwrap();
    queue.enqueue(&item.id, 0).await.unwrap();

    let claimed = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    queue.mark_processing(&claimed).await.unwrap();
    assert!(store.claim_work_item(&claimed).await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A fresh process recovers it and finishes the work
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    let orch = Orchestrator::open(config, registry).unwrap();
    assert_eq!(orch.recover_stale().await.unwrap(), 1);
    let record = orch.store().get_work_item(&item.id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkItemStatus::Queued);

    let pool = orch.spawn_workers(1, CancellationToken::new());
    let mut done = None;
    for _ in 0..200 {
        let record = orch.store().get_work_item(&item.id).await.unwrap().unwrap();
        if record.status.is_terminal() {
            done = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await;

    let record = done.expect("recovered item never finished");
    assert_eq!(record.status, WorkItemStatus::Completed);
    assert_eq!(record.result.unwrap().render(), "survived");
}
