//! End-to-end runs: workflow executor, dispatch, queue and worker pool on a
//! SQLite file, the way `drover run` wires them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::config::AppConfig;
use drover_core::types::{JobStatus, OrchestrationEvent, StepStatus, WorkItemStatus};
use drover_engine::{
    CapabilityRegistry, FailurePolicy, Orchestrator, Phase, PhaseStatus, StepSpec, Workflow,
};
use drover_test_utils::{
    test_config, EchoCapability, FailingCapability, FlakyCapability, PanickingCapability,
    RecordingCapability, SlowCapability, StructuredCapability,
};

fn file_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = test_config();
    config.store.path = dir.path().join("drover.db").display().to_string();
    config
}

fn open(dir: &tempfile::TempDir, registry: CapabilityRegistry) -> Orchestrator {
    Orchestrator::open(file_config(dir), registry).expect("open orchestrator")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_research_pipeline_combines_all_output_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let writer = RecordingCapability::new("writer").requiring_upstream();
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    registry.register(StructuredCapability::new(
        "researcher",
        serde_json::json!({
            "summary": "Two sources agree",
            "findings": [{"claim": "Rust is fast", "sources": ["a.com"]}, "It is safe"]
        }),
    ));
    registry.register(StructuredCapability::new(
        "coder",
        serde_json::json!({"language": "rust", "code": "fn main() {}"}),
    ));
    registry.register(writer.clone());
    let orch = open(&dir, registry);
    let pool = orch.spawn_workers(3, CancellationToken::new());

    let workflow = Workflow::new("article")
        .with_description("research and write")
        .with_phase(
            Phase::parallel("research")
                .with_step(StepSpec::new("topic", "echo").with_text("memory safety"))
                .with_step(StepSpec::new("facts", "researcher"))
                .with_step(StepSpec::new("sample", "coder")),
        )
        .with_phase(
            Phase::sequential("write").with_step(
                StepSpec::new("draft", "writer").with_deps(["topic", "facts", "sample"]),
            ),
        );

    let report = orch.run_workflow("alice", &workflow).await.unwrap();
    pool.shutdown().await;

    assert!(report.succeeded(), "{:?}", report);
    assert!(report
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Completed && p.attempts == 1));

    let output = report.output.unwrap();
    assert!(output.contains("## research"));
    assert!(output.contains("### topic\nmemory safety"));
    assert!(output.contains("- Rust is fast [sources: a.com]"));
    assert!(output.contains("```rust\nfn main() {}\n```"));
    assert!(output.contains("writer saw 3 upstream"));

    // Upstream arrives namespaced and typed, with no backfill involved
    let inputs = writer.inputs();
    assert_eq!(inputs.len(), 1);
    let upstream = inputs[0]["upstream"].as_object().unwrap();
    assert_eq!(upstream["facts"]["kind"], "findings");
    assert_eq!(upstream["sample"]["kind"], "code");
    assert!(inputs[0].get("upstream_backfilled").is_none());

    let snapshot = orch.job_status(&report.job_id).await.unwrap();
    assert_eq!(snapshot.job.owner, "alice");
    assert_eq!(snapshot.job.description, "research and write");
    assert!(snapshot.job.completed_at.is_some());
    assert!(snapshot
        .items
        .iter()
        .all(|i| i.status == WorkItemStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_retry_absorbs_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = FlakyCapability::new("flaky", 2);
    let mut registry = CapabilityRegistry::new();
    registry.register(flaky.clone());
    let orch = open(&dir, registry);
    let pool = orch.spawn_workers(2, CancellationToken::new());

    let workflow = Workflow::new("w")
        .with_phase(Phase::parallel("only").with_step(StepSpec::new("s", "flaky")));
    let report = orch.run_workflow("tester", &workflow).await.unwrap();
    pool.shutdown().await;

    assert!(report.succeeded());
    assert_eq!(flaky.calls(), 3);
    // One work item, retried in place by the queue
    let snapshot = orch.job_status(&report.job_id).await.unwrap();
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].retry_count, 2);
    assert!(orch.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_optional_qa_phase_does_not_fail_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    registry.register(PanickingCapability);
    let orch = open(&dir, registry);
    let pool = orch.spawn_workers(2, CancellationToken::new());

    let workflow = Workflow::new("w")
        .with_phase(
            Phase::parallel("build").with_step(StepSpec::new("a", "echo").with_text("built")),
        )
        .with_phase(Phase::parallel("qa").with_step(StepSpec::new("check", "panic")))
        .with_phase(
            Phase::parallel("ship").with_step(StepSpec::new("z", "echo").with_text("shipped")),
        );
    let report = orch.run_workflow("tester", &workflow).await.unwrap();
    pool.shutdown().await;

    assert_eq!(report.status, JobStatus::Completed);
    let qa = report.phase("qa").unwrap();
    assert_eq!(qa.policy, FailurePolicy::Skip);
    assert_eq!(qa.status, PhaseStatus::Failed);
    assert_eq!(report.phase("ship").unwrap().status, PhaseStatus::Completed);

    let output = report.output.unwrap();
    assert!(output.contains("shipped"));
    assert!(output.contains("### check\n[failed] Worker failed on"));
    assert!(output.contains("capability panicked: capability blew up"));

    // The panicking item was retried and dead-lettered without killing a worker
    let dead = orch.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retries, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dependency_skips_dependents_and_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let tolerant = RecordingCapability::new("summarize");
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    registry.register(FailingCapability::new("broken", "no data"));
    registry.register(tolerant.clone());
    let orch = open(&dir, registry);
    let pool = orch.spawn_workers(2, CancellationToken::new());

    let workflow = Workflow::new("w")
        .with_phase(
            Phase::parallel("gather")
                .with_policy(FailurePolicy::Skip)
                .with_step(StepSpec::new("good", "echo").with_text("ok"))
                .with_step(StepSpec::new("bad", "broken")),
        )
        .with_phase(
            Phase::parallel("use")
                .with_step(StepSpec::new("strict", "echo").with_deps(["bad"]))
                .with_step(
                    StepSpec::new("lenient", "summarize")
                        .with_deps(["good", "bad"])
                        .tolerating_failed_deps(),
                ),
        );
    let report = orch.run_workflow("tester", &workflow).await.unwrap();
    pool.shutdown().await;

    assert_eq!(report.status, JobStatus::Failed);
    let error = report.error.unwrap();
    assert!(error.contains("strict (skipped)"), "{}", error);
    assert!(!error.contains("bad (failed)"), "optional step counted: {}", error);

    // The tolerant step ran with whatever upstream existed
    assert_eq!(tolerant.call_count(), 1);
    assert_eq!(tolerant.inputs()[0]["upstream"].as_object().unwrap().len(), 1);

    let snapshot = orch.job_status(&report.job_id).await.unwrap();
    let strict = snapshot.steps.iter().find(|s| s.id == "strict").unwrap();
    assert_eq!(strict.status, StepStatus::Skipped);
    assert!(strict.error.as_deref().unwrap().contains("bad"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_follow_job_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    let orch = open(&dir, registry);
    let mut rx = orch.event_bus().subscribe();
    let pool = orch.spawn_workers(2, CancellationToken::new());

    let report = orch
        .run_flat(
            "tester",
            "flat",
            vec![
                StepSpec::new("a", "echo").with_text("1"),
                StepSpec::new("b", "echo").with_text("2").with_deps(["a"]),
                StepSpec::new("c", "echo").with_text("3").with_deps(["a"]),
            ],
        )
        .await
        .unwrap();
    pool.shutdown().await;
    assert!(report.succeeded());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(OrchestrationEvent::JobStarted { .. })));
    let completed = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::JobCompleted { .. }))
        .count();
    assert_eq!(completed, 1);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));

    let enqueued = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::WorkItemEnqueued { .. }))
        .count();
    assert_eq!(enqueued, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_job_discards_late_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(SlowCapability::new(Duration::from_millis(600)));
    let orch = Arc::new(open(&dir, registry));
    let pool = orch.spawn_workers(1, CancellationToken::new());

    let workflow = Workflow::new("slow").with_phase(
        Phase::parallel("p")
            .with_step(StepSpec::new("one", "slow"))
            .with_step(StepSpec::new("two", "slow"))
            .with_step(StepSpec::new("three", "slow")),
    );
    let job_id = orch.submit_workflow("tester", &workflow).await.unwrap();

    let runner = {
        let orch = orch.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { orch.execute(&job_id, &workflow).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orch.cancel_job(&job_id).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);

    // Let the in-flight item finish; its result must not revive anything
    tokio::time::sleep(Duration::from_millis(800)).await;
    pool.shutdown().await;

    let snapshot = orch.job_status(&job_id).await.unwrap();
    assert_eq!(snapshot.job.status, JobStatus::Cancelled);
    assert!(snapshot.job.output.is_none());
    assert!(snapshot
        .items
        .iter()
        .all(|i| i.status == WorkItemStatus::Cancelled));
    assert_eq!(orch.queue().size().await.unwrap(), 0);
}
