//! End-to-end runs through dispatcher, cluster manager and completion
//! handler, plus the reconciliation and retention sweeps.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use clusterflow_cloud::MessageQueue;
use clusterflow_cluster::ProcessBackend;
use clusterflow_core::cluster::{ClusterState, TerminationReason};
use clusterflow_core::job_spec::{job_id_for, FailurePolicy, StepSpec};
use clusterflow_core::{JobState, NewJobRecord, TransitionFields};
use clusterflow_db::JobRegistry;
use clusterflow_pipeline::{ReconcileSummary, Reconciler, ReconcilerConfig, RetentionSweeper};

use common::{default_steps, notification, Harness, ScriptedBackend, INSTANCE_ID};

fn reconciler(h: &Harness) -> Reconciler {
    Reconciler::new(
        h.registry.clone(),
        h.clusters.clone(),
        h.completion.handler().clone(),
        ReconcilerConfig {
            instance_id: INSTANCE_ID.into(),
            interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(3600),
            owner_ttl: Duration::from_secs(900),
        },
    )
}

fn sh(name: &str, script: &str, on_failure: FailurePolicy) -> StepSpec {
    StepSpec::new(name, "sh", vec!["-c".into(), script.into()], on_failure)
}

// ---------------------------------------------------------------------------
// Test: the same file announced twice runs once, end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_ingestion_runs_one_job() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    let n = h.notify("data/input1.csv").await;
    h.notify("data/input1.csv").await;

    h.run_to_completion().await;

    assert_eq!(h.registry.len().await, 1);
    assert_eq!(h.backend.creates(), 1);
    let record = h.record(&n).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(h.store.write_count(&h.output_location(&record.job_id)).await, 1);
    assert!(h.ingest.is_empty().await);
    assert!(h.completions.is_empty().await);
    assert!(h.dlq.is_empty().await);
}

// ---------------------------------------------------------------------------
// Test: local process clusters honour step failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn process_cluster_continue_failure_succeeds_with_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(ProcessBackend::new(tmp.path().join("clusters")));
    let h = Harness::with_cluster_backend(
        backend,
        vec![
            sh("step1", "exit 1", FailurePolicy::Continue),
            sh("step2", "test -f job-spec.json", FailurePolicy::Terminate),
        ],
    );
    let n = h.notify("data/input1.csv").await;
    h.run_to_completion().await;

    let record = h.record(&n).await;
    let handle = h
        .clusters
        .describe(record.cluster_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(handle.state, ClusterState::Terminated);
    assert_eq!(handle.executed_steps, vec!["step1", "step2"]);

    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.warnings.len(), 1);
    assert!(record.warnings[0].starts_with("step 'step1' failed: exit status 1"));
}

#[tokio::test]
async fn process_cluster_terminate_failure_skips_remaining_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("step2-ran");
    let backend = Arc::new(ProcessBackend::new(tmp.path().join("clusters")));
    let h = Harness::with_cluster_backend(
        backend,
        vec![
            sh("step1", "exit 3", FailurePolicy::Terminate),
            sh(
                "step2",
                &format!("touch {}", marker.display()),
                FailurePolicy::Terminate,
            ),
        ],
    );
    let n = h.notify("data/input1.csv").await;
    h.run_to_completion().await;

    let record = h.record(&n).await;
    let handle = h
        .clusters
        .describe(record.cluster_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(handle.state, ClusterState::Failed);
    assert_eq!(handle.reason, Some(TerminationReason::StepFailed));
    assert_eq!(handle.executed_steps, vec!["step1"]);
    assert!(!marker.exists());

    assert_eq!(record.state, JobState::Failed);
    assert!(record.last_error.as_deref().unwrap().contains("STEP_FAILED"));
    assert!(h.store.keys().await.is_empty());
}

// ---------------------------------------------------------------------------
// Test: a crash before the commit point converges on redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivery_before_commit_converges() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    let n = h.notify("data/input1.csv").await;

    // A dispatcher receives the message and dies before deleting it.
    let lost = h.ingest.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(lost.len(), 1);
    h.ingest.expire_visibility().await;

    h.run_to_completion().await;

    let record = h.record(&n).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(h.backend.creates(), 1);
    assert!(h.ingest.is_empty().await);

    // The dead dispatcher's receipt is stale by now.
    h.ingest.delete(&lost[0].receipt).await.unwrap();
    assert_eq!(h.record(&n).await, record);
}

// ---------------------------------------------------------------------------
// Test: reconciliation finalizes jobs whose completion event went missing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconciler_finalizes_terminal_cluster_without_event() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    let n = h.notify("data/input1.csv").await;
    h.dispatch_all().await;
    h.settle_clusters().await;

    // Drop the completion event on the floor.
    for message in h.completions.receive(10, Duration::ZERO).await.unwrap() {
        h.completions.delete(&message.receipt).await.unwrap();
    }
    assert_eq!(h.record(&n).await.state, JobState::Submitted);

    let summary = reconciler(&h)
        .sweep_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(
        summary,
        ReconcileSummary {
            examined: 1,
            finalized: 1,
            ..Default::default()
        }
    );
    let record = h.record(&n).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(h.store.write_count(&h.output_location(&record.job_id)).await, 1);
}

#[tokio::test]
async fn reconciler_fails_jobs_whose_cluster_is_lost() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    let n = notification("data/input1.csv");
    let fingerprint = n.fingerprint();
    h.registry
        .try_create(NewJobRecord {
            job_id: job_id_for(&fingerprint, 0),
            fingerprint: fingerprint.clone(),
            source: n.source.clone(),
            content_version: n.content_version(),
        })
        .await
        .unwrap();
    // Submitted by a process that has since gone away.
    h.registry
        .transition(
            &fingerprint,
            JobState::Pending,
            JobState::Submitted,
            TransitionFields::none().with_cluster_id("j-from-before-restart"),
        )
        .await
        .unwrap();

    let summary = reconciler(&h)
        .sweep_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(summary.lost, 1);
    let record = h.record(&n).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.last_error.as_deref(), Some("cluster lost"));
}

#[tokio::test]
async fn reconciler_defers_to_live_owner_until_its_heartbeat_lapses() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    let n = notification("data/input1.csv");
    let fingerprint = n.fingerprint();
    h.registry
        .try_create(NewJobRecord {
            job_id: job_id_for(&fingerprint, 0),
            fingerprint: fingerprint.clone(),
            source: n.source.clone(),
            content_version: n.content_version(),
        })
        .await
        .unwrap();
    // Submitted by another worker; this instance's manager never saw it.
    h.registry
        .transition(
            &fingerprint,
            JobState::Pending,
            JobState::Submitted,
            TransitionFields::none()
                .with_cluster_id("j-on-worker-b")
                .with_owner("worker-b"),
        )
        .await
        .unwrap();
    h.registry.heartbeat("worker-b", Utc::now()).await.unwrap();

    let reconciler = reconciler(&h);
    let summary = reconciler
        .sweep_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(
        summary,
        ReconcileSummary {
            examined: 1,
            owned_elsewhere: 1,
            ..Default::default()
        }
    );
    assert_eq!(h.record(&n).await.state, JobState::Submitted);

    // worker-b went away an hour ago.
    h.registry
        .heartbeat("worker-b", Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let summary = reconciler
        .sweep_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(summary.lost, 1);
    let record = h.record(&n).await;
    assert_eq!(record.state, JobState::Failed);
    assert!(record.last_error.unwrap().contains("worker-b stopped heartbeating"));
}

#[tokio::test]
async fn reconciler_heartbeat_marks_this_instance_alive() {
    let h = Harness::new(ScriptedBackend::default(), default_steps());
    assert!(h.registry.last_heartbeat(INSTANCE_ID).await.unwrap().is_none());

    reconciler(&h).heartbeat().await.unwrap();
    let seen = h.registry.last_heartbeat(INSTANCE_ID).await.unwrap().unwrap();
    assert!(Utc::now() - seen < chrono::Duration::seconds(5));
}

#[tokio::test]
async fn reconciler_leaves_running_clusters_and_fresh_records_alone() {
    let backend = ScriptedBackend {
        hang_steps: true,
        ..Default::default()
    };
    let h = Harness::new(backend, default_steps());
    let n = h.notify("data/input1.csv").await;
    h.dispatch_all().await;

    let fresh = reconciler(&h).sweep().await.unwrap();
    assert_eq!(fresh, ReconcileSummary::default());

    let summary = reconciler(&h)
        .sweep_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(summary.still_running, 1);
    assert_eq!(h.record(&n).await.state, JobState::Submitted);

    h.clusters.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: retention never removes records that are still in flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_removes_only_old_terminal_records() {
    let backend = ScriptedBackend {
        hang_steps: true,
        ..Default::default()
    };
    let h = Harness::new(backend, default_steps());
    let running = h.notify("data/running.csv").await;
    h.dispatch_all().await;

    let finished = notification("data/finished.csv");
    let fingerprint = finished.fingerprint();
    h.registry
        .try_create(NewJobRecord {
            job_id: job_id_for(&fingerprint, 0),
            fingerprint: fingerprint.clone(),
            source: finished.source.clone(),
            content_version: finished.content_version(),
        })
        .await
        .unwrap();
    h.registry
        .transition(
            &fingerprint,
            JobState::Pending,
            JobState::Failed,
            TransitionFields::none().with_error("rejected"),
        )
        .await
        .unwrap();

    let sweeper = RetentionSweeper::new(h.registry.clone(), 30);
    let purged = sweeper
        .sweep_at(Utc::now() + chrono::Duration::days(31))
        .await
        .unwrap();

    assert_eq!(purged, 1);
    assert_matches!(h.registry.get(&fingerprint).await, Ok(None));
    assert_eq!(h.record(&running).await.state, JobState::Submitted);

    h.clusters.shutdown().await;
}
