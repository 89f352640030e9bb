//! Progress log integration tests.
//!
//! Round-trip, ordering, snapshot, retention, and subscription behavior.

use tempfile::TempDir;
use uuid::Uuid;

use reelforge::core::ProgressLog;
use reelforge::{EventType, ProgressEvent, Run, RunStatus, StepStatus};

fn run_event(run_id: Uuid, event_type: EventType, status: StepStatus, detail: &str) -> ProgressEvent {
    ProgressEvent::new("proj-1", run_id, None, event_type, status, detail)
}

fn step_event(run_id: Uuid, step: &str, event_type: EventType, status: StepStatus) -> ProgressEvent {
    ProgressEvent::new(
        "proj-1",
        run_id,
        Some(step.to_string()),
        event_type,
        status,
        format!("{} {:?}", step, event_type),
    )
}

#[tokio::test]
async fn test_record_then_read_round_trips() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

    let written = vec![
        run_event(run_id, EventType::RunStarted, StepStatus::Running, "started"),
        step_event(run_id, "curate", EventType::StepStarted, StepStatus::Running),
        step_event(run_id, "curate", EventType::StepCompleted, StepStatus::Completed),
        run_event(run_id, EventType::RunCompleted, StepStatus::Completed, "done"),
    ];
    for event in &written {
        log.append(event).await.unwrap();
    }

    let read = log.read_all().await.unwrap();

    assert_eq!(read.len(), written.len());
    for (w, r) in written.iter().zip(&read) {
        assert_eq!(w.id, r.id);
        assert_eq!(w.event_type, r.event_type);
        assert_eq!(w.detail, r.detail);
    }
}

#[tokio::test]
async fn test_emission_order_preserved() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

    for i in 0..20 {
        log.append(&step_event(
            run_id,
            &format!("step{}", i),
            EventType::StepStarted,
            StepStatus::Running,
        ))
        .await
        .unwrap();
    }

    let events = log.read_all().await.unwrap();
    assert_eq!(events.len(), 20);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step_name.as_deref(), Some(format!("step{}", i).as_str()));
    }
}

#[tokio::test]
async fn test_snapshot_reflects_latest_fold() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

    log.append(&run_event(run_id, EventType::RunStarted, StepStatus::Running, "started"))
        .await
        .unwrap();
    log.append(&step_event(run_id, "narrate", EventType::StepStarted, StepStatus::Running))
        .await
        .unwrap();

    let mid: Run = log.read_snapshot().await.unwrap().unwrap();
    assert_eq!(mid.status, RunStatus::Running);
    assert_eq!(mid.step_status("narrate"), StepStatus::Running);

    log.append(
        &step_event(run_id, "narrate", EventType::StepFailed, StepStatus::Failed)
            .with_error("voice farm down"),
    )
    .await
    .unwrap();
    log.append(
        &run_event(run_id, EventType::RunFailed, StepStatus::Failed, "Run failed at step 'narrate'")
            .with_error("voice farm down"),
    )
    .await
    .unwrap();

    let done: Run = log.read_snapshot().await.unwrap().unwrap();
    assert!(!done.is_running());
    assert_eq!(done.step_status("narrate"), StepStatus::Failed);
    assert_eq!(
        done.steps.get("narrate").unwrap().error.as_deref(),
        Some("voice farm down")
    );
}

#[tokio::test]
async fn test_retention_keeps_terminal_events() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let log = ProgressLog::open_in(temp.path(), run_id)
        .await
        .unwrap()
        .with_max_events(10);

    // An early completed step whose terminal event must survive trimming
    log.append(&step_event(run_id, "curate", EventType::StepCompleted, StepStatus::Completed))
        .await
        .unwrap();

    // Flood with retry noise from a flaky later step
    for _ in 0..40 {
        log.append(&step_event(run_id, "score", EventType::StepRetrying, StepStatus::Running))
            .await
            .unwrap();
    }
    log.append(&step_event(run_id, "score", EventType::StepFallback, StepStatus::Fallback))
        .await
        .unwrap();

    let events = log.read_all().await.unwrap();
    assert!(events.len() <= 11, "retention cap not applied: {}", events.len());

    assert!(
        events.iter().any(|e| e.event_type == EventType::StepCompleted
            && e.step_name.as_deref() == Some("curate")),
        "most recent terminal event for 'curate' was trimmed"
    );
    assert!(events.iter().any(|e| e.event_type == EventType::StepFallback
        && e.step_name.as_deref() == Some("score")));

    // The fold over the trimmed log still reports correct terminal state
    let run = Run::from_events(&events).unwrap();
    assert_eq!(run.step_status("curate"), StepStatus::Completed);
    assert_eq!(run.step_status("score"), StepStatus::Fallback);
}

#[tokio::test]
async fn test_subscription_delivers_in_order() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let log = ProgressLog::open_in(temp.path(), run_id).await.unwrap();

    let mut rx = log.subscribe();

    for i in 0..5 {
        log.append(&step_event(
            run_id,
            &format!("step{}", i),
            EventType::StepStarted,
            StepStatus::Running,
        ))
        .await
        .unwrap();
    }

    for i in 0..5 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.step_name.as_deref(), Some(format!("step{}", i).as_str()));
    }
}

#[tokio::test]
async fn test_runs_isolated_by_correlation_id() {
    let temp = TempDir::new().unwrap();
    let run_a = Uuid::new_v4();
    let run_b = Uuid::new_v4();

    let log_a = ProgressLog::open_in(temp.path(), run_a).await.unwrap();
    let log_b = ProgressLog::open_in(temp.path(), run_b).await.unwrap();

    log_a
        .append(&run_event(run_a, EventType::RunStarted, StepStatus::Running, "a"))
        .await
        .unwrap();
    log_b
        .append(&run_event(run_b, EventType::RunStarted, StepStatus::Running, "b"))
        .await
        .unwrap();
    log_b
        .append(&run_event(run_b, EventType::RunCompleted, StepStatus::Completed, "b done"))
        .await
        .unwrap();

    assert_eq!(log_a.read_all().await.unwrap().len(), 1);
    assert_eq!(log_b.read_all().await.unwrap().len(), 2);

    let mut listed = ProgressLog::list_runs_in(temp.path()).await.unwrap();
    listed.sort();
    let mut expected = vec![run_a, run_b];
    expected.sort();
    assert_eq!(listed, expected);
}
