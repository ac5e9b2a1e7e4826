use std::time::Duration;

use factory_mcts_core::{Conversation, Inventory};
use tempfile::TempDir;

use super::*;
use crate::test_support::FakeInstance;
use crate::TaskStatus;

fn setup() -> (Arc<EvalStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EvalStore::open(dir.path()).unwrap());
    (store, dir)
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(5),
        wedged_grace: Duration::from_secs(1),
        holdout_sleep_secs: 60,
    }
}

fn worker(store: &Arc<EvalStore>, instance: &FakeInstance, config: WorkerConfig) -> EvaluatorWorker {
    EvaluatorWorker::new(
        Arc::clone(store),
        "instance-0",
        shared_instance(instance.clone()),
        config,
    )
}

fn enqueue(store: &EvalStore, code: &str) -> (ProgramId, TaskId) {
    store
        .enqueue(&Program::new(code, Conversation::new(), 1))
        .unwrap()
}

fn error_code(store: &EvalStore, task_id: TaskId) -> Option<String> {
    store
        .get_task(task_id)
        .unwrap()
        .unwrap()
        .result
        .and_then(|r| r.error_code)
}

#[tokio::test]
async fn empty_queue_yields_nothing() {
    let (store, _dir) = setup();
    let worker = worker(&store, &FakeInstance::default(), fast_config());
    assert_eq!(worker.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn evaluates_and_persists_reward_and_state() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_reward("noop", 5.0);
    let worker = worker(&store, &instance, fast_config());
    let (program_id, task_id) = enqueue(&store, "noop");

    let report = worker.run_once().await.unwrap().unwrap();
    assert_eq!(report.task_id, task_id);
    assert_eq!(report.outcome, TaskOutcome::Completed { reward: 5.0 });

    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result = task.result.unwrap();
    assert_eq!(result.reward, Some(5.0));
    assert_eq!(result.response.as_deref(), Some("ran noop"));
    assert_eq!(result.baseline_reward, None);

    let program = store.get_program(program_id).unwrap().unwrap();
    assert_eq!(program.value, 5.0);
    assert_eq!(program.visits, 1);
    assert_eq!(program.raw_reward, Some(5.0));
    assert_eq!(program.holdout_value, None);
    assert_eq!(program.state.unwrap().entities(), "after:noop");
}

#[tokio::test]
async fn holdout_reward_is_relative_to_the_baseline() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_reward("build_drill()", 10.0);
    let holdout = FakeInstance::default().with_reward("sleep(60)", 3.0);
    let worker = worker(&store, &instance, fast_config())
        .with_initial_state(GameState::new("start", Inventory::new()))
        .with_holdout(shared_instance(holdout.clone()));
    let (program_id, task_id) = enqueue(&store, "build_drill()");

    worker.run_once().await.unwrap().unwrap();

    let program = store.get_program(program_id).unwrap().unwrap();
    assert_eq!(program.value, 7.0);
    assert_eq!(program.holdout_value, Some(7.0));
    assert_eq!(program.raw_reward, Some(10.0));
    let result = store.get_task(task_id).unwrap().unwrap().result.unwrap();
    assert_eq!(result.baseline_reward, Some(3.0));
    assert_eq!(result.reward, Some(10.0));

    // Both instances start from the same state.
    assert_eq!(holdout.calls(), vec!["import:start", "evaluate:sleep(60)"]);
    assert_eq!(instance.calls(), vec!["import:start", "evaluate:build_drill()"]);
}

#[tokio::test]
async fn one_failing_task_does_not_stop_the_next() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default()
        .failing_on("crash()")
        .with_reward("noop", 1.0);
    let worker = worker(&store, &instance, fast_config());
    let (crash_program, crash_task) = enqueue(&store, "crash()");
    let (_, ok_task) = enqueue(&store, "noop");

    let first = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        first.outcome,
        TaskOutcome::Failed {
            error_code: "evaluation_error"
        }
    );
    let second = worker.run_once().await.unwrap().unwrap();
    assert_eq!(second.task_id, ok_task);

    let failed = store.get_task(crash_task).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.result.unwrap().error.unwrap().contains("nil value"));
    assert!(!store.get_program(crash_program).unwrap().unwrap().is_evaluated());
    assert_eq!(store.get_task(ok_task).unwrap().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn children_start_from_the_parent_state() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default();
    let worker = worker(&store, &instance, fast_config());
    let (parent_id, _) = enqueue(&store, "place_furnace()");
    worker.run_once().await.unwrap().unwrap();

    let parent = store.get_program(parent_id).unwrap().unwrap();
    store
        .enqueue(&Program::child_of(&parent, "feed_coal()", Conversation::new()))
        .unwrap();
    worker.run_once().await.unwrap().unwrap();

    assert_eq!(
        instance.calls(),
        vec![
            "import:",
            "evaluate:place_furnace()",
            "import:after:place_furnace()",
            "evaluate:feed_coal()",
        ]
    );
    assert_eq!(store.get_program(parent_id).unwrap().unwrap().visits, 2);
}

#[tokio::test]
async fn roots_without_initial_state_start_from_the_captured_world() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default();
    let worker = worker(&store, &instance, fast_config());
    let (first, _) = enqueue(&store, "build_furnace()");
    let (second, _) = enqueue(&store, "noop");

    worker.run_once().await.unwrap().unwrap();
    worker.run_once().await.unwrap().unwrap();

    assert_eq!(
        instance.calls(),
        vec!["import:", "evaluate:build_furnace()", "import:", "evaluate:noop"]
    );
    assert_eq!(
        store.get_program(first).unwrap().unwrap().state.unwrap().entities(),
        "after:build_furnace()"
    );
    assert_eq!(
        store.get_program(second).unwrap().unwrap().state.unwrap().entities(),
        "after:noop"
    );
}

#[tokio::test]
async fn captured_world_is_also_the_holdout_start() {
    let (store, _dir) = setup();
    let holdout = FakeInstance::default().with_reward("sleep(60)", 1.0);
    let worker = worker(&store, &FakeInstance::default().with_reward("noop", 4.0), fast_config())
        .with_holdout(shared_instance(holdout.clone()));
    let (_, first) = enqueue(&store, "noop");
    let (_, second) = enqueue(&store, "noop");

    worker.run_once().await.unwrap().unwrap();
    worker.run_once().await.unwrap().unwrap();

    assert_eq!(
        holdout.calls(),
        vec!["import:", "evaluate:sleep(60)", "import:", "evaluate:sleep(60)"]
    );
    for task_id in [first, second] {
        let result = store.get_task(task_id).unwrap().unwrap().result.unwrap();
        assert_eq!(result.baseline_reward, Some(1.0));
    }
}

#[tokio::test]
async fn rejected_restore_fails_the_task_only() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().refusing_import();
    let worker = worker(&store, &instance, fast_config())
        .with_initial_state(GameState::new("start", Inventory::new()));
    let (_, task_id) = enqueue(&store, "noop");

    let report = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        TaskOutcome::Failed {
            error_code: "restore_failed"
        }
    );
    assert_eq!(error_code(&store, task_id).as_deref(), Some("restore_failed"));
    assert!(!instance.calls().contains(&"evaluate:noop".to_string()));
}

#[tokio::test]
async fn holdout_restore_failure_stops_the_worker() {
    let (store, _dir) = setup();
    let holdout = FakeInstance::default().refusing_import();
    let worker = worker(&store, &FakeInstance::default(), fast_config())
        .with_initial_state(GameState::new("start", Inventory::new()))
        .with_holdout(shared_instance(holdout));
    let (_, task_id) = enqueue(&store, "noop");

    let err = worker.run_once().await.unwrap_err();
    assert!(matches!(err, WorkerError::HoldoutRestore(_)));
    assert!(err.is_fatal());
    assert_eq!(store.get_task(task_id).unwrap().unwrap().status, TaskStatus::Failed);
    assert_eq!(error_code(&store, task_id).as_deref(), Some("restore_failed"));
}

#[tokio::test]
async fn slow_evaluation_times_out_and_instance_recovers() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_delay("slow()", Duration::from_millis(300));
    let config = WorkerConfig {
        task_timeout: Duration::from_millis(50),
        wedged_grace: Duration::from_secs(5),
        ..fast_config()
    };
    let worker = worker(&store, &instance, config);
    let (program_id, task_id) = enqueue(&store, "slow()");

    let report = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        TaskOutcome::Failed {
            error_code: "evaluation_timeout"
        }
    );
    assert_eq!(error_code(&store, task_id).as_deref(), Some("evaluation_timeout"));
    // The late result is never written.
    assert!(!store.get_program(program_id).unwrap().unwrap().is_evaluated());
}

#[tokio::test]
async fn evaluation_that_never_returns_wedges_the_instance() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_delay("spin()", Duration::from_millis(500));
    let config = WorkerConfig {
        task_timeout: Duration::from_millis(20),
        wedged_grace: Duration::from_millis(20),
        ..fast_config()
    };
    let worker = worker(&store, &instance, config);
    let (_, task_id) = enqueue(&store, "spin()");

    let err = worker.run_once().await.unwrap_err();
    assert_eq!(
        err,
        WorkerError::InstanceWedged {
            instance_id: "instance-0".into(),
            task_id
        }
    );
    assert_eq!(store.get_task(task_id).unwrap().unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn run_loop_drains_the_queue_until_shutdown() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_reward("noop", 1.0);
    let worker = worker(&store, &instance, fast_config()).for_version(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let tasks: Vec<TaskId> = (0..3).map(|_| enqueue(&store, "noop").1).collect();
    for _ in 0..200 {
        if store.count_by_status().unwrap().completed == tasks.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();

    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn timeout_after_a_revoked_lease_is_not_counted_as_a_failure() {
    let (store, _dir) = setup();
    let instance = FakeInstance::default().with_delay("slow()", Duration::from_millis(400));
    let config = WorkerConfig {
        task_timeout: Duration::from_millis(150),
        wedged_grace: Duration::from_secs(5),
        ..fast_config()
    };
    let worker = worker(&store, &instance, config);
    let (_, task_id) = enqueue(&store, "slow()");

    let reap = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.backdate_started(task_id, 3_600).unwrap();
        store.reap_stale(60, 3).unwrap()
    };
    let (report, reaped) = tokio::join!(worker.run_once(), reap);

    assert_eq!(reaped.requeued, 1);
    assert_eq!(report.unwrap().unwrap().outcome, TaskOutcome::Discarded);
    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.result.is_none());
}
