// 执行引擎 + SQLite 持久化集成测试
use serde_json::json;
use std::sync::Arc;

use vtp_executor::{
    CoordinatorConfig, ExecutionCoordinator, ExecutionMode, ExecutorError, ExpectSpec, NodeStatus,
    ResultStore, RunStatus, SqliteStore, TestPlan,
};
use vtp_protocol::{AdapterRegistry, MockResponse, MockServiceAdapter, ProtocolKind};
use vtp_storage::{Storage, StorageManager};

const PLAN_YAML: &str = r#"
name: door-regression
scenarios:
  - name: S1
    cases:
      - name: C1
        steps:
          - name: A
            protocol: rpc
            payload:
              method: door.lock
            expected:
              policy: object
              fields:
                result:
                  policy: exact
                  value: ok
          - name: B
            protocol: rpc
            payload:
              method: door.unlock
            expected:
              policy: object
              fields:
                result:
                  policy: exact
                  value: ok
"#;

struct Harness {
    store: Arc<SqliteStore>,
    adapter: Arc<MockServiceAdapter>,
    coordinator: ExecutionCoordinator,
    plan: TestPlan,
}

impl Harness {
    fn step_id(&self, name: &str) -> String {
        self.plan
            .steps()
            .find(|s| s.name == name)
            .map(|s| s.id.clone())
            .expect("step exists")
    }
}

async fn setup(config: CoordinatorConfig) -> Harness {
    let manager = StorageManager::new_in_memory()
        .await
        .expect("Failed to create test database");
    let store = Arc::new(SqliteStore::new(Arc::new(Storage::from_manager(&manager))));

    let plan = store
        .import_plan(&TestPlan::from_yaml_str(PLAN_YAML).unwrap())
        .await
        .unwrap();

    let adapter = Arc::new(
        MockServiceAdapter::echo(ProtocolKind::Rpc)
            .with_response("door.lock", MockResponse::value(json!({"result": "ok"})))
            .with_response("door.unlock", MockResponse::value(json!({"result": "busy"}))),
    );
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(adapter.clone()).await.unwrap();

    let coordinator = ExecutionCoordinator::new(store.clone(), store.clone(), registry, config);

    Harness {
        store,
        adapter,
        coordinator,
        plan,
    }
}

#[tokio::test]
async fn test_full_run_is_persisted() {
    let h = setup(CoordinatorConfig::default()).await;
    let c = &h.coordinator;

    let run_id = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    let run = c.wait_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let stored = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.counts, run.counts);
    assert_eq!(stored.root.walk().len(), 5);

    let b = stored.root.find(&h.step_id("B")).unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    assert_eq!(b.actual, Some(json!({"result": "busy"})));
    assert!(!b.diff.as_ref().unwrap().passed);
    assert_eq!(b.protocol, Some(ProtocolKind::Rpc));

    assert_eq!(
        c.get_last_failed_nodes(&h.plan.id).await.unwrap(),
        vec![h.step_id("B")]
    );

    let history = c.list_runs(Some(&h.plan.id), None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_last_failed_cycle() {
    let h = setup(CoordinatorConfig::default()).await;
    let c = &h.coordinator;

    let first = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    c.wait_run(&first).await.unwrap();

    let retry = c.start_run(&h.plan.id, ExecutionMode::LastFailed).await.unwrap();
    let run = c.wait_run(&retry).await.unwrap();
    assert_eq!(run.counts.executed, 1);
    assert_eq!(
        run.root.find(&h.step_id("A")).unwrap().status,
        NodeStatus::Skipped
    );

    h.adapter
        .set_response("door.unlock", MockResponse::value(json!({"result": "ok"})))
        .await;
    let fixed = c.start_run(&h.plan.id, ExecutionMode::LastFailed).await.unwrap();
    let run = c.wait_run(&fixed).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert!(c.get_last_failed_nodes(&h.plan.id).await.unwrap().is_empty());

    // 早先的执行记录保持不变
    let stored = h.store.get_run(&first).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(
        stored.root.find(&h.step_id("B")).unwrap().status,
        NodeStatus::Failed
    );
}

#[tokio::test]
async fn test_edited_step_leaves_failed_index() {
    let h = setup(CoordinatorConfig::default()).await;
    let c = &h.coordinator;

    let run_id = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    c.wait_run(&run_id).await.unwrap();

    let b = h.step_id("B");
    let record = h.store.storage().steps().get_by_id(&b).await.unwrap().unwrap();
    let mut step = vtp_executor::step_from_record(&record).unwrap();
    step.timeout_ms = Some(1_000);
    h.store
        .storage()
        .steps()
        .update(&b, &vtp_executor::step_draft(&step).unwrap())
        .await
        .unwrap();

    assert!(c.get_last_failed_nodes(&h.plan.id).await.unwrap().is_empty());

    let retry = c.start_run(&h.plan.id, ExecutionMode::LastFailed).await.unwrap();
    let run = c.wait_run(&retry).await.unwrap();
    assert_eq!(run.counts.executed, 0);
    assert_eq!(run.status, RunStatus::Passed);
}

#[tokio::test]
async fn test_plan_edits_keep_recorded_run() {
    let h = setup(CoordinatorConfig::default()).await;
    let c = &h.coordinator;

    let first = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    c.wait_run(&first).await.unwrap();
    let recorded = h.store.get_run(&first).await.unwrap().unwrap();

    // 修改步骤 B 的名称和期望值
    let b = h.step_id("B");
    let record = h.store.storage().steps().get_by_id(&b).await.unwrap().unwrap();
    let mut step = vtp_executor::step_from_record(&record).unwrap();
    let original_expected = step.expected.clone();
    step.name = "B-renamed".to_string();
    step.expected = ExpectSpec::ExistsOnly;
    h.store
        .storage()
        .steps()
        .update(&b, &vtp_executor::step_draft(&step).unwrap())
        .await
        .unwrap();

    // 复制场景并移到最前, 再删除原场景
    let scenarios = h.store.storage().scenarios();
    let s1 = h.plan.scenarios[0].id.clone();
    let copy = scenarios.copy(&s1).await.unwrap();
    scenarios.move_to(&copy.id, 0).await.unwrap();
    scenarios.delete(&s1).await.unwrap();

    let after = h.store.get_run(&first).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Failed);
    assert_eq!(after.counts, recorded.counts);
    assert_eq!(after.root.walk().len(), recorded.root.walk().len());

    let scenario = after.root.find(&s1).unwrap();
    assert_eq!(scenario.name, "S1");
    assert_eq!(scenario.position, 0);

    let recorded_b = after.root.find(&b).unwrap();
    assert_eq!(recorded_b.name, "B");
    assert_eq!(recorded_b.position, 1);
    assert_eq!(recorded_b.status, NodeStatus::Failed);
    assert_eq!(recorded_b.expected.as_ref(), Some(&original_expected));
    assert!(after.root.find(&copy.id).is_none());

    // 新执行使用修改后的计划
    let second = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    let run = c.wait_run(&second).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert!(run.root.find(&s1).is_none());
    assert!(run.root.find(&copy.id).is_some());
    assert!(run
        .root
        .steps()
        .iter()
        .any(|s| s.name == "B-renamed" && s.expected == Some(ExpectSpec::ExistsOnly)));
}

#[tokio::test]
async fn test_evicted_run_reloads_from_database() {
    let h = setup(CoordinatorConfig {
        retain_finished_runs: 0,
        ..Default::default()
    })
    .await;
    let c = &h.coordinator;

    let run_id = c
        .start_run(&h.plan.id, ExecutionMode::partial([h.step_id("A")]))
        .await
        .unwrap();
    let finished = c.wait_run(&run_id).await.unwrap();

    let reloaded = c.get_run_status(&run_id).await.unwrap();
    assert_eq!(reloaded.status, RunStatus::Passed);
    assert_eq!(reloaded.mode, finished.mode);
    assert_eq!(
        reloaded.root.find(&h.step_id("B")).unwrap().status,
        NodeStatus::Skipped
    );

    let report = c.export_run(&run_id).await.unwrap();
    assert_eq!(report.counts.executed, 1);
    assert!(report.to_yaml().unwrap().contains("mode: partial"));
}

#[tokio::test]
async fn test_export_and_reimport_plan() {
    let h = setup(CoordinatorConfig::default()).await;

    let exported = h.store.export_plan("door-regression").await.unwrap();
    assert_eq!(exported, h.plan);

    let mut copy = exported.clone();
    copy.name = "door-regression-2".to_string();
    let imported = h.store.import_plan(&copy).await.unwrap();
    assert_ne!(imported.id, h.plan.id);
    assert_eq!(imported.step_count(), 2);

    // 重名计划被拒绝
    assert!(matches!(
        h.store.import_plan(&exported).await,
        Err(ExecutorError::StorageError(_))
    ));
    assert!(matches!(
        h.store.export_plan("missing").await,
        Err(ExecutorError::PlanNotFound(_))
    ));
}

#[tokio::test]
async fn test_deleted_plan_cannot_start() {
    let h = setup(CoordinatorConfig::default()).await;
    let c = &h.coordinator;

    let run_id = c.start_run(&h.plan.id, ExecutionMode::Full).await.unwrap();
    c.wait_run(&run_id).await.unwrap();

    h.store.storage().plans().delete(&h.plan.id).await.unwrap();

    assert!(matches!(
        c.start_run(&h.plan.id, ExecutionMode::Full).await,
        Err(ExecutorError::PlanNotFound(_))
    ));
    // 执行历史保留
    assert!(h.store.get_run(&run_id).await.unwrap().is_some());
}
