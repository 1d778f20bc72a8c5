//! 执行协调器
//!
//! 负责计划级互斥、执行任务的派生与取消、增量状态发布以及结果持久化。
//! 每次执行运行在独立的 tokio 任务中, 不同计划可以并发执行。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use vtp_protocol::AdapterRegistry;

use crate::plan::TestPlan;
use crate::report::RunReport;
use crate::result::{ExecutionMode, Run, RunCounts, RunStatus, RunSummary};
use crate::runner::{StepRunner, DEFAULT_STEP_TIMEOUT};
use crate::store::{PlanSource, ResultStore};
use crate::walker::{PlanWalker, Selection};
use crate::{ExecutorError, Result};

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 步骤未指定超时时使用的默认值
    pub default_step_timeout: Duration,

    /// 内存中保留的已结束执行数量
    pub retain_finished_runs: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            retain_finished_runs: 64,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 计划锁表
#[derive(Default)]
struct PlanLocks {
    held: Mutex<HashSet<String>>,
}

impl PlanLocks {
    fn try_acquire(self: &Arc<Self>, plan_id: &str) -> Option<PlanLockGuard> {
        if !lock(&self.held).insert(plan_id.to_string()) {
            return None;
        }
        Some(PlanLockGuard {
            locks: Arc::clone(self),
            plan_id: plan_id.to_string(),
        })
    }

    fn is_held(&self, plan_id: &str) -> bool {
        lock(&self.held).contains(plan_id)
    }
}

/// 计划锁, 释放时从锁表移除
struct PlanLockGuard {
    locks: Arc<PlanLocks>,
    plan_id: String,
}

impl Drop for PlanLockGuard {
    fn drop(&mut self) {
        lock(&self.locks.held).remove(&self.plan_id);
        debug!("释放计划锁: {}", self.plan_id);
    }
}

struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<Run>,
    /// 遍历已结束, 结果不再受取消影响
    sealed: bool,
}

#[derive(Default)]
struct RunTable {
    active: HashMap<String, RunHandle>,
    finished: VecDeque<Run>,
}

impl RunTable {
    fn cached(&self, run_id: &str) -> Option<Run> {
        if let Some(handle) = self.active.get(run_id) {
            return Some(handle.state.borrow().clone());
        }
        self.finished.iter().find(|r| r.id == run_id).cloned()
    }
}

struct Inner {
    plans: Arc<dyn PlanSource>,
    store: Arc<dyn ResultStore>,
    runner: StepRunner,
    config: CoordinatorConfig,
    locks: Arc<PlanLocks>,
    runs: Mutex<RunTable>,
}

/// 执行协调器
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    pub fn new(
        plans: Arc<dyn PlanSource>,
        store: Arc<dyn ResultStore>,
        registry: Arc<AdapterRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let runner = StepRunner::new(registry).with_timeout(config.default_step_timeout);

        Self {
            inner: Arc::new(Inner {
                plans,
                store,
                runner,
                config,
                locks: Arc::new(PlanLocks::default()),
                runs: Mutex::new(RunTable::default()),
            }),
        }
    }

    /// 启动一次执行, 返回执行 ID
    ///
    /// 计划已在执行时立即返回 [`ExecutorError::Busy`], 不产生任何记录。
    /// 选择无效或持久化失败时执行不会被创建。
    pub async fn start_run(&self, plan_id: &str, mode: ExecutionMode) -> Result<String> {
        let guard = self
            .inner
            .locks
            .try_acquire(plan_id)
            .ok_or_else(|| ExecutorError::Busy(plan_id.to_string()))?;

        let plan = self
            .inner
            .plans
            .load_plan(plan_id)
            .await?
            .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.to_string()))?;

        let failed = match mode {
            ExecutionMode::LastFailed => self.inner.store.failed_steps(plan_id).await?,
            _ => Vec::new(),
        };
        let selection = Selection::resolve(&plan, &mode, &failed)?;

        let run = Run::start(Uuid::new_v4().to_string(), &plan, mode);
        self.inner.store.begin_run(&run).await?;

        info!(
            "启动执行 {} (计划 '{}', 模式 {}, {} 个步骤)",
            run.id,
            plan.name,
            run.mode,
            selection.len()
        );

        let run_id = run.id.clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(run.clone());

        lock(&self.inner.runs).active.insert(
            run_id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                state: rx,
                sealed: false,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.execute(run, plan, selection, cancel, tx, guard).await;
        });

        Ok(run_id)
    }

    /// 取消执行; 执行已结束或已进入结果汇总时返回 false
    ///
    /// 返回 true 时执行最终状态一定是 cancelled。
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        {
            let table = lock(&self.inner.runs);
            if let Some(handle) = table.active.get(run_id) {
                if handle.sealed || handle.state.borrow().status.is_terminal() {
                    return Ok(false);
                }
                info!("取消执行: {}", run_id);
                handle.cancel.cancel();
                return Ok(true);
            }
            if table.finished.iter().any(|r| r.id == run_id) {
                return Ok(false);
            }
        }

        match self.inner.store.get_run(run_id).await? {
            Some(_) => Ok(false),
            None => Err(ExecutorError::RunNotFound(run_id.to_string())),
        }
    }

    /// 查询执行状态
    ///
    /// 运行中的执行只包含已汇总完成的场景。
    pub async fn get_run_status(&self, run_id: &str) -> Result<Run> {
        if let Some(run) = self.cached(run_id) {
            return Ok(run);
        }

        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))
    }

    /// 等待执行结束
    pub async fn wait_run(&self, run_id: &str) -> Result<Run> {
        let receiver = lock(&self.inner.runs)
            .active
            .get(run_id)
            .map(|h| h.state.clone());

        if let Some(mut rx) = receiver {
            if let Ok(run) = rx
                .wait_for(|r| r.status.is_terminal())
                .await
                .map(|r| (*r).clone())
            {
                return Ok(run);
            }
        }

        self.get_run_status(run_id).await
    }

    /// 计划当前的失败步骤索引
    pub async fn get_last_failed_nodes(&self, plan_id: &str) -> Result<Vec<String>> {
        self.inner.store.failed_steps(plan_id).await
    }

    /// 导出已结束执行的报告
    pub async fn export_run(&self, run_id: &str) -> Result<RunReport> {
        let run = self.get_run_status(run_id).await?;
        if !run.status.is_terminal() {
            return Err(ExecutorError::RunNotFinished(run_id.to_string()));
        }
        Ok(RunReport::from(run))
    }

    /// 执行历史, 最新的在前
    pub async fn list_runs(
        &self,
        plan_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunSummary>> {
        self.inner.store.list_runs(plan_id, limit).await
    }

    /// 计划是否正在执行
    pub fn is_plan_running(&self, plan_id: &str) -> bool {
        self.inner.locks.is_held(plan_id)
    }

    /// 运行中的执行 ID
    pub fn active_runs(&self) -> Vec<String> {
        lock(&self.inner.runs).active.keys().cloned().collect()
    }

    fn cached(&self, run_id: &str) -> Option<Run> {
        lock(&self.inner.runs).cached(run_id)
    }
}

impl Inner {
    async fn execute(
        self: Arc<Self>,
        mut run: Run,
        plan: TestPlan,
        selection: Selection,
        cancel: CancellationToken,
        tx: watch::Sender<Run>,
        guard: PlanLockGuard,
    ) {
        let root = PlanWalker::new(&self.runner)
            .walk(&plan, &selection, &cancel, |scenario| {
                let scenario = scenario.clone();
                tx.send_modify(|r| {
                    r.root.children.push(scenario);
                    r.counts = RunCounts {
                        total_steps: r.counts.total_steps,
                        ..RunCounts::from_tree(&r.root)
                    };
                });
            })
            .await;

        // 与 cancel_run 在同一把锁下判定, 确认取消与最终状态一致
        let cancelled = {
            let mut table = lock(&self.runs);
            if let Some(handle) = table.active.get_mut(&run.id) {
                handle.sealed = true;
            }
            cancel.is_cancelled()
        };

        run.complete(root);
        if cancelled && run.status != RunStatus::Cancelled {
            info!("执行 {} 在遍历结束后收到取消", run.id);
            run.mark_cancelled();
        }

        if let Err(e) = self.store.complete_run(&run).await {
            error!("执行 {} 结果保存失败: {}", run.id, e);
            run.fail(e.to_string());
            if let Err(e) = self.store.complete_run(&run).await {
                error!("执行 {} 错误状态保存失败: {}", run.id, e);
            }
        }

        // 先释放计划锁, 观察到终态的调用方可以立即再次启动
        drop(guard);

        info!(
            "执行 {} 结束: {} (通过 {}, 失败 {}, 错误 {}, 跳过 {}, 取消 {})",
            run.id,
            run.status,
            run.counts.passed,
            run.counts.failed,
            run.counts.error,
            run.counts.skipped,
            run.counts.cancelled
        );

        let mut table = lock(&self.runs);
        tx.send_replace(run.clone());
        table.active.remove(&run.id);
        table.finished.push_back(run);
        while table.finished.len() > self.config.retain_finished_runs {
            if let Some(evicted) = table.finished.pop_front() {
                debug!("移出内存缓存: {}", evicted.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ExpectSpec;
    use crate::plan::{Scenario, Step, TestCase};
    use crate::result::{NodeStatus, RunStatus};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vtp_protocol::{MockResponse, MockServiceAdapter, ProtocolKind};

    fn step(id: &str, method: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            protocol: ProtocolKind::Rpc,
            payload: json!({ "method": method }),
            expected: ExpectSpec::object([("ok", ExpectSpec::exact(json!(true)))]),
            timeout_ms: Some(60_000),
        }
    }

    /// P / S1 / C1 [A, B]
    fn plan(id: &str, steps: Vec<Step>) -> TestPlan {
        TestPlan {
            id: id.to_string(),
            name: format!("plan {}", id),
            description: None,
            scenarios: vec![Scenario {
                id: format!("{}-S1", id),
                name: "s1".to_string(),
                description: None,
                cases: vec![TestCase {
                    id: format!("{}-C1", id),
                    name: "c1".to_string(),
                    description: None,
                    steps,
                }],
            }],
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        adapter: Arc<MockServiceAdapter>,
        coordinator: ExecutionCoordinator,
    }

    async fn fixture_with(results: Arc<dyn ResultStore>, store: Arc<MemoryStore>) -> Fixture {
        let adapter = Arc::new(
            MockServiceAdapter::echo(ProtocolKind::Rpc)
                .with_response("good", MockResponse::value(json!({"ok": true})))
                .with_response("bad", MockResponse::value(json!({"ok": false})))
                .with_response("slow", MockResponse::value(json!({"ok": true})).with_delay(30_000)),
        );
        let registry = Arc::new(AdapterRegistry::new());
        registry.register(adapter.clone()).await.unwrap();

        store
            .insert_plan(plan("P", vec![step("A", "good"), step("B", "bad")]))
            .await
            .unwrap();
        store
            .insert_plan(plan("Q", vec![step("X", "slow")]))
            .await
            .unwrap();

        let coordinator =
            ExecutionCoordinator::new(store.clone(), results, registry, CoordinatorConfig::default());

        Fixture {
            store,
            adapter,
            coordinator,
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_with(store.clone(), store).await
    }

    fn status(run: &Run, id: &str) -> NodeStatus {
        run.root.find(id).map(|n| n.status).unwrap()
    }

    #[tokio::test]
    async fn test_full_then_last_failed() {
        let f = fixture().await;
        let c = &f.coordinator;

        let id = c.start_run("P", ExecutionMode::Full).await.unwrap();
        let run = c.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(status(&run, "P-S1"), NodeStatus::Failed);
        assert_eq!(status(&run, "P-C1"), NodeStatus::Failed);
        assert_eq!(status(&run, "A"), NodeStatus::Passed);
        assert_eq!(status(&run, "B"), NodeStatus::Failed);
        assert_eq!(c.get_last_failed_nodes("P").await.unwrap(), vec!["B".to_string()]);

        let id = c.start_run("P", ExecutionMode::LastFailed).await.unwrap();
        let run = c.wait_run(&id).await.unwrap();
        assert_eq!(run.counts.executed, 1);
        assert_eq!(status(&run, "A"), NodeStatus::Skipped);
        assert_eq!(status(&run, "B"), NodeStatus::Failed);

        f.adapter
            .set_response("bad", MockResponse::value(json!({"ok": true})))
            .await;
        let id = c.start_run("P", ExecutionMode::LastFailed).await.unwrap();
        let run = c.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert!(c.get_last_failed_nodes("P").await.unwrap().is_empty());

        // 没有失败步骤时什么也不执行
        let id = c.start_run("P", ExecutionMode::LastFailed).await.unwrap();
        let run = c.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.counts.executed, 0);
        assert_eq!(run.root.status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_busy_until_finished() {
        let f = fixture().await;
        let c = &f.coordinator;

        let first = c.start_run("P", ExecutionMode::Full).await.unwrap();
        let err = c.start_run("P", ExecutionMode::Full).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Busy(_)));
        assert_eq!(f.store.list_runs(Some("P"), None).await.unwrap().len(), 1);

        c.wait_run(&first).await.unwrap();
        assert!(!c.is_plan_running("P"));
        let second = c.start_run("P", ExecutionMode::Full).await.unwrap();
        assert_ne!(first, second);
        c.wait_run(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_plans_run_concurrently() {
        let f = fixture().await;
        let c = &f.coordinator;

        let slow = c.start_run("Q", ExecutionMode::Full).await.unwrap();
        let quick = c.start_run("P", ExecutionMode::Full).await.unwrap();
        assert_eq!(c.wait_run(&quick).await.unwrap().status, RunStatus::Failed);

        assert!(c.cancel_run(&slow).await.unwrap());
        assert_eq!(c.wait_run(&slow).await.unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let f = fixture().await;
        let c = &f.coordinator;

        let id = c.start_run("Q", ExecutionMode::Full).await.unwrap();
        assert!(c.cancel_run(&id).await.unwrap());

        let run = c.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(status(&run, "X"), NodeStatus::Cancelled);
        assert_eq!(run.counts.cancelled, 1);

        // 取消的执行不影响失败索引
        assert!(c.get_last_failed_nodes("Q").await.unwrap().is_empty());
        assert!(!c.cancel_run(&id).await.unwrap());
        assert!(matches!(
            c.cancel_run("missing").await,
            Err(ExecutorError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_run_leaves_history_untouched() {
        let f = fixture().await;
        let c = &f.coordinator;

        let full = c.start_run("P", ExecutionMode::Full).await.unwrap();
        let before = c.wait_run(&full).await.unwrap();

        let partial = c
            .start_run("P", ExecutionMode::partial(["A"]))
            .await
            .unwrap();
        let run = c.wait_run(&partial).await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.counts.executed, 1);
        assert_eq!(status(&run, "B"), NodeStatus::Skipped);

        assert_eq!(c.get_run_status(&full).await.unwrap(), before);
        assert!(c.get_last_failed_nodes("P").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_selection_creates_no_run() {
        let f = fixture().await;
        let c = &f.coordinator;

        let err = c
            .start_run("P", ExecutionMode::partial(["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NodeNotFound(_)));

        let err = c.start_run("missing", ExecutionMode::Full).await.unwrap_err();
        assert!(matches!(err, ExecutorError::PlanNotFound(_)));

        assert!(c.list_runs(None, None).await.unwrap().is_empty());
        assert!(!c.is_plan_running("P"));
    }

    #[tokio::test]
    async fn test_export_requires_finished_run() {
        let f = fixture().await;
        let c = &f.coordinator;

        let id = c.start_run("Q", ExecutionMode::Full).await.unwrap();
        assert!(matches!(
            c.export_run(&id).await,
            Err(ExecutorError::RunNotFinished(_))
        ));

        c.cancel_run(&id).await.unwrap();
        c.wait_run(&id).await.unwrap();
        let report = c.export_run(&id).await.unwrap();
        assert_eq!(report.run_id, id);
        assert_eq!(report.status, RunStatus::Cancelled);
    }

    /// 前 `failures` 次 complete_run 失败的存储
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn begin_run(&self, run: &Run) -> Result<()> {
            self.inner.begin_run(run).await
        }

        async fn complete_run(&self, run: &Run) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ExecutorError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.complete_run(run).await
        }

        async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
            self.inner.get_run(run_id).await
        }

        async fn latest_run(&self, plan_id: &str) -> Result<Option<Run>> {
            self.inner.latest_run(plan_id).await
        }

        async fn list_runs(
            &self,
            plan_id: Option<&str>,
            limit: Option<usize>,
        ) -> Result<Vec<RunSummary>> {
            self.inner.list_runs(plan_id, limit).await
        }

        async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>> {
            self.inner.failed_steps(plan_id).await
        }
    }

    /// 保存结果前通知测试, 并延迟写入
    struct SlowStore {
        inner: Arc<MemoryStore>,
        saving: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ResultStore for SlowStore {
        async fn begin_run(&self, run: &Run) -> Result<()> {
            self.inner.begin_run(run).await
        }

        async fn complete_run(&self, run: &Run) -> Result<()> {
            self.saving.notify_one();
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.inner.complete_run(run).await
        }

        async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
            self.inner.get_run(run_id).await
        }

        async fn latest_run(&self, plan_id: &str) -> Result<Option<Run>> {
            self.inner.latest_run(plan_id).await
        }

        async fn list_runs(
            &self,
            plan_id: Option<&str>,
            limit: Option<usize>,
        ) -> Result<Vec<RunSummary>> {
            self.inner.list_runs(plan_id, limit).await
        }

        async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>> {
            self.inner.failed_steps(plan_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_saving_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let saving = Arc::new(tokio::sync::Notify::new());
        let slow = Arc::new(SlowStore {
            inner: store.clone(),
            saving: saving.clone(),
        });
        let f = fixture_with(slow, store.clone()).await;

        let id = f.coordinator.start_run("P", ExecutionMode::Full).await.unwrap();
        saving.notified().await;

        assert!(!f.coordinator.cancel_run(&id).await.unwrap());

        let run = f.coordinator.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(store.failed_steps("P").await.unwrap(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_persistence_failure_ends_in_error() {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicUsize::new(1),
        });
        let f = fixture_with(flaky, store.clone()).await;

        let id = f.coordinator.start_run("P", ExecutionMode::Full).await.unwrap();
        let run = f.coordinator.wait_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error.as_deref().unwrap_or_default().contains("disk full"));
        assert_eq!(status(&run, "B"), NodeStatus::Failed);

        let stored = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(store.failed_steps("P").await.unwrap().is_empty());
        assert!(!f.coordinator.is_plan_running("P"));
    }

    #[tokio::test]
    async fn test_unsaved_run_stays_visible() {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicUsize::new(2),
        });
        let f = fixture_with(flaky, store.clone()).await;

        let id = f.coordinator.start_run("P", ExecutionMode::Full).await.unwrap();
        f.coordinator.wait_run(&id).await.unwrap();

        let run = f.coordinator.get_run_status(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(
            store.get_run(&id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }
}
