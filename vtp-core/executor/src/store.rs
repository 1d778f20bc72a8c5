//! 计划来源与结果存储接口
//!
//! 执行引擎只依赖这两个 trait; SQLite 实现见 [`crate::persistence`],
//! 这里提供一个进程内实现, 用于独立的引擎实例和测试。

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::plan::{Step, TestPlan};
use crate::result::{Run, RunSummary};
use crate::{ExecutorError, Result};

/// 计划来源
#[async_trait]
pub trait PlanSource: Send + Sync {
    /// 读取计划在当前时刻的一致快照
    async fn load_plan(&self, plan_id: &str) -> Result<Option<TestPlan>>;
}

/// 执行结果存储与失败索引
///
/// 终态执行记录不可再修改。
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 记录一次运行中的执行
    async fn begin_run(&self, run: &Run) -> Result<()>;

    /// 原子地写入终态与结果树; 通过/失败的执行同时替换计划的失败索引
    async fn complete_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// 计划最近一次结束的执行
    async fn latest_run(&self, plan_id: &str) -> Result<Option<Run>>;

    /// 执行历史, 最新的在前
    async fn list_runs(&self, plan_id: Option<&str>, limit: Option<usize>)
        -> Result<Vec<RunSummary>>;

    /// 计划当前的失败步骤索引
    async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>>;
}

#[derive(Default)]
struct MemoryState {
    plans: HashMap<String, TestPlan>,
    /// 按开始顺序
    runs: Vec<Run>,
    failed: HashMap<String, Vec<String>>,
}

/// 进程内的计划与结果存储
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存计划 (缺少的 ID 会被补齐), 返回计划 ID
    pub async fn insert_plan(&self, mut plan: TestPlan) -> Result<String> {
        plan.fill_missing_ids();
        plan.validate()?;

        let id = plan.id.clone();
        let mut state = self.state.write().await;
        state.failed.remove(&id);
        state.plans.insert(id.clone(), plan);

        Ok(id)
    }

    /// 删除计划及其失败索引, 执行历史保留
    pub async fn remove_plan(&self, plan_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .plans
            .remove(plan_id)
            .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.to_string()))?;
        state.failed.remove(plan_id);
        Ok(())
    }

    /// 编辑步骤, 同时从失败索引中移除
    pub async fn update_step(&self, plan_id: &str, step: Step) -> Result<()> {
        let mut state = self.state.write().await;
        let plan = state
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.to_string()))?;

        let slot = plan
            .scenarios
            .iter_mut()
            .flat_map(|s| s.cases.iter_mut())
            .flat_map(|c| c.steps.iter_mut())
            .find(|s| s.id == step.id)
            .ok_or_else(|| ExecutorError::NodeNotFound(step.id.clone()))?;

        let step_id = step.id.clone();
        *slot = step;

        if let Some(failed) = state.failed.get_mut(plan_id) {
            failed.retain(|id| id != &step_id);
        }

        Ok(())
    }
}

#[async_trait]
impl PlanSource for MemoryStore {
    async fn load_plan(&self, plan_id: &str) -> Result<Option<TestPlan>> {
        Ok(self.state.read().await.plans.get(plan_id).cloned())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn begin_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.write().await;
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(ExecutorError::DuplicateRun(run.id.clone()));
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn complete_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.write().await;

        let slot = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| ExecutorError::RunNotFound(run.id.clone()))?;

        if slot.status.is_terminal() {
            return Err(ExecutorError::RunImmutable(run.id.clone()));
        }
        *slot = run.clone();

        if run.status.is_completed() {
            let present: HashSet<String> = state
                .plans
                .get(&run.plan_id)
                .map(|p| p.steps().map(|s| s.id.clone()).collect())
                .unwrap_or_default();

            if !present.is_empty() {
                let failed: Vec<String> = run
                    .root
                    .failed_step_ids()
                    .into_iter()
                    .filter(|id| present.contains(id))
                    .collect();
                debug!("计划 {} 失败索引更新为 {} 个步骤", run.plan_id, failed.len());
                state.failed.insert(run.plan_id.clone(), failed);
            }
        }

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn latest_run(&self, plan_id: &str) -> Result<Option<Run>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .find(|r| r.plan_id == plan_id && r.status.is_terminal())
            .cloned())
    }

    async fn list_runs(
        &self,
        plan_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunSummary>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| plan_id.map_or(true, |id| r.plan_id == id))
            .take(limit.unwrap_or(usize::MAX))
            .map(Run::summary)
            .collect())
    }

    async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.failed.get(plan_id).cloned().unwrap_or_default())
    }
}
