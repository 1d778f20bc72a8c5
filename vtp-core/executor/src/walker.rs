//! 计划遍历器
//!
//! 按先序深度优先顺序遍历 计划 → 场景 → 用例 → 步骤, 同级节点依次执行,
//! 子节点全部结束后再汇总父节点状态。

use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::plan::{NodeKind, TestPlan};
use crate::result::{ExecutionMode, NodeResult};
use crate::runner::StepRunner;
use crate::{ExecutorError, Result};

/// 本次执行选中的步骤集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    steps: HashSet<String>,
}

impl Selection {
    /// 选中全部步骤
    pub fn all(plan: &TestPlan) -> Self {
        Self {
            steps: plan.steps().map(|s| s.id.clone()).collect(),
        }
    }

    /// 按执行模式解析选中的步骤
    ///
    /// - `full`: 全部步骤
    /// - `last_failed`: 失败索引中仍存在于计划里的步骤
    /// - `partial`: 选中节点及其全部后代步骤; 空集合或未知节点直接拒绝
    pub fn resolve(plan: &TestPlan, mode: &ExecutionMode, failed_steps: &[String]) -> Result<Self> {
        match mode {
            ExecutionMode::Full => Ok(Self::all(plan)),

            ExecutionMode::LastFailed => {
                let present: HashSet<&str> = plan.steps().map(|s| s.id.as_str()).collect();
                let steps = failed_steps
                    .iter()
                    .filter(|id| present.contains(id.as_str()))
                    .cloned()
                    .collect();
                Ok(Self { steps })
            }

            ExecutionMode::Partial { nodes } => {
                if nodes.is_empty() {
                    return Err(ExecutorError::InvalidSelection(
                        "partial execution needs at least one node".to_string(),
                    ));
                }

                let mut steps = HashSet::new();
                for node_id in nodes {
                    let descendants = plan
                        .descendant_steps(node_id)
                        .ok_or_else(|| ExecutorError::NodeNotFound(node_id.clone()))?;
                    steps.extend(descendants.into_iter().map(str::to_string));
                }
                Ok(Self { steps })
            }
        }
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains(step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 计划遍历器
pub struct PlanWalker<'a> {
    runner: &'a StepRunner,
}

impl<'a> PlanWalker<'a> {
    pub fn new(runner: &'a StepRunner) -> Self {
        Self { runner }
    }

    /// 遍历计划, 返回完整的结果树
    ///
    /// 未选中的步骤记录为 skipped; 取消后未执行的选中步骤记录为 cancelled。
    /// 每个场景汇总完成后调用一次 `on_scenario`。
    pub async fn walk<F>(
        &self,
        plan: &TestPlan,
        selection: &Selection,
        cancel: &CancellationToken,
        mut on_scenario: F,
    ) -> NodeResult
    where
        F: FnMut(&NodeResult) + Send,
    {
        info!(
            "开始执行计划: {} ({} / {} 个步骤选中)",
            plan.name,
            selection.len(),
            plan.step_count()
        );

        let mut root = NodeResult::container(NodeKind::Plan, &plan.id, &plan.name, 0);

        for (si, scenario) in plan.scenarios.iter().enumerate() {
            debug!("场景 [{}] {}", si, scenario.name);
            let mut scenario_result =
                NodeResult::container(NodeKind::Scenario, &scenario.id, &scenario.name, si);

            for (ci, case) in scenario.cases.iter().enumerate() {
                let mut case_result =
                    NodeResult::container(NodeKind::TestCase, &case.id, &case.name, ci);

                for (ti, step) in case.steps.iter().enumerate() {
                    let step_result = if selection.contains(&step.id) {
                        self.runner.run(step, ti, cancel).await
                    } else {
                        NodeResult::skipped_step(step, ti)
                    };
                    case_result.children.push(step_result);
                }

                case_result.fold();
                scenario_result.children.push(case_result);
            }

            scenario_result.fold();
            info!("场景 '{}' 结束: {}", scenario.name, scenario_result.status);
            on_scenario(&scenario_result);
            root.children.push(scenario_result);
        }

        root.fold();
        info!("计划 '{}' 执行结束: {}", plan.name, root.status);

        root
    }
}
