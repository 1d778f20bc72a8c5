//! SQLite 持久化
//!
//! 基于 `vtp-storage` 实现 [`PlanSource`] 与 [`ResultStore`], 以及计划的导入导出。

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use vtp_protocol::ProtocolKind;
use vtp_storage::{
    CaseTree, FailedIndexUpdate, NodeResultRecord, PlanRecord, PlanTree, RunFilter, RunRecord,
    ScenarioRecord, ScenarioTree, StepDraft, StepRecord, Storage, StorageError, TestCaseRecord,
};

use crate::plan::{NodeKind, Scenario, Step, TestCase, TestPlan};
use crate::result::{
    ExecutionMode, NodeResult, NodeStatus, Run, RunCounts, RunStatus, RunSummary,
};
use crate::store::{PlanSource, ResultStore};
use crate::{ExecutorError, Result};

/// SQLite 存储
#[derive(Clone)]
pub struct SqliteStore {
    storage: Arc<Storage>,
}

impl SqliteStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// 导入计划, 所有节点分配新的 ID; 返回导入后的计划
    pub async fn import_plan(&self, plan: &TestPlan) -> Result<TestPlan> {
        let mut plan = plan.clone();
        plan.assign_fresh_ids();
        plan.validate()?;

        let tree = plan_to_tree(&plan)?;
        self.storage.plans().insert_tree(&tree).await?;

        info!("导入计划 '{}' -> {}", plan.name, plan.id);

        Ok(plan)
    }

    /// 导出计划 (按名称或 ID 查找)
    pub async fn export_plan(&self, name_or_id: &str) -> Result<TestPlan> {
        let plan_id = self.resolve_plan_id(name_or_id).await?;
        self.load_plan(&plan_id)
            .await?
            .ok_or_else(|| ExecutorError::PlanNotFound(name_or_id.to_string()))
    }

    /// 计划名称或 ID 解析为 ID
    pub async fn resolve_plan_id(&self, name_or_id: &str) -> Result<String> {
        if let Some(plan) = self.storage.plans().get_by_id(name_or_id).await? {
            return Ok(plan.id);
        }
        match self.storage.plans().get_by_name(name_or_id).await? {
            Some(plan) => Ok(plan.id),
            None => Err(ExecutorError::PlanNotFound(name_or_id.to_string())),
        }
    }

    async fn load_run(&self, record: RunRecord) -> Result<Run> {
        let results = self.storage.runs().get_results(&record.id).await?;
        run_from_records(record, results)
    }
}

#[async_trait]
impl PlanSource for SqliteStore {
    async fn load_plan(&self, plan_id: &str) -> Result<Option<TestPlan>> {
        match self.storage.plans().load_tree(plan_id).await? {
            Some(tree) => Ok(Some(plan_from_tree(tree)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn begin_run(&self, run: &Run) -> Result<()> {
        self.storage
            .runs()
            .create(&run_to_record(run)?)
            .await
            .map_err(|e| match e {
                StorageError::AlreadyExists(_) => ExecutorError::DuplicateRun(run.id.clone()),
                other => other.into(),
            })
    }

    async fn complete_run(&self, run: &Run) -> Result<()> {
        let record = run_to_record(run)?;
        let results = tree_to_records(&run.id, &run.root)?;
        let index = run.status.is_completed().then(|| FailedIndexUpdate {
            plan_id: run.plan_id.clone(),
            step_ids: run.root.failed_step_ids(),
        });

        debug!("写入执行 {} 的 {} 条节点结果", run.id, results.len());

        self.storage
            .runs()
            .complete(&record, &results, index.as_ref())
            .await
            .map_err(|e| match e {
                StorageError::Immutable(_) => ExecutorError::RunImmutable(run.id.clone()),
                StorageError::NotFound(_) => ExecutorError::RunNotFound(run.id.clone()),
                other => other.into(),
            })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        match self.storage.runs().get_by_id(run_id).await? {
            Some(record) => Ok(Some(self.load_run(record).await?)),
            None => Ok(None),
        }
    }

    async fn latest_run(&self, plan_id: &str) -> Result<Option<Run>> {
        match self.storage.runs().latest_finished(plan_id).await? {
            Some(record) => Ok(Some(self.load_run(record).await?)),
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        plan_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunSummary>> {
        let filter = RunFilter {
            plan_id: plan_id.map(str::to_string),
            limit: limit.map(|l| l as i64),
            ..Default::default()
        };

        self.storage
            .runs()
            .list(&filter)
            .await?
            .into_iter()
            .map(summary_from_record)
            .collect()
    }

    async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>> {
        Ok(self.storage.runs().failed_steps(plan_id).await?)
    }
}

// ============================================
// 计划 <-> 数据库记录
// ============================================

/// 步骤定义转换为数据库草稿
pub fn step_draft(step: &Step) -> Result<StepDraft> {
    Ok(StepDraft {
        name: step.name.clone(),
        protocol: step.protocol.to_string(),
        payload: serde_json::to_string(&step.payload)?,
        expected: serde_json::to_string(&step.expected)?,
        timeout_ms: step.timeout_ms.map(|t| t as i64),
    })
}

/// 数据库步骤记录转换为步骤定义
pub fn step_from_record(record: &StepRecord) -> Result<Step> {
    Ok(Step {
        id: record.id.clone(),
        name: record.name.clone(),
        protocol: record.protocol.parse::<ProtocolKind>()?,
        payload: serde_json::from_str(&record.payload)?,
        expected: serde_json::from_str(&record.expected)?,
        timeout_ms: record.timeout_ms.and_then(|t| u64::try_from(t).ok()),
    })
}

fn plan_from_tree(tree: PlanTree) -> Result<TestPlan> {
    let scenarios = tree
        .scenarios
        .into_iter()
        .map(|s| {
            let cases = s
                .cases
                .into_iter()
                .map(|c| {
                    let steps = c
                        .steps
                        .iter()
                        .map(step_from_record)
                        .collect::<Result<Vec<_>>>()?;
                    Ok(TestCase {
                        id: c.case.id,
                        name: c.case.name,
                        description: c.case.description,
                        steps,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Scenario {
                id: s.scenario.id,
                name: s.scenario.name,
                description: s.scenario.description,
                cases,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TestPlan {
        id: tree.plan.id,
        name: tree.plan.name,
        description: tree.plan.description,
        scenarios,
    })
}

fn plan_to_tree(plan: &TestPlan) -> Result<PlanTree> {
    let now = Utc::now();

    let scenarios = plan
        .scenarios
        .iter()
        .enumerate()
        .map(|(si, scenario)| {
            let cases = scenario
                .cases
                .iter()
                .enumerate()
                .map(|(ci, case)| {
                    let steps = case
                        .steps
                        .iter()
                        .enumerate()
                        .map(|(ti, step)| {
                            let draft = step_draft(step)?;
                            Ok(StepRecord {
                                id: step.id.clone(),
                                case_id: case.id.clone(),
                                name: draft.name,
                                position: ti as i64,
                                protocol: draft.protocol,
                                payload: draft.payload,
                                expected: draft.expected,
                                timeout_ms: draft.timeout_ms,
                                created_at: now,
                                updated_at: now,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;

                    Ok(CaseTree {
                        case: TestCaseRecord {
                            id: case.id.clone(),
                            scenario_id: scenario.id.clone(),
                            name: case.name.clone(),
                            description: case.description.clone(),
                            position: ci as i64,
                            created_at: now,
                            updated_at: now,
                        },
                        steps,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(ScenarioTree {
                scenario: ScenarioRecord {
                    id: scenario.id.clone(),
                    plan_id: plan.id.clone(),
                    name: scenario.name.clone(),
                    description: scenario.description.clone(),
                    position: si as i64,
                    created_at: now,
                    updated_at: now,
                },
                cases,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PlanTree {
        plan: PlanRecord {
            id: plan.id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            created_at: now,
            updated_at: now,
        },
        scenarios,
    })
}

// ============================================
// 执行记录 <-> 数据库记录
// ============================================

fn run_to_record(run: &Run) -> Result<RunRecord> {
    let selection = match &run.mode {
        ExecutionMode::Partial { nodes } => Some(serde_json::to_string(nodes)?),
        _ => None,
    };

    Ok(RunRecord {
        id: run.id.clone(),
        plan_id: run.plan_id.clone(),
        plan_name: run.plan_name.clone(),
        mode: run.mode.as_str().to_string(),
        selection,
        status: run.status.as_str().to_string(),
        error: run.error.clone(),
        started_at: run.started_at,
        ended_at: run.ended_at,
        total_steps: run.counts.total_steps as i64,
        executed_steps: run.counts.executed as i64,
        passed_count: run.counts.passed as i64,
        failed_count: run.counts.failed as i64,
        error_count: run.counts.error as i64,
        skipped_count: run.counts.skipped as i64,
        cancelled_count: run.counts.cancelled as i64,
    })
}

fn summary_from_record(record: RunRecord) -> Result<RunSummary> {
    let mode = match record.mode.as_str() {
        "full" => ExecutionMode::Full,
        "last_failed" => ExecutionMode::LastFailed,
        "partial" => ExecutionMode::Partial {
            nodes: from_json(&record.selection)?.unwrap_or_default(),
        },
        other => {
            return Err(ExecutorError::SerdeError(format!(
                "unknown execution mode '{}'",
                other
            )))
        }
    };

    Ok(RunSummary {
        id: record.id,
        plan_id: record.plan_id,
        plan_name: record.plan_name,
        mode,
        status: record.status.parse()?,
        error: record.error,
        started_at: record.started_at,
        ended_at: record.ended_at,
        counts: RunCounts {
            total_steps: record.total_steps.max(0) as usize,
            executed: record.executed_steps.max(0) as usize,
            passed: record.passed_count.max(0) as usize,
            failed: record.failed_count.max(0) as usize,
            error: record.error_count.max(0) as usize,
            skipped: record.skipped_count.max(0) as usize,
            cancelled: record.cancelled_count.max(0) as usize,
        },
    })
}

fn run_from_records(record: RunRecord, results: Vec<NodeResultRecord>) -> Result<Run> {
    let summary = summary_from_record(record)?;

    let root = match tree_from_records(results)? {
        Some(root) => root,
        // 尚未写入结果树 (运行中或持久化失败)
        None => {
            let mut root =
                NodeResult::container(NodeKind::Plan, &summary.plan_id, &summary.plan_name, 0);
            root.started_at = Some(summary.started_at);
            root.ended_at = summary.ended_at;
            root.status = match summary.status {
                RunStatus::Pending | RunStatus::Running => NodeStatus::Running,
                RunStatus::Passed => NodeStatus::Passed,
                RunStatus::Failed => NodeStatus::Failed,
                RunStatus::Cancelled => NodeStatus::Cancelled,
                RunStatus::Error => NodeStatus::Error,
            };
            root
        }
    };

    Ok(Run {
        id: summary.id,
        plan_id: summary.plan_id,
        plan_name: summary.plan_name,
        mode: summary.mode,
        status: summary.status,
        error: summary.error,
        started_at: summary.started_at,
        ended_at: summary.ended_at,
        counts: summary.counts,
        root,
    })
}

/// 结果树按先序展开为记录
fn tree_to_records(run_id: &str, root: &NodeResult) -> Result<Vec<NodeResultRecord>> {
    let mut records = Vec::new();
    let mut stack: Vec<(&NodeResult, Option<&str>)> = vec![(root, None)];

    while let Some((node, parent)) = stack.pop() {
        records.push(NodeResultRecord {
            id: 0,
            run_id: run_id.to_string(),
            node_id: node.node_id.clone(),
            node_kind: node.kind.as_str().to_string(),
            parent_id: parent.map(str::to_string),
            position: node.position as i64,
            name: node.name.clone(),
            status: node.status.as_str().to_string(),
            reason: to_json(&node.reason)?,
            protocol: node.protocol.map(|p| p.to_string()),
            expected: to_json(&node.expected)?,
            actual: to_json(&node.actual)?,
            diff: to_json(&node.diff)?,
            started_at: node.started_at,
            ended_at: node.ended_at,
        });

        for child in node.children.iter().rev() {
            stack.push((child, Some(node.node_id.as_str())));
        }
    }

    Ok(records)
}

/// 由先序记录重建结果树
fn tree_from_records(records: Vec<NodeResultRecord>) -> Result<Option<NodeResult>> {
    let mut children: HashMap<String, Vec<NodeResult>> = HashMap::new();
    let mut root = None;

    // 逆序处理时每个节点的后代都已就绪
    for record in records.into_iter().rev() {
        let mut node = NodeResult {
            kind: NodeKind::parse(&record.node_kind).ok_or_else(|| {
                ExecutorError::SerdeError(format!("unknown node kind '{}'", record.node_kind))
            })?,
            status: record.status.parse()?,
            reason: from_json(&record.reason)?,
            protocol: record
                .protocol
                .as_deref()
                .map(str::parse::<ProtocolKind>)
                .transpose()?,
            expected: from_json(&record.expected)?,
            actual: from_json(&record.actual)?,
            diff: from_json(&record.diff)?,
            started_at: record.started_at,
            ended_at: record.ended_at,
            position: record.position.max(0) as usize,
            name: record.name,
            children: Vec::new(),
            node_id: record.node_id,
        };

        if let Some(mut own) = children.remove(&node.node_id) {
            own.reverse();
            node.children = own;
        }

        match record.parent_id {
            Some(parent) => children.entry(parent).or_default().push(node),
            None => root = Some(node),
        }
    }

    Ok(root)
}

fn to_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn from_json<T: DeserializeOwned>(value: &Option<String>) -> Result<Option<T>> {
    value
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{Diff, ExpectSpec};
    use crate::result::FailureReason;
    use serde_json::json;

    fn step_node(id: &str, position: usize, status: NodeStatus) -> NodeResult {
        let step = Step {
            id: id.to_string(),
            name: id.to_string(),
            protocol: ProtocolKind::Topic,
            payload: json!({"topic": "vehicle/speed"}),
            expected: ExpectSpec::tolerance(50, 1.0),
            timeout_ms: None,
        };
        let mut node = NodeResult::step(&step, position);
        node.status = status;
        node
    }

    #[test]
    fn test_tree_records_roundtrip() {
        let mut root = NodeResult::container(NodeKind::Plan, "p", "plan", 0);
        let mut scenario = NodeResult::container(NodeKind::Scenario, "s", "scenario", 0);
        let mut case = NodeResult::container(NodeKind::TestCase, "c", "case", 0);

        let mut failed = step_node("b", 1, NodeStatus::Failed);
        failed.reason = Some(FailureReason::Comparison);
        failed.actual = Some(json!(70));
        failed.diff = Some(Diff::default());

        case.children.push(step_node("a", 0, NodeStatus::Passed));
        case.children.push(failed);
        case.fold();
        scenario.children.push(case);
        scenario.fold();
        root.children.push(scenario);
        root.fold();

        let records = tree_to_records("run", &root).unwrap();
        let order: Vec<_> = records.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(order, vec!["p", "s", "c", "a", "b"]);
        assert_eq!(records[3].parent_id.as_deref(), Some("c"));

        let rebuilt = tree_from_records(records).unwrap().unwrap();
        assert_eq!(rebuilt, root);
    }

    #[test]
    fn test_step_record_conversion() {
        let step = Step {
            id: "s1".to_string(),
            name: "lock".to_string(),
            protocol: ProtocolKind::SomeIp,
            payload: json!({"method": "door.lock"}),
            expected: ExpectSpec::exact_from(&json!({"result": "ok"})),
            timeout_ms: Some(250),
        };

        let draft = step_draft(&step).unwrap();
        assert_eq!(draft.protocol, "someip");

        let now = Utc::now();
        let record = StepRecord {
            id: step.id.clone(),
            case_id: "c".to_string(),
            name: draft.name,
            position: 0,
            protocol: draft.protocol,
            payload: draft.payload,
            expected: draft.expected,
            timeout_ms: draft.timeout_ms,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(step_from_record(&record).unwrap(), step);
    }
}
