//! 执行结果模型
//!
//! 节点结果树、执行记录与状态汇总规则。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use vtp_protocol::ProtocolKind;

use crate::compare::{Diff, ExpectSpec};
use crate::plan::{NodeKind, Step, TestPlan};
use crate::ExecutorError;

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Error,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Passed => "passed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Error => "error",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// 失败或出错
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Error)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "passed" => Ok(NodeStatus::Passed),
            "failed" => Ok(NodeStatus::Failed),
            "skipped" => Ok(NodeStatus::Skipped),
            "error" => Ok(NodeStatus::Error),
            "cancelled" => Ok(NodeStatus::Cancelled),
            other => Err(ExecutorError::SerdeError(format!("unknown node status '{}'", other))),
        }
    }
}

/// 汇总子节点状态
///
/// 任一子节点取消 → 取消; 否则任一失败/出错 → 失败; 否则任一通过 → 通过; 否则跳过。
/// 没有子节点或全部跳过的父节点不会报告通过。
pub fn fold_status<I>(children: I) -> NodeStatus
where
    I: IntoIterator<Item = NodeStatus>,
{
    let mut any_failure = false;
    let mut any_passed = false;

    for status in children {
        match status {
            NodeStatus::Cancelled => return NodeStatus::Cancelled,
            NodeStatus::Failed | NodeStatus::Error => any_failure = true,
            NodeStatus::Passed => any_passed = true,
            NodeStatus::Skipped | NodeStatus::Pending | NodeStatus::Running => {}
        }
    }

    if any_failure {
        NodeStatus::Failed
    } else if any_passed {
        NodeStatus::Passed
    } else {
        NodeStatus::Skipped
    }
}

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// 完成的执行 (通过或失败) 会重建失败索引
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }

    /// 由根节点状态推出执行状态
    pub fn from_root(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Cancelled => RunStatus::Cancelled,
            NodeStatus::Failed | NodeStatus::Error => RunStatus::Failed,
            NodeStatus::Passed | NodeStatus::Skipped => RunStatus::Passed,
            NodeStatus::Pending => RunStatus::Pending,
            NodeStatus::Running => RunStatus::Running,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "error" => Ok(RunStatus::Error),
            other => Err(ExecutorError::SerdeError(format!("unknown run status '{}'", other))),
        }
    }
}

/// 执行模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 执行全部步骤
    Full,
    /// 只执行上次完成执行中失败的步骤
    LastFailed,
    /// 只执行选中的节点 (容器节点选中其全部后代步骤)
    Partial { nodes: BTreeSet<String> },
}

impl ExecutionMode {
    pub fn partial<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecutionMode::Partial {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Full => "full",
            ExecutionMode::LastFailed => "last_failed",
            ExecutionMode::Partial { .. } => "partial",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Partial { nodes } => write!(f, "partial({})", nodes.len()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 失败原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// 步骤超时
    Timeout,
    /// 适配器返回错误
    Adapter { message: String },
    /// 协议未注册适配器
    AdapterNotFound { protocol: String },
    /// 期望值比较不通过
    Comparison,
    /// 被取消
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Adapter { message } => write!(f, "adapter error: {}", message),
            FailureReason::AdapterNotFound { protocol } => {
                write!(f, "no adapter for protocol {}", protocol)
            }
            FailureReason::Comparison => f.write_str("comparison failed"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// 节点结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub kind: NodeKind,
    pub name: String,
    pub position: usize,
    pub status: NodeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// 以下四项只对步骤有效
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeResult>,
}

impl NodeResult {
    /// 容器节点 (计划/场景/用例), 状态为 running
    pub fn container(kind: NodeKind, id: &str, name: &str, position: usize) -> Self {
        Self {
            node_id: id.to_string(),
            kind,
            name: name.to_string(),
            position,
            status: NodeStatus::Running,
            reason: None,
            protocol: None,
            expected: None,
            actual: None,
            diff: None,
            started_at: Some(Utc::now()),
            ended_at: None,
            children: Vec::new(),
        }
    }

    /// 步骤节点, 复制名称与期望值快照, 状态为 pending
    pub fn step(step: &Step, position: usize) -> Self {
        Self {
            node_id: step.id.clone(),
            kind: NodeKind::Step,
            name: step.name.clone(),
            position,
            status: NodeStatus::Pending,
            reason: None,
            protocol: Some(step.protocol),
            expected: Some(step.expected.clone()),
            actual: None,
            diff: None,
            started_at: None,
            ended_at: None,
            children: Vec::new(),
        }
    }

    /// 未选中的步骤
    pub fn skipped_step(step: &Step, position: usize) -> Self {
        let mut result = Self::step(step, position);
        result.status = NodeStatus::Skipped;
        result
    }

    /// 标记为终态
    pub fn finish(&mut self, status: NodeStatus, reason: Option<FailureReason>) {
        self.status = status;
        self.reason = reason;
        self.ended_at = Some(Utc::now());
    }

    /// 按子节点状态汇总自身
    pub fn fold(&mut self) {
        debug_assert!(self.children.iter().all(|c| c.status.is_terminal()));
        let status = fold_status(self.children.iter().map(|c| c.status));
        let reason = (status == NodeStatus::Cancelled).then_some(FailureReason::Cancelled);
        self.finish(status, reason);
    }

    /// 先序遍历
    pub fn walk(&self) -> Vec<&NodeResult> {
        let mut nodes = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            nodes.push(node);
            stack.extend(node.children.iter().rev());
        }
        nodes
    }

    /// 全部步骤结果 (先序)
    pub fn steps(&self) -> Vec<&NodeResult> {
        self.walk()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Step)
            .collect()
    }

    /// 查找节点
    pub fn find(&self, node_id: &str) -> Option<&NodeResult> {
        self.walk().into_iter().find(|n| n.node_id == node_id)
    }

    /// 失败或出错的步骤 ID
    pub fn failed_step_ids(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .filter(|n| n.status.is_failure())
            .map(|n| n.node_id.clone())
            .collect()
    }
}

/// 步骤计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total_steps: usize,
    /// 实际发起调用的步骤
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunCounts {
    pub fn from_tree(root: &NodeResult) -> Self {
        let mut counts = Self::default();
        for step in root.steps() {
            counts.total_steps += 1;
            if step.started_at.is_some() {
                counts.executed += 1;
            }
            match step.status {
                NodeStatus::Passed => counts.passed += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Error => counts.error += 1,
                NodeStatus::Skipped => counts.skipped += 1,
                NodeStatus::Cancelled => counts.cancelled += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        counts
    }
}

/// 一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    /// 运行中只包含已汇总完成的场景
    pub root: NodeResult,
}

impl Run {
    /// 新建运行中的执行
    pub fn start(id: String, plan: &TestPlan, mode: ExecutionMode) -> Self {
        let root = NodeResult::container(NodeKind::Plan, &plan.id, &plan.name, 0);
        Self {
            id,
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            mode,
            status: RunStatus::Running,
            error: None,
            started_at: root.started_at.unwrap_or_else(Utc::now),
            ended_at: None,
            counts: RunCounts {
                total_steps: plan.step_count(),
                ..Default::default()
            },
            root,
        }
    }

    /// 写入最终的结果树并推出执行状态
    pub fn complete(&mut self, root: NodeResult) {
        self.status = RunStatus::from_root(root.status);
        self.counts = RunCounts::from_tree(&root);
        self.ended_at = root.ended_at.or_else(|| Some(Utc::now()));
        self.root = root;
    }

    /// 遍历结束后才确认的取消: 保留结果树, 执行记为 cancelled
    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
    }

    /// 持久化失败时标记为 error
    pub fn fail(&mut self, message: String) {
        self.status = RunStatus::Error;
        self.error = Some(message);
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            plan_id: self.plan_id.clone(),
            plan_name: self.plan_name.clone(),
            mode: self.mode.clone(),
            status: self.status,
            error: self.error.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            counts: self.counts,
        }
    }
}

/// 不含结果树的执行摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
}

impl RunSummary {
    /// 耗时 (毫秒)
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use NodeStatus::*;

    #[test]
    fn test_fold_rules() {
        assert_eq!(fold_status([Passed, Passed]), Passed);
        assert_eq!(fold_status([Passed, Skipped]), Passed);
        assert_eq!(fold_status([Passed, Failed]), Failed);
        assert_eq!(fold_status([Error, Passed]), Failed);
        assert_eq!(fold_status([Failed, Cancelled, Passed]), Cancelled);
        assert_eq!(fold_status([Skipped, Skipped]), Skipped);
        assert_eq!(fold_status(Vec::<NodeStatus>::new()), Skipped);
    }

    #[test]
    fn test_passed_parent_has_a_passed_child() {
        let all = [Passed, Failed, Skipped, Error, Cancelled];
        for a in all {
            for b in all {
                for c in all {
                    if fold_status([a, b, c]) == Passed {
                        assert!([a, b, c].iter().all(|s| matches!(s, Passed | Skipped)));
                        assert!([a, b, c].contains(&Passed));
                    }
                }
            }
        }
    }

    #[test]
    fn test_run_status_from_root() {
        assert_eq!(RunStatus::from_root(Skipped), RunStatus::Passed);
        assert_eq!(RunStatus::from_root(Error), RunStatus::Failed);
        assert_eq!(RunStatus::from_root(Cancelled), RunStatus::Cancelled);
        assert!(RunStatus::Error.is_terminal());
        assert!(!RunStatus::Cancelled.is_completed());
    }

    #[test]
    fn test_status_strings() {
        for status in [Pending, Running, Passed, Failed, Skipped, Error, Cancelled] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_mode_serde() {
        let mode = ExecutionMode::partial(["b", "a"]);
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "partial");
        assert_eq!(json["nodes"], serde_json::json!(["a", "b"]));

        let back: ExecutionMode = serde_json::from_value(json).unwrap();
        assert_eq!(back, mode);
        assert_eq!(
            serde_json::to_value(ExecutionMode::LastFailed).unwrap()["mode"],
            "last_failed"
        );
    }

    #[test]
    fn test_walk_is_preorder() {
        let mut root = NodeResult::container(NodeKind::Plan, "p", "plan", 0);
        let mut scenario = NodeResult::container(NodeKind::Scenario, "s", "s", 0);
        let mut case = NodeResult::container(NodeKind::TestCase, "c", "c", 0);
        case.children.push(NodeResult::container(NodeKind::Step, "a", "a", 0));
        case.children.push(NodeResult::container(NodeKind::Step, "b", "b", 1));
        scenario.children.push(case);
        root.children.push(scenario);

        let ids: Vec<_> = root.walk().iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["p", "s", "c", "a", "b"]);
        assert_eq!(root.steps().len(), 2);
    }
}
