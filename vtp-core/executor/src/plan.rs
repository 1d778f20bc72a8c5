//! 测试计划定义
//!
//! 计划 → 场景 → 用例 → 步骤 的层级结构。同级节点的顺序即向量中的顺序。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;
use vtp_protocol::ProtocolKind;

use crate::compare::ExpectSpec;
use crate::{ExecutorError, Result};

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Plan,
    Scenario,
    TestCase,
    Step,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Plan => "plan",
            NodeKind::Scenario => "scenario",
            NodeKind::TestCase => "test_case",
            NodeKind::Step => "step",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(NodeKind::Plan),
            "scenario" => Some(NodeKind::Scenario),
            "test_case" => Some(NodeKind::TestCase),
            "step" => Some(NodeKind::Step),
            _ => None,
        }
    }
}

/// 测试计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// 计划 ID (导入时可省略)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// 计划名称
    pub name: String,

    /// 计划描述
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 场景列表
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

/// 测试场景
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub cases: Vec<TestCase>,
}

/// 测试用例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// 测试步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub name: String,

    /// 协议类型
    pub protocol: ProtocolKind,

    /// 请求载荷 (由适配器解析)
    #[serde(default)]
    pub payload: serde_json::Value,

    /// 期望值
    #[serde(default)]
    pub expected: ExpectSpec,

    /// 超时 (毫秒), 未设置时使用引擎默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TestPlan {
    /// 从 YAML 文件加载计划
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// 从 YAML 字符串加载计划
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 从 JSON 文件加载计划
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 从 JSON 字符串加载计划
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 按扩展名加载 (.json 之外一律按 YAML 解析)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 为所有节点分配新的 ID
    pub fn assign_fresh_ids(&mut self) {
        self.id = new_id();
        for scenario in &mut self.scenarios {
            scenario.id = new_id();
            for case in &mut scenario.cases {
                case.id = new_id();
                for step in &mut case.steps {
                    step.id = new_id();
                }
            }
        }
    }

    /// 为缺少 ID 的节点补齐 ID
    pub fn fill_missing_ids(&mut self) {
        fill(&mut self.id);
        for scenario in &mut self.scenarios {
            fill(&mut scenario.id);
            for case in &mut scenario.cases {
                fill(&mut case.id);
                for step in &mut case.steps {
                    fill(&mut step.id);
                }
            }
        }
    }

    /// 校验名称非空, ID 非空且全局唯一
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for (kind, id, name) in self.nodes() {
            if name.trim().is_empty() {
                return Err(ExecutorError::InvalidPlan(format!(
                    "{} {} has an empty name",
                    kind.as_str(),
                    id
                )));
            }
            if id.is_empty() {
                return Err(ExecutorError::InvalidPlan(format!(
                    "{} '{}' has no id",
                    kind.as_str(),
                    name
                )));
            }
            if !seen.insert(id) {
                return Err(ExecutorError::InvalidPlan(format!("duplicate node id {}", id)));
            }
        }

        for step in self.steps() {
            if step.timeout_ms == Some(0) {
                return Err(ExecutorError::InvalidPlan(format!(
                    "step '{}' has a zero timeout",
                    step.name
                )));
            }
        }

        Ok(())
    }

    /// 先序遍历所有节点: (类型, ID, 名称)
    pub fn nodes(&self) -> Vec<(NodeKind, &str, &str)> {
        let mut nodes = vec![(NodeKind::Plan, self.id.as_str(), self.name.as_str())];
        for scenario in &self.scenarios {
            nodes.push((NodeKind::Scenario, scenario.id.as_str(), scenario.name.as_str()));
            for case in &scenario.cases {
                nodes.push((NodeKind::TestCase, case.id.as_str(), case.name.as_str()));
                for step in &case.steps {
                    nodes.push((NodeKind::Step, step.id.as_str(), step.name.as_str()));
                }
            }
        }
        nodes
    }

    /// 先序遍历所有步骤
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.scenarios
            .iter()
            .flat_map(|s| s.cases.iter())
            .flat_map(|c| c.steps.iter())
    }

    /// 步骤总数
    pub fn step_count(&self) -> usize {
        self.steps().count()
    }

    /// 查找节点类型
    pub fn find_node(&self, id: &str) -> Option<NodeKind> {
        self.nodes()
            .into_iter()
            .find(|(_, node_id, _)| *node_id == id)
            .map(|(kind, _, _)| kind)
    }

    /// 节点 (含自身) 下的全部步骤 ID; 节点不存在时返回 None
    pub fn descendant_steps(&self, id: &str) -> Option<Vec<&str>> {
        if self.id == id {
            return Some(self.steps().map(|s| s.id.as_str()).collect());
        }

        for scenario in &self.scenarios {
            if scenario.id == id {
                return Some(
                    scenario
                        .cases
                        .iter()
                        .flat_map(|c| c.steps.iter())
                        .map(|s| s.id.as_str())
                        .collect(),
                );
            }
            for case in &scenario.cases {
                if case.id == id {
                    return Some(case.steps.iter().map(|s| s.id.as_str()).collect());
                }
                if let Some(step) = case.steps.iter().find(|s| s.id == id) {
                    return Some(vec![step.id.as_str()]);
                }
            }
        }

        None
    }

    /// 根据 ID 查找步骤
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps().find(|s| s.id == id)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn fill(id: &mut String) {
    if id.is_empty() {
        *id = new_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_YAML: &str = r#"
name: body-domain
description: 车身域回归
scenarios:
  - name: doors
    cases:
      - name: lock
        steps:
          - name: lock all doors
            protocol: someip
            payload:
              method: door.lock
            expected:
              policy: object
              fields:
                result:
                  policy: exact
                  value: ok
          - name: read lock signal
            protocol: can
            payload:
              signal: DoorLockSts
            timeout_ms: 200
"#;

    #[test]
    fn test_plan_from_yaml() {
        let plan = TestPlan::from_yaml_str(PLAN_YAML).unwrap();

        assert_eq!(plan.name, "body-domain");
        assert!(plan.id.is_empty());
        assert_eq!(plan.step_count(), 2);

        let steps: Vec<_> = plan.steps().collect();
        assert_eq!(steps[0].protocol, ProtocolKind::SomeIp);
        assert!(matches!(steps[0].expected, ExpectSpec::Object { .. }));
        assert_eq!(steps[1].expected, ExpectSpec::Ignore);
        assert_eq!(steps[1].timeout_ms, Some(200));
    }

    #[test]
    fn test_validate_requires_ids() {
        let mut plan = TestPlan::from_yaml_str(PLAN_YAML).unwrap();
        assert!(matches!(plan.validate(), Err(ExecutorError::InvalidPlan(_))));

        plan.fill_missing_ids();
        plan.validate().unwrap();

        let step_id = plan.scenarios[0].cases[0].steps[0].id.clone();
        plan.scenarios[0].cases[0].steps[1].id = step_id;
        assert!(matches!(plan.validate(), Err(ExecutorError::InvalidPlan(_))));
    }

    #[test]
    fn test_descendant_steps() {
        let mut plan = TestPlan::from_yaml_str(PLAN_YAML).unwrap();
        plan.assign_fresh_ids();

        let scenario_id = plan.scenarios[0].id.clone();
        let case_id = plan.scenarios[0].cases[0].id.clone();
        let step_id = plan.scenarios[0].cases[0].steps[1].id.clone();

        assert_eq!(plan.descendant_steps(&plan.id).unwrap().len(), 2);
        assert_eq!(plan.descendant_steps(&scenario_id).unwrap().len(), 2);
        assert_eq!(plan.descendant_steps(&case_id).unwrap().len(), 2);
        assert_eq!(plan.descendant_steps(&step_id).unwrap(), vec![step_id.as_str()]);
        assert!(plan.descendant_steps("unknown").is_none());

        assert_eq!(plan.find_node(&case_id), Some(NodeKind::TestCase));
        assert_eq!(plan.find_node(&step_id), Some(NodeKind::Step));
    }

    #[test]
    fn test_fresh_ids_are_unique() {
        let mut plan = TestPlan::from_yaml_str(PLAN_YAML).unwrap();
        plan.assign_fresh_ids();
        let first: Vec<String> = plan.nodes().iter().map(|(_, id, _)| id.to_string()).collect();

        plan.assign_fresh_ids();
        let second: Vec<String> = plan.nodes().iter().map(|(_, id, _)| id.to_string()).collect();

        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|id| !second.contains(id)));
    }

    #[test]
    fn test_yaml_export_roundtrip() {
        let mut plan = TestPlan::from_yaml_str(PLAN_YAML).unwrap();
        plan.fill_missing_ids();

        let yaml = plan.to_yaml().unwrap();
        let parsed = TestPlan::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, plan);
    }
}
