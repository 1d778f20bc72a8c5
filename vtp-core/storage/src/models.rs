use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 测试计划数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 场景数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScenarioRecord {
    pub id: String,
    pub plan_id: String,
    pub name: String,
    pub description: Option<String>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 测试用例数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestCaseRecord {
    pub id: String,
    pub scenario_id: String,
    pub name: String,
    pub description: Option<String>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 测试步骤数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
    pub id: String,
    pub case_id: String,
    pub name: String,
    pub position: i64,
    pub protocol: String, // rpc/topic/can/someip/fsa/dtc/ctd
    pub payload: String,  // JSON
    pub expected: String, // JSON
    pub timeout_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 步骤内容 (创建/编辑时使用)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub name: String,
    pub protocol: String,
    pub payload: String,  // JSON
    pub expected: String, // JSON
    pub timeout_ms: Option<i64>,
}

impl From<&StepRecord> for StepDraft {
    fn from(record: &StepRecord) -> Self {
        Self {
            name: record.name.clone(),
            protocol: record.protocol.clone(),
            payload: record.payload.clone(),
            expected: record.expected.clone(),
            timeout_ms: record.timeout_ms,
        }
    }
}

/// 执行记录数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub mode: String,              // full/last_failed/partial
    pub selection: Option<String>, // JSON array, 仅 partial
    pub status: String,            // pending/running/passed/failed/cancelled/error
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_steps: i64,
    pub executed_steps: i64,
    pub passed_count: i64,
    pub failed_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub cancelled_count: i64,
}

impl RunRecord {
    /// 是否已处于终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status.as_str(), "pending" | "running")
    }
}

/// 节点结果数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeResultRecord {
    pub id: i64,
    pub run_id: String,
    pub node_id: String,
    pub node_kind: String, // plan/scenario/test_case/step
    pub parent_id: Option<String>,
    pub position: i64,
    pub name: String,
    pub status: String,
    pub reason: Option<String>, // JSON
    pub protocol: Option<String>,
    pub expected: Option<String>, // JSON
    pub actual: Option<String>,   // JSON
    pub diff: Option<String>,     // JSON
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// 执行记录查询过滤器
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub plan_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
