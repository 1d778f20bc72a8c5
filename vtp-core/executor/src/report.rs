//! 执行报告
//!
//! 执行元数据、步骤计数与完整的节点结果树, 可导出为 JSON 或 YAML。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::result::{ExecutionMode, NodeResult, Run, RunCounts, RunStatus};
use crate::Result;

/// 执行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan_id: String,
    pub plan_name: String,

    /// 执行模式
    pub mode: ExecutionMode,

    pub status: RunStatus,

    /// 持久化失败等执行级错误
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// 总耗时 (毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    pub counts: RunCounts,

    /// 计划 → 场景 → 用例 → 步骤
    pub root: NodeResult,
}

impl From<Run> for RunReport {
    fn from(run: Run) -> Self {
        let duration_ms = run
            .ended_at
            .map(|end| (end - run.started_at).num_milliseconds());

        Self {
            run_id: run.id,
            plan_id: run.plan_id,
            plan_name: run.plan_name,
            mode: run.mode,
            status: run.status,
            error: run.error,
            started_at: run.started_at,
            ended_at: run.ended_at,
            duration_ms,
            counts: run.counts,
            root: run.root,
        }
    }
}

impl RunReport {
    /// 导出为 JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// 写入文件, `.yaml`/`.yml` 为 YAML, 其余为 JSON
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => self.to_json()?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        Ok(())
    }

    /// 失败或出错的步骤
    pub fn failed_steps(&self) -> Vec<&NodeResult> {
        self.root
            .steps()
            .into_iter()
            .filter(|n| n.status.is_failure())
            .collect()
    }
}
