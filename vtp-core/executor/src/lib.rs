//! VTP 执行器
//!
//! 测试计划执行引擎: 计划模型、期望值比较、步骤执行、计划遍历、
//! 执行协调 (互斥、取消、增量状态) 以及结果持久化。

pub mod compare;
pub mod config;
pub mod coordinator;
pub mod persistence;
pub mod plan;
pub mod report;
pub mod result;
pub mod runner;
pub mod store;
pub mod walker;

pub use compare::{compare, Diff, ExpectSpec, Mismatch, MismatchKind};
pub use config::{DatabaseConfig, EngineConfig, LogConfig, VtpConfig};
pub use coordinator::{CoordinatorConfig, ExecutionCoordinator};
pub use persistence::{step_draft, step_from_record, SqliteStore};
pub use plan::{NodeKind, Scenario, Step, TestCase, TestPlan};
pub use report::RunReport;
pub use result::{
    fold_status, ExecutionMode, FailureReason, NodeResult, NodeStatus, Run, RunCounts, RunStatus,
    RunSummary,
};
pub use runner::{StepRunner, DEFAULT_STEP_TIMEOUT};
pub use store::{MemoryStore, PlanSource, ResultStore};
pub use walker::{PlanWalker, Selection};

use thiserror::Error;
use vtp_protocol::AdapterError;
use vtp_storage::StorageError;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("计划 {0} 正在执行中")]
    Busy(String),

    #[error("计划不存在: {0}")]
    PlanNotFound(String),

    #[error("执行记录不存在: {0}")]
    RunNotFound(String),

    #[error("执行尚未结束: {0}")]
    RunNotFinished(String),

    #[error("执行记录已结束, 不可修改: {0}")]
    RunImmutable(String),

    #[error("执行记录已存在: {0}")]
    DuplicateRun(String),

    #[error("节点不存在: {0}")]
    NodeNotFound(String),

    #[error("无效的节点选择: {0}")]
    InvalidSelection(String),

    #[error("计划无效: {0}")]
    InvalidPlan(String),

    #[error("协议错误: {0}")]
    ProtocolError(#[from] AdapterError),

    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

impl From<serde_json::Error> for ExecutorError {
    fn from(e: serde_json::Error) -> Self {
        ExecutorError::SerdeError(e.to_string())
    }
}

impl From<serde_yaml::Error> for ExecutorError {
    fn from(e: serde_yaml::Error) -> Self {
        ExecutorError::SerdeError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
