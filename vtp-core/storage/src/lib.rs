//! VTP 持久化层
//!
//! 基于 SQLite 保存测试计划树、执行记录、节点结果和失败索引。

mod connection;
mod error;
mod models;
mod repositories;

pub use connection::StorageManager;
pub use error::{Result, StorageError};
pub use models::*;
pub use repositories::*;

use sqlx::SqlitePool;

/// 统一的数据访问层入口
pub struct Storage {
    pool: SqlitePool,
    plans: PlanRepository,
    scenarios: ScenarioRepository,
    cases: TestCaseRepository,
    steps: StepRepository,
    runs: RunRepository,
}

impl Storage {
    /// 从 StorageManager 创建 Storage
    pub fn from_manager(manager: &StorageManager) -> Self {
        let pool = manager.pool().clone();
        Self {
            pool: pool.clone(),
            plans: PlanRepository::new(pool.clone()),
            scenarios: ScenarioRepository::new(pool.clone()),
            cases: TestCaseRepository::new(pool.clone()),
            steps: StepRepository::new(pool.clone()),
            runs: RunRepository::new(pool),
        }
    }

    /// 获取计划仓储
    pub fn plans(&self) -> &PlanRepository {
        &self.plans
    }

    /// 获取场景仓储
    pub fn scenarios(&self) -> &ScenarioRepository {
        &self.scenarios
    }

    /// 获取用例仓储
    pub fn cases(&self) -> &TestCaseRepository {
        &self.cases
    }

    /// 获取步骤仓储
    pub fn steps(&self) -> &StepRepository {
        &self.steps
    }

    /// 获取执行记录仓储
    pub fn runs(&self) -> &RunRepository {
        &self.runs
    }

    /// 获取数据库连接池
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
