use std::collections::HashMap;

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::cases::insert_case;
use super::scenarios::insert_scenario;
use super::steps::insert_step;
use crate::error::{Result, StorageError};
use crate::models::{PlanRecord, ScenarioRecord, StepRecord, TestCaseRecord};

/// 一次读出的完整计划树
#[derive(Debug, Clone)]
pub struct PlanTree {
    pub plan: PlanRecord,
    pub scenarios: Vec<ScenarioTree>,
}

#[derive(Debug, Clone)]
pub struct ScenarioTree {
    pub scenario: ScenarioRecord,
    pub cases: Vec<CaseTree>,
}

#[derive(Debug, Clone)]
pub struct CaseTree {
    pub case: TestCaseRecord,
    pub steps: Vec<StepRecord>,
}

impl PlanTree {
    /// 全部步骤 (先序)
    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.scenarios
            .iter()
            .flat_map(|s| s.cases.iter())
            .flat_map(|c| c.steps.iter())
    }
}

/// 测试计划仓储
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建新计划
    pub async fn create(&self, name: &str, description: Option<&str>) -> Result<PlanRecord> {
        validate_name(name)?;

        let now = Utc::now();
        let record = PlanRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.pool.acquire().await?;
        insert_plan(&mut conn, &record).await?;

        info!("Created plan '{}' with ID: {}", record.name, record.id);

        Ok(record)
    }

    /// 根据ID获取计划
    pub async fn get_by_id(&self, id: &str) -> Result<Option<PlanRecord>> {
        let plan = sqlx::query_as::<_, PlanRecord>(
            r#"
            SELECT id, name, description, created_at, updated_at
            FROM test_plans
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// 根据名称获取计划
    pub async fn get_by_name(&self, name: &str) -> Result<Option<PlanRecord>> {
        let plan = sqlx::query_as::<_, PlanRecord>(
            r#"
            SELECT id, name, description, created_at, updated_at
            FROM test_plans
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// 查询所有计划
    pub async fn list(&self) -> Result<Vec<PlanRecord>> {
        let plans = sqlx::query_as::<_, PlanRecord>(
            r#"
            SELECT id, name, description, created_at, updated_at
            FROM test_plans
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    /// 重命名计划
    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        validate_name(name)?;

        let result = sqlx::query("UPDATE test_plans SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_insert(e, || format!("Plan '{}' already exists", name)))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Plan {} not found", id)));
        }

        debug!("Renamed plan {} to '{}'", id, name);

        Ok(())
    }

    /// 更新计划描述
    pub async fn update_description(&self, id: &str, description: Option<&str>) -> Result<()> {
        let result =
            sqlx::query("UPDATE test_plans SET description = ?, updated_at = ? WHERE id = ?")
                .bind(description)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Plan {} not found", id)));
        }

        Ok(())
    }

    /// 删除计划 (级联删除场景/用例/步骤/失败索引, 执行记录保留)
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM test_plans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Plan {} not found", id)));
        }

        info!("Deleted plan {}", id);

        Ok(())
    }

    /// 统计计划数量
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM test_plans")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// 在同一个事务中读出完整的计划树
    pub async fn load_tree(&self, plan_id: &str) -> Result<Option<PlanTree>> {
        let mut tx = self.pool.begin().await?;

        let plan = sqlx::query_as::<_, PlanRecord>(
            "SELECT id, name, description, created_at, updated_at FROM test_plans WHERE id = ?",
        )
        .bind(plan_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(plan) = plan else {
            return Ok(None);
        };

        let scenarios = sqlx::query_as::<_, ScenarioRecord>(
            r#"
            SELECT id, plan_id, name, description, position, created_at, updated_at
            FROM scenarios
            WHERE plan_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&mut *tx)
        .await?;

        let cases = sqlx::query_as::<_, TestCaseRecord>(
            r#"
            SELECT c.id, c.scenario_id, c.name, c.description, c.position,
                   c.created_at, c.updated_at
            FROM test_cases c
            JOIN scenarios s ON c.scenario_id = s.id
            WHERE s.plan_id = ?
            ORDER BY c.position ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&mut *tx)
        .await?;

        let steps = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT t.id, t.case_id, t.name, t.position, t.protocol, t.payload,
                   t.expected, t.timeout_ms, t.created_at, t.updated_at
            FROM test_steps t
            JOIN test_cases c ON t.case_id = c.id
            JOIN scenarios s ON c.scenario_id = s.id
            WHERE s.plan_id = ?
            ORDER BY t.position ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut steps_by_case: HashMap<String, Vec<StepRecord>> = HashMap::new();
        for step in steps {
            steps_by_case.entry(step.case_id.clone()).or_default().push(step);
        }

        let mut cases_by_scenario: HashMap<String, Vec<CaseTree>> = HashMap::new();
        for case in cases {
            let steps = steps_by_case.remove(&case.id).unwrap_or_default();
            cases_by_scenario
                .entry(case.scenario_id.clone())
                .or_default()
                .push(CaseTree { case, steps });
        }

        let scenarios = scenarios
            .into_iter()
            .map(|scenario| {
                let cases = cases_by_scenario.remove(&scenario.id).unwrap_or_default();
                ScenarioTree { scenario, cases }
            })
            .collect();

        Ok(Some(PlanTree { plan, scenarios }))
    }

    /// 在同一个事务中写入完整的计划树
    ///
    /// 各级 position 按树中的顺序重新编号。
    pub async fn insert_tree(&self, tree: &PlanTree) -> Result<()> {
        validate_name(&tree.plan.name)?;

        let mut tx = self.pool.begin().await?;

        insert_plan(&mut tx, &tree.plan).await?;

        for (si, scenario) in tree.scenarios.iter().enumerate() {
            let mut record = scenario.scenario.clone();
            record.plan_id = tree.plan.id.clone();
            record.position = si as i64;
            insert_scenario(&mut tx, &record).await?;

            for (ci, case) in scenario.cases.iter().enumerate() {
                let mut record = case.case.clone();
                record.scenario_id = scenario.scenario.id.clone();
                record.position = ci as i64;
                insert_case(&mut tx, &record).await?;

                for (ti, step) in case.steps.iter().enumerate() {
                    let mut record = step.clone();
                    record.case_id = case.case.id.clone();
                    record.position = ti as i64;
                    insert_step(&mut tx, &record).await?;
                }
            }
        }

        tx.commit().await?;

        info!(
            "Imported plan '{}' ({} scenarios, {} steps)",
            tree.plan.name,
            tree.scenarios.len(),
            tree.steps().count()
        );

        Ok(())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StorageError::ValidationError("name must not be empty".to_string()));
    }
    Ok(())
}

async fn insert_plan(conn: &mut SqliteConnection, plan: &PlanRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO test_plans (id, name, description, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&plan.id)
    .bind(&plan.name)
    .bind(&plan.description)
    .bind(plan.created_at)
    .bind(plan.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::from_insert(e, || format!("Plan '{}' already exists", plan.name)))?;

    Ok(())
}
