use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::cases::copy_case_into;
use super::ordering::{self, Siblings};
use super::plans::validate_name;
use crate::error::{Result, StorageError};
use crate::models::{ScenarioRecord, TestCaseRecord};

/// 场景仓储
pub struct ScenarioRepository {
    pool: SqlitePool,
}

impl ScenarioRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 在计划末尾追加场景
    pub async fn create(
        &self,
        plan_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<ScenarioRecord> {
        validate_name(name)?;

        let mut tx = self.pool.begin().await?;

        ensure_plan(&mut tx, plan_id).await?;
        let position = ordering::sibling_ids(&mut tx, Siblings::Scenarios, plan_id)
            .await?
            .len() as i64;

        let now = Utc::now();
        let record = ScenarioRecord {
            id: Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            position,
            created_at: now,
            updated_at: now,
        };
        insert_scenario(&mut tx, &record).await?;

        tx.commit().await?;

        debug!("Created scenario '{}' with ID: {}", record.name, record.id);

        Ok(record)
    }

    /// 根据ID获取场景
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ScenarioRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_scenario(&mut conn, id).await
    }

    /// 按顺序列出计划下的场景
    pub async fn list_by_plan(&self, plan_id: &str) -> Result<Vec<ScenarioRecord>> {
        let scenarios = sqlx::query_as::<_, ScenarioRecord>(
            r#"
            SELECT id, plan_id, name, description, position, created_at, updated_at
            FROM scenarios
            WHERE plan_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(scenarios)
    }

    /// 更新名称和描述
    pub async fn update(&self, id: &str, name: &str, description: Option<&str>) -> Result<()> {
        validate_name(name)?;

        let result = sqlx::query(
            "UPDATE scenarios SET name = ?, description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Scenario {} not found", id)));
        }

        debug!("Updated scenario {}", id);

        Ok(())
    }

    /// 删除场景及其子树, 重排剩余场景
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let scenario = require_scenario(&mut tx, id).await?;

        sqlx::query("DELETE FROM scenarios WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        ordering::compact(&mut tx, Siblings::Scenarios, &scenario.plan_id).await?;

        tx.commit().await?;

        debug!("Deleted scenario {}", id);

        Ok(())
    }

    /// 在计划内移动场景到新位置
    pub async fn move_to(&self, id: &str, position: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let scenario = require_scenario(&mut tx, id).await?;
        let mut ids = ordering::sibling_ids(&mut tx, Siblings::Scenarios, &scenario.plan_id).await?;
        ordering::place(&mut ids, scenario.id.clone(), position);
        ordering::reindex(&mut tx, Siblings::Scenarios, &ids).await?;

        sqlx::query("UPDATE scenarios SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!("Moved scenario {} to position {}", id, position);

        Ok(())
    }

    /// 深拷贝场景, 副本紧跟在原场景之后, 所有节点使用新ID
    pub async fn copy(&self, id: &str) -> Result<ScenarioRecord> {
        let mut tx = self.pool.begin().await?;

        let source = require_scenario(&mut tx, id).await?;
        let now = Utc::now();
        let copy = ScenarioRecord {
            id: Uuid::new_v4().to_string(),
            plan_id: source.plan_id.clone(),
            name: format!("{}_copy", source.name),
            description: source.description.clone(),
            position: source.position + 1,
            created_at: now,
            updated_at: now,
        };
        insert_scenario(&mut tx, &copy).await?;

        let cases = sqlx::query_as::<_, TestCaseRecord>(
            r#"
            SELECT id, scenario_id, name, description, position, created_at, updated_at
            FROM test_cases
            WHERE scenario_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&source.id)
        .fetch_all(&mut *tx)
        .await?;

        for case in &cases {
            copy_case_into(&mut tx, case, &copy.id, case.name.clone(), case.position).await?;
        }

        let mut ids = ordering::sibling_ids(&mut tx, Siblings::Scenarios, &source.plan_id).await?;
        ordering::place(&mut ids, copy.id.clone(), source.position + 1);
        ordering::reindex(&mut tx, Siblings::Scenarios, &ids).await?;

        tx.commit().await?;

        debug!("Copied scenario {} to {}", id, copy.id);

        Ok(copy)
    }
}

pub(crate) async fn insert_scenario(
    conn: &mut SqliteConnection,
    scenario: &ScenarioRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scenarios
        (id, plan_id, name, description, position, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&scenario.id)
    .bind(&scenario.plan_id)
    .bind(&scenario.name)
    .bind(&scenario.description)
    .bind(scenario.position)
    .bind(scenario.created_at)
    .bind(scenario.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::from_insert(e, || format!("Scenario {} already exists", scenario.id)))?;

    Ok(())
}

pub(crate) async fn fetch_scenario(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<ScenarioRecord>> {
    let scenario = sqlx::query_as::<_, ScenarioRecord>(
        r#"
        SELECT id, plan_id, name, description, position, created_at, updated_at
        FROM scenarios
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(scenario)
}

pub(crate) async fn require_scenario(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<ScenarioRecord> {
    fetch_scenario(conn, id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("Scenario {} not found", id)))
}

async fn ensure_plan(conn: &mut SqliteConnection, plan_id: &str) -> Result<()> {
    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM test_plans WHERE id = ?")
        .bind(plan_id)
        .fetch_optional(&mut *conn)
        .await?;

    if exists.is_none() {
        return Err(StorageError::NotFound(format!("Plan {} not found", plan_id)));
    }

    Ok(())
}
