use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::cases::require_case;
use super::ordering::{self, Siblings};
use super::plans::validate_name;
use super::scenarios::require_scenario;
use crate::error::{Result, StorageError};
use crate::models::{StepDraft, StepRecord};

/// 测试步骤仓储
pub struct StepRepository {
    pool: SqlitePool,
}

impl StepRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 在用例末尾追加步骤
    pub async fn create(&self, case_id: &str, draft: &StepDraft) -> Result<StepRecord> {
        validate_draft(draft)?;

        let mut tx = self.pool.begin().await?;

        require_case(&mut tx, case_id).await?;
        let position = ordering::sibling_ids(&mut tx, Siblings::TestSteps, case_id)
            .await?
            .len() as i64;

        let now = Utc::now();
        let record = StepRecord {
            id: Uuid::new_v4().to_string(),
            case_id: case_id.to_string(),
            name: draft.name.clone(),
            position,
            protocol: draft.protocol.clone(),
            payload: draft.payload.clone(),
            expected: draft.expected.clone(),
            timeout_ms: draft.timeout_ms,
            created_at: now,
            updated_at: now,
        };
        insert_step(&mut tx, &record).await?;

        tx.commit().await?;

        debug!("Created step '{}' with ID: {}", record.name, record.id);

        Ok(record)
    }

    /// 根据ID获取步骤
    pub async fn get_by_id(&self, id: &str) -> Result<Option<StepRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_step(&mut conn, id).await
    }

    /// 按顺序列出用例下的步骤
    pub async fn list_by_case(&self, case_id: &str) -> Result<Vec<StepRecord>> {
        let steps = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT id, case_id, name, position, protocol, payload, expected, timeout_ms,
                   created_at, updated_at
            FROM test_steps
            WHERE case_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }

    /// 编辑步骤内容
    ///
    /// 编辑后的步骤不再代表上次失败的内容, 同时从失败索引中移除。
    pub async fn update(&self, id: &str, draft: &StepDraft) -> Result<()> {
        validate_draft(draft)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE test_steps
            SET name = ?, protocol = ?, payload = ?, expected = ?, timeout_ms = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&draft.name)
        .bind(&draft.protocol)
        .bind(&draft.payload)
        .bind(&draft.expected)
        .bind(draft.timeout_ms)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Step {} not found", id)));
        }

        sqlx::query("DELETE FROM failed_nodes WHERE step_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!("Updated step {}", id);

        Ok(())
    }

    /// 删除步骤, 重排剩余步骤
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let step = require_step(&mut tx, id).await?;

        sqlx::query("DELETE FROM test_steps WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        ordering::compact(&mut tx, Siblings::TestSteps, &step.case_id).await?;

        tx.commit().await?;

        debug!("Deleted step {}", id);

        Ok(())
    }

    /// 移动步骤, 可跨用例 (但不可跨计划)
    pub async fn move_to(&self, id: &str, target_case_id: Option<&str>, position: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let step = require_step(&mut tx, id).await?;
        let target_id = target_case_id.unwrap_or(&step.case_id).to_string();

        if target_id != step.case_id {
            let source_case = require_case(&mut tx, &step.case_id).await?;
            let target_case = require_case(&mut tx, &target_id).await?;
            let source_plan = require_scenario(&mut tx, &source_case.scenario_id).await?.plan_id;
            let target_plan = require_scenario(&mut tx, &target_case.scenario_id).await?.plan_id;
            if source_plan != target_plan {
                return Err(StorageError::ValidationError(format!(
                    "Test case {} belongs to another plan",
                    target_id
                )));
            }

            sqlx::query("UPDATE test_steps SET case_id = ?, updated_at = ? WHERE id = ?")
                .bind(&target_id)
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await?;

            ordering::compact(&mut tx, Siblings::TestSteps, &step.case_id).await?;
        }

        let mut ids = ordering::sibling_ids(&mut tx, Siblings::TestSteps, &target_id).await?;
        ordering::place(&mut ids, step.id.clone(), position);
        ordering::reindex(&mut tx, Siblings::TestSteps, &ids).await?;

        tx.commit().await?;

        debug!("Moved step {} to {}:{}", id, target_id, position);

        Ok(())
    }
}

fn validate_draft(draft: &StepDraft) -> Result<()> {
    validate_name(&draft.name)?;

    if draft.protocol.trim().is_empty() {
        return Err(StorageError::ValidationError("protocol must not be empty".to_string()));
    }

    if let Some(timeout) = draft.timeout_ms {
        if timeout <= 0 {
            return Err(StorageError::ValidationError(format!(
                "timeout_ms must be positive, got {}",
                timeout
            )));
        }
    }

    // payload/expected 必须是合法 JSON
    serde_json::from_str::<serde_json::Value>(&draft.payload)?;
    serde_json::from_str::<serde_json::Value>(&draft.expected)?;

    Ok(())
}

pub(crate) async fn insert_step(conn: &mut SqliteConnection, step: &StepRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO test_steps
        (id, case_id, name, position, protocol, payload, expected, timeout_ms, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&step.id)
    .bind(&step.case_id)
    .bind(&step.name)
    .bind(step.position)
    .bind(&step.protocol)
    .bind(&step.payload)
    .bind(&step.expected)
    .bind(step.timeout_ms)
    .bind(step.created_at)
    .bind(step.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::from_insert(e, || format!("Step {} already exists", step.id)))?;

    Ok(())
}

async fn fetch_step(conn: &mut SqliteConnection, id: &str) -> Result<Option<StepRecord>> {
    let step = sqlx::query_as::<_, StepRecord>(
        r#"
        SELECT id, case_id, name, position, protocol, payload, expected, timeout_ms,
               created_at, updated_at
        FROM test_steps
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(step)
}

async fn require_step(conn: &mut SqliteConnection, id: &str) -> Result<StepRecord> {
    fetch_step(conn, id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("Step {} not found", id)))
}
