use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::ordering::{self, Siblings};
use super::plans::validate_name;
use super::scenarios::require_scenario;
use super::steps::insert_step;
use crate::error::{Result, StorageError};
use crate::models::{StepRecord, TestCaseRecord};

/// 测试用例仓储
pub struct TestCaseRepository {
    pool: SqlitePool,
}

impl TestCaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 在场景末尾追加用例
    pub async fn create(
        &self,
        scenario_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<TestCaseRecord> {
        validate_name(name)?;

        let mut tx = self.pool.begin().await?;

        require_scenario(&mut tx, scenario_id).await?;
        let position = ordering::sibling_ids(&mut tx, Siblings::TestCases, scenario_id)
            .await?
            .len() as i64;

        let now = Utc::now();
        let record = TestCaseRecord {
            id: Uuid::new_v4().to_string(),
            scenario_id: scenario_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            position,
            created_at: now,
            updated_at: now,
        };
        insert_case(&mut tx, &record).await?;

        tx.commit().await?;

        debug!("Created test case '{}' with ID: {}", record.name, record.id);

        Ok(record)
    }

    /// 根据ID获取用例
    pub async fn get_by_id(&self, id: &str) -> Result<Option<TestCaseRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_case(&mut conn, id).await
    }

    /// 按顺序列出场景下的用例
    pub async fn list_by_scenario(&self, scenario_id: &str) -> Result<Vec<TestCaseRecord>> {
        let cases = sqlx::query_as::<_, TestCaseRecord>(
            r#"
            SELECT id, scenario_id, name, description, position, created_at, updated_at
            FROM test_cases
            WHERE scenario_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(scenario_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(cases)
    }

    /// 更新名称和描述
    pub async fn update(&self, id: &str, name: &str, description: Option<&str>) -> Result<()> {
        validate_name(name)?;

        let result = sqlx::query(
            "UPDATE test_cases SET name = ?, description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Test case {} not found", id)));
        }

        debug!("Updated test case {}", id);

        Ok(())
    }

    /// 删除用例及其步骤, 重排剩余用例
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let case = require_case(&mut tx, id).await?;

        sqlx::query("DELETE FROM test_cases WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        ordering::compact(&mut tx, Siblings::TestCases, &case.scenario_id).await?;

        tx.commit().await?;

        debug!("Deleted test case {}", id);

        Ok(())
    }

    /// 移动用例, 可跨场景 (但不可跨计划)
    pub async fn move_to(
        &self,
        id: &str,
        target_scenario_id: Option<&str>,
        position: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let case = require_case(&mut tx, id).await?;
        let source_scenario = require_scenario(&mut tx, &case.scenario_id).await?;
        let target_id = target_scenario_id.unwrap_or(&case.scenario_id).to_string();

        if target_id != case.scenario_id {
            let target = require_scenario(&mut tx, &target_id).await?;
            if target.plan_id != source_scenario.plan_id {
                return Err(StorageError::ValidationError(format!(
                    "Scenario {} belongs to another plan",
                    target_id
                )));
            }

            sqlx::query("UPDATE test_cases SET scenario_id = ?, updated_at = ? WHERE id = ?")
                .bind(&target_id)
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await?;

            ordering::compact(&mut tx, Siblings::TestCases, &case.scenario_id).await?;
        }

        let mut ids = ordering::sibling_ids(&mut tx, Siblings::TestCases, &target_id).await?;
        ordering::place(&mut ids, case.id.clone(), position);
        ordering::reindex(&mut tx, Siblings::TestCases, &ids).await?;

        tx.commit().await?;

        debug!("Moved test case {} to {}:{}", id, target_id, position);

        Ok(())
    }

    /// 深拷贝用例, 副本紧跟在原用例之后
    pub async fn copy(&self, id: &str) -> Result<TestCaseRecord> {
        let mut tx = self.pool.begin().await?;

        let source = require_case(&mut tx, id).await?;
        let copy = copy_case_into(
            &mut tx,
            &source,
            &source.scenario_id,
            format!("{}_copy", source.name),
            source.position + 1,
        )
        .await?;

        let mut ids = ordering::sibling_ids(&mut tx, Siblings::TestCases, &source.scenario_id).await?;
        ordering::place(&mut ids, copy.id.clone(), source.position + 1);
        ordering::reindex(&mut tx, Siblings::TestCases, &ids).await?;

        tx.commit().await?;

        debug!("Copied test case {} to {}", id, copy.id);

        Ok(copy)
    }
}

pub(crate) async fn insert_case(conn: &mut SqliteConnection, case: &TestCaseRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO test_cases
        (id, scenario_id, name, description, position, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&case.id)
    .bind(&case.scenario_id)
    .bind(&case.name)
    .bind(&case.description)
    .bind(case.position)
    .bind(case.created_at)
    .bind(case.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::from_insert(e, || format!("Test case {} already exists", case.id)))?;

    Ok(())
}

/// 把用例及其步骤复制到目标场景 (全部使用新ID)
pub(crate) async fn copy_case_into(
    conn: &mut SqliteConnection,
    source: &TestCaseRecord,
    scenario_id: &str,
    name: String,
    position: i64,
) -> Result<TestCaseRecord> {
    let now = Utc::now();
    let copy = TestCaseRecord {
        id: Uuid::new_v4().to_string(),
        scenario_id: scenario_id.to_string(),
        name,
        description: source.description.clone(),
        position,
        created_at: now,
        updated_at: now,
    };
    insert_case(conn, &copy).await?;

    let steps = sqlx::query_as::<_, StepRecord>(
        r#"
        SELECT id, case_id, name, position, protocol, payload, expected, timeout_ms,
               created_at, updated_at
        FROM test_steps
        WHERE case_id = ?
        ORDER BY position ASC
        "#,
    )
    .bind(&source.id)
    .fetch_all(&mut *conn)
    .await?;

    for step in steps {
        let step_copy = StepRecord {
            id: Uuid::new_v4().to_string(),
            case_id: copy.id.clone(),
            created_at: now,
            updated_at: now,
            ..step
        };
        insert_step(conn, &step_copy).await?;
    }

    Ok(copy)
}

pub(crate) async fn fetch_case(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<TestCaseRecord>> {
    let case = sqlx::query_as::<_, TestCaseRecord>(
        r#"
        SELECT id, scenario_id, name, description, position, created_at, updated_at
        FROM test_cases
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(case)
}

pub(crate) async fn require_case(conn: &mut SqliteConnection, id: &str) -> Result<TestCaseRecord> {
    fetch_case(conn, id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("Test case {} not found", id)))
}
