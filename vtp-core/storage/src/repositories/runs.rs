use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::{NodeResultRecord, RunFilter, RunRecord};

const RUN_COLUMNS: &str = r#"
    id, plan_id, plan_name, mode, selection, status, error, started_at, ended_at,
    total_steps, executed_steps, passed_count, failed_count, error_count,
    skipped_count, cancelled_count
"#;

/// 要随执行结果一起重建的失败索引
#[derive(Debug, Clone)]
pub struct FailedIndexUpdate {
    pub plan_id: String,
    pub step_ids: Vec<String>,
}

/// 执行记录仓储
///
/// 执行记录只追加: 进入终态后状态与节点结果都不能再修改。
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 写入一条运行中的执行记录
    pub async fn create(&self, run: &RunRecord) -> Result<()> {
        if run.is_terminal() {
            return Err(StorageError::ValidationError(format!(
                "Run {} must start in a non-terminal state, got '{}'",
                run.id, run.status
            )));
        }

        let sql = format!(
            "INSERT INTO test_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RUN_COLUMNS
        );

        bind_run(sqlx::query(&sql), run)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_insert(e, || format!("Run {} already exists", run.id)))?;

        debug!("Created run {} for plan {}", run.id, run.plan_id);

        Ok(())
    }

    /// 原子地写入终态、节点结果, 并可选地重建失败索引
    ///
    /// 记录已处于终态时返回 [`StorageError::Immutable`]。
    pub async fn complete(
        &self,
        run: &RunRecord,
        results: &[NodeResultRecord],
        failed_index: Option<&FailedIndexUpdate>,
    ) -> Result<()> {
        if !run.is_terminal() {
            return Err(StorageError::ValidationError(format!(
                "Run {} cannot complete with status '{}'",
                run.id, run.status
            )));
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE test_runs
            SET status = ?, error = ?, ended_at = ?,
                total_steps = ?, executed_steps = ?, passed_count = ?, failed_count = ?,
                error_count = ?, skipped_count = ?, cancelled_count = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(&run.status)
        .bind(&run.error)
        .bind(run.ended_at)
        .bind(run.total_steps)
        .bind(run.executed_steps)
        .bind(run.passed_count)
        .bind(run.failed_count)
        .bind(run.error_count)
        .bind(run.skipped_count)
        .bind(run.cancelled_count)
        .bind(&run.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match fetch_run(&mut tx, &run.id).await? {
                Some(_) => StorageError::Immutable(format!("Run {} is already finished", run.id)),
                None => StorageError::NotFound(format!("Run {} not found", run.id)),
            });
        }

        for node in results {
            insert_node_result(&mut tx, &run.id, node).await?;
        }

        if let Some(index) = failed_index {
            sqlx::query("DELETE FROM failed_nodes WHERE plan_id = ?")
                .bind(&index.plan_id)
                .execute(&mut *tx)
                .await?;

            // 计划或步骤已被删除时跳过
            for step_id in &index.step_ids {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO failed_nodes (plan_id, step_id, run_id)
                    SELECT s.plan_id, t.id, ?
                    FROM test_steps t
                    JOIN test_cases c ON t.case_id = c.id
                    JOIN scenarios s ON c.scenario_id = s.id
                    WHERE t.id = ? AND s.plan_id = ?
                    "#,
                )
                .bind(&run.id)
                .bind(step_id)
                .bind(&index.plan_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(
            "Run {} finished with status '{}' ({} node results)",
            run.id,
            run.status,
            results.len()
        );

        Ok(())
    }

    /// 根据ID获取执行记录
    pub async fn get_by_id(&self, id: &str) -> Result<Option<RunRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_run(&mut conn, id).await
    }

    /// 获取执行记录的节点结果 (先序)
    pub async fn get_results(&self, run_id: &str) -> Result<Vec<NodeResultRecord>> {
        let results = sqlx::query_as::<_, NodeResultRecord>(
            r#"
            SELECT id, run_id, node_id, node_kind, parent_id, position, name, status,
                   reason, protocol, expected, actual, diff, started_at, ended_at
            FROM node_results
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }

    /// 计划最近一次完成的执行
    pub async fn latest_finished(&self, plan_id: &str) -> Result<Option<RunRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM test_runs
            WHERE plan_id = ? AND status NOT IN ('pending', 'running')
            ORDER BY ended_at DESC, started_at DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        );

        let run = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(run)
    }

    /// 查询执行历史 (最新的在前)
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut query = format!("SELECT {} FROM test_runs WHERE 1=1", RUN_COLUMNS);
        let mut bindings = Vec::new();

        if let Some(plan_id) = &filter.plan_id {
            query.push_str(" AND plan_id = ?");
            bindings.push(plan_id.clone());
        }

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.clone());
        }

        query.push_str(" ORDER BY started_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = filter.offset {
            if filter.limit.is_none() {
                query.push_str(" LIMIT -1");
            }
            query.push_str(&format!(" OFFSET {}", offset));
        }

        let mut sql_query = sqlx::query_as::<_, RunRecord>(&query);
        for binding in &bindings {
            sql_query = sql_query.bind(binding);
        }

        let runs = sql_query.fetch_all(&self.pool).await?;

        Ok(runs)
    }

    /// 统计执行记录数量
    pub async fn count(&self, filter: &RunFilter) -> Result<i64> {
        let mut query = String::from("SELECT COUNT(*) FROM test_runs WHERE 1=1");
        let mut bindings = Vec::new();

        if let Some(plan_id) = &filter.plan_id {
            query.push_str(" AND plan_id = ?");
            bindings.push(plan_id.clone());
        }

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.clone());
        }

        let mut sql_query = sqlx::query_as::<_, (i64,)>(&query);
        for binding in &bindings {
            sql_query = sql_query.bind(binding);
        }

        let (count,) = sql_query.fetch_one(&self.pool).await?;

        Ok(count)
    }

    /// 计划当前的失败步骤索引 (按写入顺序)
    pub async fn failed_steps(&self, plan_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT step_id FROM failed_nodes WHERE plan_id = ? ORDER BY rowid ASC",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

fn bind_run<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    run: &'q RunRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&run.id)
        .bind(&run.plan_id)
        .bind(&run.plan_name)
        .bind(&run.mode)
        .bind(&run.selection)
        .bind(&run.status)
        .bind(&run.error)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.total_steps)
        .bind(run.executed_steps)
        .bind(run.passed_count)
        .bind(run.failed_count)
        .bind(run.error_count)
        .bind(run.skipped_count)
        .bind(run.cancelled_count)
}

async fn fetch_run(conn: &mut SqliteConnection, id: &str) -> Result<Option<RunRecord>> {
    let sql = format!("SELECT {} FROM test_runs WHERE id = ?", RUN_COLUMNS);

    let run = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(run)
}

async fn insert_node_result(
    conn: &mut SqliteConnection,
    run_id: &str,
    node: &NodeResultRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO node_results
        (run_id, node_id, node_kind, parent_id, position, name, status, reason,
         protocol, expected, actual, diff, started_at, ended_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(&node.node_id)
    .bind(&node.node_kind)
    .bind(&node.parent_id)
    .bind(node.position)
    .bind(&node.name)
    .bind(&node.status)
    .bind(&node.reason)
    .bind(&node.protocol)
    .bind(&node.expected)
    .bind(&node.actual)
    .bind(&node.diff)
    .bind(node.started_at)
    .bind(node.ended_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        StorageError::from_insert(e, || {
            format!("Result for node {} already recorded in run {}", node.node_id, run_id)
        })
    })?;

    Ok(())
}
