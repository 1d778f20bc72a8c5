//! 同级节点排序
//!
//! 每次结构变更后把同一父节点下的 position 重排为 0..n 的连续整数。

use sqlx::SqliteConnection;

use crate::error::Result;

/// 可排序的子表
#[derive(Debug, Clone, Copy)]
pub(crate) enum Siblings {
    Scenarios,
    TestCases,
    TestSteps,
}

impl Siblings {
    fn table(self) -> &'static str {
        match self {
            Siblings::Scenarios => "scenarios",
            Siblings::TestCases => "test_cases",
            Siblings::TestSteps => "test_steps",
        }
    }

    fn parent_column(self) -> &'static str {
        match self {
            Siblings::Scenarios => "plan_id",
            Siblings::TestCases => "scenario_id",
            Siblings::TestSteps => "case_id",
        }
    }
}

/// 按 position 顺序读取同级节点 ID
pub(crate) async fn sibling_ids(
    conn: &mut SqliteConnection,
    siblings: Siblings,
    parent_id: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ? ORDER BY position ASC, created_at ASC",
        siblings.table(),
        siblings.parent_column()
    );

    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// 按给定顺序重写 position
pub(crate) async fn reindex(
    conn: &mut SqliteConnection,
    siblings: Siblings,
    ordered_ids: &[String],
) -> Result<()> {
    let sql = format!("UPDATE {} SET position = ? WHERE id = ?", siblings.table());

    for (position, id) in ordered_ids.iter().enumerate() {
        sqlx::query(&sql)
            .bind(position as i64)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// 重排某个父节点下的全部子节点
pub(crate) async fn compact(
    conn: &mut SqliteConnection,
    siblings: Siblings,
    parent_id: &str,
) -> Result<()> {
    let ids = sibling_ids(conn, siblings, parent_id).await?;
    reindex(conn, siblings, &ids).await
}

/// 把 `id` 插入到 `position` 处 (越界时放到末尾)
pub(crate) fn place(ids: &mut Vec<String>, id: String, position: i64) {
    ids.retain(|existing| existing != &id);
    let index = position.clamp(0, ids.len() as i64) as usize;
    ids.insert(index, id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_place_reorders() {
        let mut list = ids(&["a", "b", "c", "d"]);
        place(&mut list, "d".to_string(), 0);
        assert_eq!(list, ids(&["d", "a", "b", "c"]));

        place(&mut list, "d".to_string(), 2);
        assert_eq!(list, ids(&["a", "b", "d", "c"]));
    }

    #[test]
    fn test_place_clamps_out_of_range() {
        let mut list = ids(&["a", "b"]);
        place(&mut list, "a".to_string(), 99);
        assert_eq!(list, ids(&["b", "a"]));

        place(&mut list, "x".to_string(), -5);
        assert_eq!(list, ids(&["x", "b", "a"]));
    }
}
