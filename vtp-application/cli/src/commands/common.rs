//! 公共工具函数模块
//!
//! 提供各命令模块共享的功能，包括：
//! - 打开数据库与 SQLite 存储
//! - 读取 JSON/YAML 参数
//! - 状态与结果树的彩色输出

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vtp_executor::{NodeKind, NodeResult, NodeStatus, RunStatus, SqliteStore, VtpConfig};
use vtp_storage::{Storage, StorageManager};

/// 打开配置中的数据库
pub async fn open_store(config: &VtpConfig) -> Result<Arc<SqliteStore>> {
    let path = config.database_path()?;
    let manager = StorageManager::new(&path.to_string_lossy())
        .await
        .with_context(|| format!("初始化数据库失败: {}", path.display()))?;

    Ok(Arc::new(SqliteStore::new(Arc::new(Storage::from_manager(
        &manager,
    )))))
}

/// 读取参数值: `@路径` 从文件读取, 否则按字面内容解析 (JSON 或 YAML)
pub fn parse_arg<T: DeserializeOwned>(arg: &str) -> Result<T> {
    match arg.strip_prefix('@') {
        Some(path) => read_file(Path::new(path)),
        None => serde_yaml::from_str(arg).with_context(|| format!("解析参数失败: {}", arg)),
    }
}

/// 按扩展名读取 JSON 或 YAML 文件
pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("读取文件失败: {:?}", path))?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            serde_json::from_str(&content).with_context(|| format!("解析 JSON 失败: {:?}", path))
        }
        _ => serde_yaml::from_str(&content).with_context(|| format!("解析 YAML 失败: {:?}", path)),
    }
}

/// 输出文本到文件或标准输出
pub fn write_output(content: &str, output: Option<&str>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, content).with_context(|| format!("写入文件失败: {}", path))?;
            println!("{} 已写入 {}", "✓".green(), path.cyan());
        }
        None => println!("{}", content),
    }
    Ok(())
}

pub fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn node_status_label(status: NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Passed => "PASSED".green().bold(),
        NodeStatus::Failed => "FAILED".red().bold(),
        NodeStatus::Error => "ERROR".red(),
        NodeStatus::Cancelled => "CANCELLED".magenta(),
        NodeStatus::Skipped => "SKIPPED".bright_black(),
        NodeStatus::Pending | NodeStatus::Running => "RUNNING".yellow(),
    }
}

pub fn run_status_label(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Passed => "PASSED".green().bold(),
        RunStatus::Failed => "FAILED".red().bold(),
        RunStatus::Error => "ERROR".red(),
        RunStatus::Cancelled => "CANCELLED".magenta(),
        RunStatus::Pending | RunStatus::Running => "RUNNING".yellow(),
    }
}

/// 打印结果树
pub fn print_result_tree(node: &NodeResult, depth: usize) {
    let indent = "  ".repeat(depth);
    let kind = match node.kind {
        NodeKind::Plan => "计划",
        NodeKind::Scenario => "场景",
        NodeKind::TestCase => "用例",
        NodeKind::Step => "步骤",
    };

    println!(
        "{}{} {} {} {}",
        indent,
        node_status_label(node.status),
        kind.bright_black(),
        node.name,
        node.node_id.bright_black()
    );

    if node.kind == NodeKind::Step && node.status.is_failure() {
        if let Some(reason) = &node.reason {
            println!("{}    原因: {}", indent, reason.to_string().red());
        }
        if let Some(diff) = node.diff.as_ref().filter(|d| !d.passed) {
            for mismatch in &diff.mismatches {
                println!(
                    "{}    {} {}",
                    indent,
                    mismatch.path.yellow(),
                    mismatch.message
                );
            }
        }
    }

    for child in &node.children {
        print_result_tree(child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use vtp_executor::ExpectSpec;

    #[test]
    fn test_parse_inline_json_and_yaml() {
        let value: Value = parse_arg(r#"{"method": "door.lock"}"#).unwrap();
        assert_eq!(value, json!({"method": "door.lock"}));

        let spec: ExpectSpec = parse_arg("{policy: regex, pattern: '^ok'}").unwrap();
        assert_eq!(spec, ExpectSpec::regex("^ok"));
    }

    #[test]
    fn test_parse_file_arg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expected.json");
        fs::write(&path, r#"{"policy": "exists_only"}"#).unwrap();

        let spec: ExpectSpec = parse_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(spec, ExpectSpec::ExistsOnly);
        assert!(parse_arg::<Value>("@/nonexistent/file.json").is_err());
    }
}
