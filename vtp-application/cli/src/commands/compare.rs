//! 期望值比较命令

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;
use std::path::Path;

use vtp_executor::{compare, ExpectSpec};

use super::common::read_file;

pub fn handle(expect: &str, actual: &str) -> Result<()> {
    let expected = load_expect(Path::new(expect))?;
    let actual: Value = read_file(Path::new(actual))?;

    let diff = compare(&expected, &actual);

    if diff.passed {
        println!("{} 期望值与实际值一致", "✓".green().bold());
        return Ok(());
    }

    println!("{} {} 处差异:\n", "✗".red().bold(), diff.mismatches.len());
    for mismatch in &diff.mismatches {
        println!(
            "  {} [{:?}] {}",
            mismatch.path.yellow(),
            mismatch.kind,
            mismatch.message
        );
        if let Some(expected) = &mismatch.expected {
            println!("    期望: {}", expected.to_string().bright_black());
        }
        if let Some(actual) = &mismatch.actual {
            println!("    实际: {}", actual.to_string().bright_black());
        }
    }

    anyhow::bail!("比较未通过")
}

/// 带 `policy` 字段的文档按 ExpectSpec 解析, 其余按普通值做精确比较
fn load_expect(path: &Path) -> Result<ExpectSpec> {
    let value: Value = read_file(path)?;
    if value.get("policy").is_some() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(ExpectSpec::exact_from(&value))
    }
}
