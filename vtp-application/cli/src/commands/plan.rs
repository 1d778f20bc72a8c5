//! 测试计划管理命令

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use std::path::Path;

use vtp_executor::{PlanSource, TestPlan, VtpConfig};

use super::common::{open_store, write_output};
use crate::Format;

pub async fn handle(action: crate::PlanAction, config: &VtpConfig) -> Result<()> {
    match action {
        crate::PlanAction::Import { file } => import_plan(&file, config).await,
        crate::PlanAction::List => list_plans(config).await,
        crate::PlanAction::Show { plan } => show_plan(&plan, config).await,
        crate::PlanAction::Export {
            plan,
            output,
            format,
        } => export_plan(&plan, output.as_deref(), format, config).await,
        crate::PlanAction::Rename { plan, name } => rename_plan(&plan, &name, config).await,
        crate::PlanAction::Delete { plan } => delete_plan(&plan, config).await,
    }
}

async fn import_plan(file: &str, config: &VtpConfig) -> Result<()> {
    let plan = TestPlan::from_file(Path::new(file))
        .with_context(|| format!("加载计划文件失败: {}", file))?;

    let store = open_store(config).await?;
    let imported = store.import_plan(&plan).await?;

    println!(
        "{} 计划已导入: {} ({})",
        "✓".green().bold(),
        imported.name.cyan(),
        imported.id.bright_black()
    );
    println!(
        "  场景: {}  步骤: {}",
        imported.scenarios.len().to_string().yellow(),
        imported.step_count().to_string().yellow()
    );

    Ok(())
}

async fn list_plans(config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let plans = store.storage().plans().list().await?;

    if plans.is_empty() {
        println!("{} 没有测试计划", "ℹ".yellow());
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<20}",
        "ID".bold(),
        "名称".bold(),
        "更新时间".bold()
    );
    println!("{}", "-".repeat(90));

    for plan in plans {
        println!(
            "{:<38} {:<30} {:<20}",
            plan.id,
            plan.name,
            plan.updated_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn show_plan(name_or_id: &str, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let plan_id = store.resolve_plan_id(name_or_id).await?;
    let plan = store
        .load_plan(&plan_id)
        .await?
        .with_context(|| format!("计划不存在: {}", name_or_id))?;

    println!("{} {}", plan.name.cyan().bold(), plan.id.bright_black());
    if let Some(desc) = &plan.description {
        println!("  {}", desc.bright_black());
    }

    for (si, scenario) in plan.scenarios.iter().enumerate() {
        println!(
            "  [{}] 场景 {} {}",
            si,
            scenario.name.bold(),
            scenario.id.bright_black()
        );
        for (ci, case) in scenario.cases.iter().enumerate() {
            println!("    [{}] 用例 {} {}", ci, case.name, case.id.bright_black());
            for (ti, step) in case.steps.iter().enumerate() {
                println!(
                    "      [{}] {} {} ({}, {}) {}",
                    ti,
                    "步骤".bright_black(),
                    step.name,
                    step.protocol.to_string().yellow(),
                    step.expected.policy(),
                    step.id.bright_black()
                );
            }
        }
    }

    let failed = store.storage().runs().failed_steps(&plan.id).await?;
    if !failed.is_empty() {
        println!("\n{} 失败步骤: {}", "✗".red(), failed.len());
    }

    Ok(())
}

async fn export_plan(
    name_or_id: &str,
    output: Option<&str>,
    format: Format,
    config: &VtpConfig,
) -> Result<()> {
    let store = open_store(config).await?;
    let plan = store.export_plan(name_or_id).await?;

    let content = match format {
        Format::Yaml => plan.to_yaml()?,
        Format::Json => plan.to_json()?,
    };

    write_output(&content, output)
}

async fn rename_plan(name_or_id: &str, name: &str, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let plan_id = store.resolve_plan_id(name_or_id).await?;
    store.storage().plans().rename(&plan_id, name).await?;

    println!("{} 计划已重命名为 {}", "✓".green(), name.cyan());
    Ok(())
}

async fn delete_plan(name_or_id: &str, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let plan_id = store.resolve_plan_id(name_or_id).await?;
    store.storage().plans().delete(&plan_id).await?;

    println!("{} 计划已删除: {}", "✓".green(), name_or_id);
    Ok(())
}
