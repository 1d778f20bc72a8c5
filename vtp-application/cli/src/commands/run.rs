//! 执行管理命令

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use std::time::Duration;

use vtp_executor::{
    ExecutionCoordinator, ExecutionMode, Run, RunReport, RunStatus, SqliteStore, VtpConfig,
};

use super::common::{open_store, print_result_tree, run_status_label, spinner, write_output};
use crate::{Format, ModeArg};

pub async fn handle(action: crate::RunAction, config: &VtpConfig) -> Result<()> {
    match action {
        crate::RunAction::Start {
            plan,
            mode,
            node,
            report,
        } => start_run(&plan, mode, node, report.as_deref(), config).await,
        crate::RunAction::Status { run_id } => show_status(&run_id, config).await,
        crate::RunAction::List { plan, limit } => list_runs(plan.as_deref(), limit, config).await,
        crate::RunAction::Failed { plan } => show_failed(&plan, config).await,
        crate::RunAction::Export {
            run_id,
            output,
            format,
        } => export_run(&run_id, output.as_deref(), format, config).await,
    }
}

async fn coordinator(config: &VtpConfig) -> Result<(ExecutionCoordinator, std::sync::Arc<SqliteStore>)> {
    let store = open_store(config).await?;
    let registry = config.build_registry().await?;
    let coordinator = ExecutionCoordinator::new(
        store.clone(),
        store.clone(),
        registry,
        config.coordinator_config(),
    );
    Ok((coordinator, store))
}

async fn start_run(
    plan: &str,
    mode: ModeArg,
    nodes: Vec<String>,
    report: Option<&str>,
    config: &VtpConfig,
) -> Result<()> {
    let (coordinator, store) = coordinator(config).await?;
    let plan_id = store.resolve_plan_id(plan).await?;

    let mode = match mode {
        ModeArg::Full => ExecutionMode::Full,
        ModeArg::LastFailed => ExecutionMode::LastFailed,
        ModeArg::Partial => ExecutionMode::partial(nodes),
    };

    let run_id = coordinator.start_run(&plan_id, mode).await?;
    let progress = spinner(format!("执行中: {}", run_id));

    let wait = coordinator.wait_run(&run_id);
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancelled = false;

    let run = loop {
        tokio::select! {
            run = &mut wait => break run?,
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                progress.set_message("正在取消...");
                coordinator.cancel_run(&run_id).await?;
            }
            _ = ticker.tick() => {
                if let Ok(current) = coordinator.get_run_status(&run_id).await {
                    progress.set_message(format!(
                        "执行中: {} (已完成场景 {}, 已执行步骤 {}/{})",
                        run_id,
                        current.root.children.len(),
                        current.counts.executed,
                        current.counts.total_steps
                    ));
                }
            }
        }
    };

    progress.finish_and_clear();
    print_run(&run);

    if let Some(path) = report {
        RunReport::from(run.clone()).write_to_file(path)?;
        println!("{} 报告已写入 {}", "✓".green(), path.cyan());
    }

    match run.status {
        RunStatus::Passed => Ok(()),
        status => anyhow::bail!("执行未通过: {}", status),
    }
}

fn print_run(run: &Run) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "执行报告".bold());
    println!("{}", "=".repeat(60));

    println!("执行 ID:  {}", run.id.bright_black());
    println!("计划:     {}", run.plan_name.cyan().bold());
    println!("模式:     {}", run.mode);
    println!("状态:     {}", run_status_label(run.status));
    if let Some(ms) = run.summary().duration_ms() {
        println!("耗时:     {} ms", ms.to_string().yellow());
    }
    if let Some(error) = &run.error {
        println!("错误:     {}", error.red());
    }
    println!();

    let c = &run.counts;
    println!("步骤统计:");
    println!("  总步骤: {}", c.total_steps.to_string().bright_blue());
    println!("  已执行: {}", c.executed.to_string().bright_blue());
    println!("  通过:   {}", c.passed.to_string().green());
    println!("  失败:   {}", c.failed.to_string().red());
    println!("  错误:   {}", c.error.to_string().red());
    println!("  跳过:   {}", c.skipped.to_string().bright_black());
    println!("  取消:   {}", c.cancelled.to_string().magenta());
    println!();

    print_result_tree(&run.root, 0);
    println!("{}", "=".repeat(60));
}

async fn show_status(run_id: &str, config: &VtpConfig) -> Result<()> {
    let (coordinator, _) = coordinator(config).await?;
    let run = coordinator.get_run_status(run_id).await?;
    print_run(&run);
    Ok(())
}

async fn list_runs(plan: Option<&str>, limit: usize, config: &VtpConfig) -> Result<()> {
    let (coordinator, store) = coordinator(config).await?;
    let plan_id = match plan {
        Some(plan) => Some(store.resolve_plan_id(plan).await?),
        None => None,
    };

    let runs = coordinator.list_runs(plan_id.as_deref(), Some(limit)).await?;
    if runs.is_empty() {
        println!("{} 没有执行记录", "ℹ".yellow());
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<10} {:<20} {:<10}",
        "ID".bold(),
        "计划".bold(),
        "模式".bold(),
        "结果".bold(),
        "开始时间".bold(),
        "步骤".bold()
    );
    println!("{}", "-".repeat(115));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<10} {:<20} {}/{}",
            run.id,
            run.plan_name,
            run.mode.to_string(),
            run_status_label(run.status),
            run.started_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            run.counts.passed,
            run.counts.executed
        );
    }

    Ok(())
}

async fn show_failed(plan: &str, config: &VtpConfig) -> Result<()> {
    let (coordinator, store) = coordinator(config).await?;
    let plan_id = store.resolve_plan_id(plan).await?;
    let failed = coordinator.get_last_failed_nodes(&plan_id).await?;

    if failed.is_empty() {
        println!("{} 没有失败步骤", "✓".green());
        return Ok(());
    }

    println!("{} {} 个失败步骤:", "✗".red(), failed.len());
    for step_id in failed {
        match store.storage().steps().get_by_id(&step_id).await? {
            Some(step) => println!("  {} {}", step.name, step_id.bright_black()),
            None => println!("  {}", step_id.bright_black()),
        }
    }

    Ok(())
}

async fn export_run(
    run_id: &str,
    output: Option<&str>,
    format: Format,
    config: &VtpConfig,
) -> Result<()> {
    let (coordinator, _) = coordinator(config).await?;
    let report = coordinator.export_run(run_id).await?;

    let content = match format {
        Format::Json => report.to_json()?,
        Format::Yaml => report.to_yaml()?,
    };

    write_output(&content, output)
}
