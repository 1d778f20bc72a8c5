//! 场景管理命令

use anyhow::{Context, Result};
use colored::Colorize;

use vtp_executor::VtpConfig;

use super::common::open_store;

pub async fn handle(action: crate::ScenarioAction, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let scenarios = store.storage().scenarios();

    match action {
        crate::ScenarioAction::Create {
            plan,
            name,
            description,
        } => {
            let plan_id = store.resolve_plan_id(&plan).await?;
            let record = scenarios
                .create(&plan_id, &name, description.as_deref())
                .await?;
            println!(
                "{} 场景已创建: {} ({}, 位置 {})",
                "✓".green().bold(),
                record.name.cyan(),
                record.id.bright_black(),
                record.position
            );
        }

        crate::ScenarioAction::Rename { id, name } => {
            let record = scenarios
                .get_by_id(&id)
                .await?
                .with_context(|| format!("场景不存在: {}", id))?;
            scenarios
                .update(&id, &name, record.description.as_deref())
                .await?;
            println!("{} 场景已重命名为 {}", "✓".green(), name.cyan());
        }

        crate::ScenarioAction::Move { id, position } => {
            scenarios.move_to(&id, position).await?;
            println!("{} 场景已移动到位置 {}", "✓".green(), position);
        }

        crate::ScenarioAction::Copy { id } => {
            let copy = scenarios.copy(&id).await?;
            println!(
                "{} 场景已复制: {} ({})",
                "✓".green().bold(),
                copy.name.cyan(),
                copy.id.bright_black()
            );
        }

        crate::ScenarioAction::Delete { id } => {
            scenarios.delete(&id).await?;
            println!("{} 场景已删除: {}", "✓".green(), id);
        }
    }

    Ok(())
}
