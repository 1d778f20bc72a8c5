//! 测试用例管理命令

use anyhow::{Context, Result};
use colored::Colorize;

use vtp_executor::VtpConfig;

use super::common::open_store;

pub async fn handle(action: crate::CaseAction, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let cases = store.storage().cases();

    match action {
        crate::CaseAction::Create {
            scenario,
            name,
            description,
        } => {
            let record = cases
                .create(&scenario, &name, description.as_deref())
                .await?;
            println!(
                "{} 用例已创建: {} ({}, 位置 {})",
                "✓".green().bold(),
                record.name.cyan(),
                record.id.bright_black(),
                record.position
            );
        }

        crate::CaseAction::Rename { id, name } => {
            let record = cases
                .get_by_id(&id)
                .await?
                .with_context(|| format!("用例不存在: {}", id))?;
            cases
                .update(&id, &name, record.description.as_deref())
                .await?;
            println!("{} 用例已重命名为 {}", "✓".green(), name.cyan());
        }

        crate::CaseAction::Move {
            id,
            position,
            scenario,
        } => {
            cases.move_to(&id, scenario.as_deref(), position).await?;
            println!("{} 用例已移动到位置 {}", "✓".green(), position);
        }

        crate::CaseAction::Copy { id } => {
            let copy = cases.copy(&id).await?;
            println!(
                "{} 用例已复制: {} ({})",
                "✓".green().bold(),
                copy.name.cyan(),
                copy.id.bright_black()
            );
        }

        crate::CaseAction::Delete { id } => {
            cases.delete(&id).await?;
            println!("{} 用例已删除: {}", "✓".green(), id);
        }
    }

    Ok(())
}
