//! 测试步骤管理命令

use anyhow::{Context, Result};
use colored::Colorize;

use vtp_executor::{step_draft, step_from_record, ExpectSpec, Step, VtpConfig};
use vtp_protocol::ProtocolKind;

use super::common::{open_store, parse_arg};

pub async fn handle(action: crate::StepAction, config: &VtpConfig) -> Result<()> {
    let store = open_store(config).await?;
    let steps = store.storage().steps();

    match action {
        crate::StepAction::Add {
            case,
            name,
            protocol,
            payload,
            expected,
            timeout_ms,
        } => {
            let step = Step {
                id: String::new(),
                name,
                protocol: protocol.parse::<ProtocolKind>()?,
                payload: parse_arg(&payload)?,
                expected: match expected {
                    Some(arg) => parse_arg::<ExpectSpec>(&arg)?,
                    None => ExpectSpec::Ignore,
                },
                timeout_ms,
            };

            let record = steps.create(&case, &step_draft(&step)?).await?;
            println!(
                "{} 步骤已添加: {} ({}, 位置 {})",
                "✓".green().bold(),
                record.name.cyan(),
                record.id.bright_black(),
                record.position
            );
        }

        crate::StepAction::Edit {
            id,
            name,
            protocol,
            payload,
            expected,
            timeout_ms,
        } => {
            let record = steps
                .get_by_id(&id)
                .await?
                .with_context(|| format!("步骤不存在: {}", id))?;
            let mut step = step_from_record(&record)?;

            if let Some(name) = name {
                step.name = name;
            }
            if let Some(protocol) = protocol {
                step.protocol = protocol.parse()?;
            }
            if let Some(payload) = payload {
                step.payload = parse_arg(&payload)?;
            }
            if let Some(expected) = expected {
                step.expected = parse_arg(&expected)?;
            }
            if timeout_ms.is_some() {
                step.timeout_ms = timeout_ms;
            }

            steps.update(&id, &step_draft(&step)?).await?;
            println!("{} 步骤已更新: {}", "✓".green(), step.name.cyan());
        }

        crate::StepAction::Move { id, position, case } => {
            steps.move_to(&id, case.as_deref(), position).await?;
            println!("{} 步骤已移动到位置 {}", "✓".green(), position);
        }

        crate::StepAction::Delete { id } => {
            steps.delete(&id).await?;
            println!("{} 步骤已删除: {}", "✓".green(), id);
        }
    }

    Ok(())
}
