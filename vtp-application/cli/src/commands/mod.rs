//! CLI 命令处理模块

pub mod case;
pub mod common; // 公共工具函数
pub mod compare;
pub mod plan;
pub mod run;
pub mod scenario;
pub mod step;
