//! VTP CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use vtp_executor::VtpConfig;

mod commands;

#[derive(Parser)]
#[command(name = "vtp")]
#[command(about = "VTP - 车载 ECU 仿真测试计划执行工具", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (缺省取配置文件或 VTP_LOG_LEVEL)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 测试计划管理
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// 场景管理
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// 测试用例管理
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },

    /// 测试步骤管理
    Step {
        #[command(subcommand)]
        action: StepAction,
    },

    /// 执行测试计划
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// 比较期望值与实际值
    Compare {
        /// 期望值文件 (ExpectSpec 或普通值, JSON/YAML)
        #[arg(long)]
        expect: String,
        /// 实际值文件 (JSON/YAML)
        #[arg(long)]
        actual: String,
    },
}

/// 导出格式
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum PlanAction {
    /// 从 YAML/JSON 文件导入计划
    Import {
        /// 计划文件路径
        file: String,
    },
    /// 列出计划
    List,
    /// 显示计划结构
    Show {
        /// 计划名称或 ID
        plan: String,
    },
    /// 导出计划
    Export {
        /// 计划名称或 ID
        plan: String,
        /// 输出文件 (缺省打印到标准输出)
        #[arg(short, long)]
        output: Option<String>,
        /// 导出格式
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: Format,
    },
    /// 重命名计划
    Rename {
        /// 计划名称或 ID
        plan: String,
        /// 新名称
        name: String,
    },
    /// 删除计划 (执行历史保留)
    Delete {
        /// 计划名称或 ID
        plan: String,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// 在计划末尾创建场景
    Create {
        /// 计划名称或 ID
        plan: String,
        /// 场景名称
        name: String,
        /// 描述
        #[arg(short, long)]
        description: Option<String>,
    },
    /// 修改场景名称
    Rename { id: String, name: String },
    /// 调整场景位置
    Move {
        id: String,
        /// 目标位置 (从 0 开始)
        position: i64,
    },
    /// 深拷贝场景
    Copy { id: String },
    /// 删除场景
    Delete { id: String },
}

#[derive(Subcommand)]
enum CaseAction {
    /// 在场景末尾创建用例
    Create {
        /// 场景 ID
        scenario: String,
        /// 用例名称
        name: String,
        /// 描述
        #[arg(short, long)]
        description: Option<String>,
    },
    /// 修改用例名称
    Rename { id: String, name: String },
    /// 调整用例位置, 可移动到同一计划的其他场景
    Move {
        id: String,
        /// 目标位置 (从 0 开始)
        position: i64,
        /// 目标场景 ID
        #[arg(long)]
        scenario: Option<String>,
    },
    /// 深拷贝用例
    Copy { id: String },
    /// 删除用例
    Delete { id: String },
}

#[derive(Subcommand)]
enum StepAction {
    /// 在用例末尾添加步骤
    Add {
        /// 用例 ID
        case: String,
        /// 步骤名称
        name: String,
        /// 协议类型 (rpc/topic/can/someip/fsa/dtc/ctd)
        #[arg(short, long)]
        protocol: String,
        /// 请求载荷 (JSON, 或 @文件)
        #[arg(long, default_value = "{}")]
        payload: String,
        /// 期望值 (ExpectSpec JSON, 或 @文件)
        #[arg(short, long)]
        expected: Option<String>,
        /// 超时 (毫秒)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// 编辑步骤 (会从失败索引中移除)
    Edit {
        id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        protocol: Option<String>,
        #[arg(long)]
        payload: Option<String>,
        #[arg(short, long)]
        expected: Option<String>,
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// 调整步骤位置, 可移动到同一计划的其他用例
    Move {
        id: String,
        /// 目标位置 (从 0 开始)
        position: i64,
        /// 目标用例 ID
        #[arg(long)]
        case: Option<String>,
    },
    /// 删除步骤
    Delete { id: String },
}

/// 执行模式
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Full,
    LastFailed,
    Partial,
}

#[derive(Subcommand)]
enum RunAction {
    /// 启动执行并等待结束 (Ctrl-C 取消)
    Start {
        /// 计划名称或 ID
        plan: String,
        /// 执行模式
        #[arg(short, long, value_enum, default_value = "full")]
        mode: ModeArg,
        /// partial 模式选中的节点 ID (可重复)
        #[arg(short, long)]
        node: Vec<String>,
        /// 结束后写入报告文件
        #[arg(short, long)]
        report: Option<String>,
    },
    /// 查看执行状态
    Status { run_id: String },
    /// 执行历史
    List {
        /// 计划名称或 ID
        #[arg(short, long)]
        plan: Option<String>,
        /// 最大条数
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// 计划当前的失败步骤
    Failed {
        /// 计划名称或 ID
        plan: String,
    },
    /// 导出执行报告
    Export {
        run_id: String,
        /// 输出文件 (缺省打印到标准输出)
        #[arg(short, long)]
        output: Option<String>,
        /// 导出格式
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
    },
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VtpConfig::load_from_path(path)?,
        None => VtpConfig::load()?,
    };
    config.validate()?;

    // 初始化日志
    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_writer(std::io::stderr)
        .init();

    info!("VTP CLI 启动");

    // 处理命令
    match cli.command {
        Commands::Plan { action } => commands::plan::handle(action, &config).await?,
        Commands::Scenario { action } => commands::scenario::handle(action, &config).await?,
        Commands::Case { action } => commands::case::handle(action, &config).await?,
        Commands::Step { action } => commands::step::handle(action, &config).await?,
        Commands::Run { action } => commands::run::handle(action, &config).await?,
        Commands::Compare { expect, actual } => commands::compare::handle(&expect, &actual)?,
    }

    Ok(())
}
