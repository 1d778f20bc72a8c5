//! VTP 配置管理
//!
//! 支持从多个源加载配置:
//! - 环境变量 (优先级最高)
//! - 配置文件 (TOML/YAML/JSON)
//! - 默认值 (优先级最低)
//!
//! 配置文件搜索路径 (按优先级):
//! 1. `VTP_CONFIG` 环境变量指定的路径
//! 2. `./vtp.toml` (当前目录)
//! 3. `~/.config/vtp/config.toml` (用户配置目录)
//! 4. `/etc/vtp/config.toml` (系统配置目录)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use vtp_protocol::{AdapterRegistry, MockServiceAdapter, MockServiceConfig};

use crate::coordinator::CoordinatorConfig;

// ============================================
// 核心配置结构
// ============================================

/// VTP 配置 (顶层)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VtpConfig {
    /// 执行引擎配置
    #[serde(default)]
    pub engine: EngineConfig,

    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,

    /// 模拟服务 (启动时注册为协议适配器)
    #[serde(default)]
    pub mock_services: Vec<MockServiceConfig>,
}

/// 执行引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 步骤默认超时 (毫秒)
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// 内存中保留的已结束执行数量
    #[serde(default = "default_retain_finished_runs")]
    pub retain_finished_runs: usize,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径, 支持 `~` 与环境变量
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别 (trace/debug/info/warn/error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ============================================
// 默认值函数
// ============================================

fn default_step_timeout_ms() -> u64 {
    5_000
}
fn default_retain_finished_runs() -> usize {
    64
}
fn default_database_path() -> String {
    "~/.config/vtp/vtp.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
            retain_finished_runs: default_retain_finished_runs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// 配置加载实现
// ============================================

impl VtpConfig {
    /// 从多个源加载配置 (优先级: 环境变量 > 配置文件 > 默认值)
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                debug!("加载配置文件: {:?}", path);
                Self::load_from_file(&path)?
            }
            None => {
                debug!("未找到配置文件, 使用默认配置");
                Self::default()
            }
        };

        config.apply_env_vars()?;

        Ok(config)
    }

    /// 从指定文件加载配置, 并应用环境变量覆盖
    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut config = Self::load_from_file(Path::new(path))?;
        config.apply_env_vars()?;
        Ok(config)
    }

    /// 从指定文件加载配置 (按扩展名选择格式)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {:?}", path))?,
            _ => anyhow::bail!("Unsupported config file format: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("VTP_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let mut candidates = vec![PathBuf::from("./vtp.toml"), PathBuf::from("./vtp.yaml")];

        if let Some(config_dir) = dirs::home_dir().map(|h| h.join(".config/vtp")) {
            candidates.push(config_dir.join("config.toml"));
            candidates.push(config_dir.join("config.yaml"));
        }

        #[cfg(target_os = "linux")]
        candidates.push(PathBuf::from("/etc/vtp/config.toml"));

        candidates.into_iter().find(|p| p.exists())
    }

    /// 从环境变量覆盖配置
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(path) = env::var("VTP_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(level) = env::var("VTP_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(timeout) = env::var("VTP_STEP_TIMEOUT_MS") {
            self.engine.default_step_timeout_ms = timeout
                .parse()
                .context("Invalid VTP_STEP_TIMEOUT_MS value")?;
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.engine.default_step_timeout_ms == 0 {
            anyhow::bail!("engine.default_step_timeout_ms must be greater than 0");
        }
        if self.database.path.trim().is_empty() {
            anyhow::bail!("database.path cannot be empty");
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.mock_services {
            if !seen.insert(service.kind) {
                anyhow::bail!("Duplicate mock service for protocol {}", service.kind);
            }
        }

        Ok(())
    }

    /// 展开后的数据库路径
    pub fn database_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.database.path)
            .with_context(|| format!("Failed to expand database path: {}", self.database.path))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// 协调器配置
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_step_timeout: Duration::from_millis(self.engine.default_step_timeout_ms),
            retain_finished_runs: self.engine.retain_finished_runs,
        }
    }

    /// 按配置注册模拟服务
    pub async fn build_registry(&self) -> Result<Arc<AdapterRegistry>> {
        let registry = Arc::new(AdapterRegistry::new());

        for service in &self.mock_services {
            registry
                .register(Arc::new(MockServiceAdapter::new(service.clone())))
                .await
                .with_context(|| format!("Failed to register mock service {}", service.kind))?;
        }

        Ok(registry)
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(self).context("Failed to serialize to TOML")?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).context("Failed to serialize to YAML")?
            }
            Some("json") => {
                serde_json::to_string_pretty(self).context("Failed to serialize to JSON")?
            }
            _ => anyhow::bail!("Unsupported config file format: {:?}", path),
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
