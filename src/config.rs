//! 服务配置
//!
//! 从环境变量读取配置器会话所需的目录、脚本和就绪检测参数。

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::ConfiguratorError;

/// 默认的辅助脚本名称
pub const DEFAULT_HELPER_SCRIPT: &str = "run-configuration.sh";

/// 子进程使用的默认 TERM
pub const DEFAULT_TERM: &str = "xterm";

/// 默认的就绪检测次数
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 60;

/// 默认的就绪检测间隔
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(1);

/// 单次从终端读取的最大字节数
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// 配置器服务配置
#[derive(Debug, Clone)]
pub struct ConfiguratorConfig {
    /// 辅助脚本所在目录，会追加到子进程的 PATH
    pub base_dir: PathBuf,
    /// 配置文件目录，配置器在此写入 `.<session_id>`
    pub config_dir: PathBuf,
    /// 镜像数据存储文件
    pub store_path: PathBuf,
    /// 辅助脚本名称
    pub helper_script: String,
    /// 子进程的 TERM
    pub term: String,
    /// 就绪检测次数
    pub readiness_attempts: u32,
    /// 就绪检测间隔
    pub readiness_interval: Duration,
    /// 单次读取大小
    pub read_chunk_size: usize,
}

impl ConfiguratorConfig {
    /// 以指定目录为根创建默认配置
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            config_dir: base_dir.join("config_files"),
            store_path: base_dir.join("images.json"),
            base_dir,
            helper_script: DEFAULT_HELPER_SCRIPT.to_string(),
            term: DEFAULT_TERM.to_string(),
            readiness_attempts: DEFAULT_READINESS_ATTEMPTS,
            readiness_interval: DEFAULT_READINESS_INTERVAL,
            read_chunk_size: READ_CHUNK_SIZE,
        }
    }

    /// 从进程环境变量读取配置
    pub fn from_env() -> Result<Self, ConfiguratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过查找函数读取配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfiguratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_dir = lookup("KCONFIG_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);

        let mut config = Self::with_base_dir(base_dir);

        if let Some(dir) = lookup("KCONFIG_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("KCONFIG_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(script) = lookup("KCONFIG_HELPER_SCRIPT") {
            config.helper_script = script;
        }
        if let Some(term) = lookup("KCONFIG_TERM") {
            config.term = term;
        }
        if let Some(value) = lookup("CHECK_RUNNING_CONFIGURATION_ATTEMPTS") {
            config.readiness_attempts =
                parse_number("CHECK_RUNNING_CONFIGURATION_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("KCONFIG_READINESS_INTERVAL_MS") {
            let millis: u64 = parse_number("KCONFIG_READINESS_INTERVAL_MS", &value)?;
            config.readiness_interval = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// 会话配置文件路径：`<config_dir>/.<session_id>`
    pub fn artifact_path(&self, session_id: &str) -> PathBuf {
        self.config_dir.join(format!(".{}", session_id))
    }

    /// 子进程的 PATH：继承的 PATH 加上辅助脚本目录
    pub fn child_path(&self, inherited: Option<&str>) -> String {
        match inherited {
            Some(path) if !path.is_empty() => format!("{}:{}", path, self.base_dir.display()),
            _ => self.base_dir.display().to_string(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("kconfig-terminal"))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| Path::new(".").to_path_buf())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfiguratorError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfiguratorError::InvalidConfig(format!("{} 不是有效的数字: {}", key, value)))
}
