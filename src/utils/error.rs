//! 错误类型定义
//!
//! 定义内核配置器会话的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 ConfiguratorError 枚举，涵盖会话建立、运行和关闭时的错误
//! - 映射到客户端可见的结果码（Outcome）
//! - 支持转换为 JSON-RPC 错误格式

use thiserror::Error;

use crate::rpc::types::{JsonRpcError, Outcome};

/// 配置器错误类型
#[derive(Debug, Error)]
pub enum ConfiguratorError {
    /// 镜像不存在
    #[error("镜像不存在: {0}")]
    ImageMissing(String),

    /// PTY 分配或子进程创建失败
    #[error("PTY 创建失败: {0}")]
    SpawnFailed(String),

    /// 配置器进程已终止（终端读写失败）
    #[error("内核配置器已终止: {0}")]
    Terminated(String),

    /// 主题不存在
    #[error("配置器主题不存在: {0}")]
    ThemeDoesNotExist(String),

    /// 会话不存在
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    /// 当前会话状态不允许该操作
    #[error("无效的会话状态: {0}")]
    InvalidState(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    InvalidConfig(String),

    /// 数据存储错误
    #[error("数据存储错误: {0}")]
    StoreError(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<ConfiguratorError> for JsonRpcError {
    fn from(err: ConfiguratorError) -> Self {
        // 应用特定的错误码范围 (-32000 到 -32099)
        let code = match &err {
            ConfiguratorError::SessionNotFound(_) => -32001,
            ConfiguratorError::InvalidState(_) => -32002,
            ConfiguratorError::ImageMissing(_) => -32003,
            ConfiguratorError::SpawnFailed(_) => -32010,
            ConfiguratorError::Terminated(_) => -32012,
            ConfiguratorError::ThemeDoesNotExist(_) => -32013,
            ConfiguratorError::StoreError(_) => -32020,
            ConfiguratorError::SerializationError(_) => -32700,
            ConfiguratorError::InvalidConfig(_) | ConfiguratorError::IoError(_) => -32603,
        };

        let mut data = serde_json::json!({
            "error_type": err.error_type(),
            "error_code": err.code(),
        });
        if let Some(outcome) = err.outcome() {
            data["status"] = serde_json::json!(outcome);
        }

        JsonRpcError {
            code,
            message: err.to_string(),
            data: Some(data),
        }
    }
}

impl ConfiguratorError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            ConfiguratorError::ImageMissing(_) => 2001,
            ConfiguratorError::SpawnFailed(_) => 2002,
            ConfiguratorError::Terminated(_) => 2004,
            ConfiguratorError::ThemeDoesNotExist(_) => 2005,
            ConfiguratorError::SessionNotFound(_) => 2006,
            ConfiguratorError::InvalidState(_) => 2007,
            ConfiguratorError::InvalidConfig(_) => 2009,
            ConfiguratorError::StoreError(_) => 2010,
            ConfiguratorError::IoError(_) => 2011,
            ConfiguratorError::SerializationError(_) => 2012,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            ConfiguratorError::ImageMissing(_) => "image_missing",
            ConfiguratorError::SpawnFailed(_) => "spawn_failed",
            ConfiguratorError::Terminated(_) => "terminated",
            ConfiguratorError::ThemeDoesNotExist(_) => "theme_does_not_exist",
            ConfiguratorError::SessionNotFound(_) => "session_not_found",
            ConfiguratorError::InvalidState(_) => "invalid_state",
            ConfiguratorError::InvalidConfig(_) => "invalid_config",
            ConfiguratorError::StoreError(_) => "store_error",
            ConfiguratorError::IoError(_) => "io_error",
            ConfiguratorError::SerializationError(_) => "serialization_error",
        }
    }

    /// 对应的客户端结果码
    ///
    /// 只有会话层面的失败才有结果码，其余错误仅作为被拒绝的请求返回。
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ConfiguratorError::ImageMissing(_) => Some(Outcome::ImageMissing),
            ConfiguratorError::SpawnFailed(_) => Some(Outcome::ConfiguratorPrepareFailed),
            ConfiguratorError::Terminated(_) => Some(Outcome::ConfiguratorTerminated),
            ConfiguratorError::ThemeDoesNotExist(_) => Some(Outcome::ThemeDoesNotExist),
            _ => None,
        }
    }

    /// 创建会话已终止错误
    pub fn session_terminated(session_id: &str) -> Self {
        ConfiguratorError::InvalidState(format!("会话 {} 已终止", session_id))
    }
}
