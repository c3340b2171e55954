//! RPC 数据类型定义
//!
//! 定义 JSON-RPC 请求、响应和通知的数据结构，以及会话状态和结果码。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::theme::Theme;

/// 终端尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// 会话状态
///
/// IDLE → STARTING → RUNNING → TERMINATED，TERMINATED 为终态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 已建立会话上下文，配置器尚未启动
    Idle,
    /// 子进程已创建，等待就绪
    Starting,
    /// 终端输入输出正在转发
    Running,
    /// 已终止
    Terminated,
}

/// 客户端可见的结果码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ready,
    ImageMissing,
    ConfiguratorPrepareFailed,
    ConfiguratorTerminated,
    ThemeDoesNotExist,
}

impl Outcome {
    /// 数值结果码
    pub fn code(&self) -> i32 {
        match self {
            Outcome::Ready => 0,
            Outcome::ImageMissing => 1,
            Outcome::ConfiguratorPrepareFailed => 2,
            Outcome::ConfiguratorTerminated => 3,
            Outcome::ThemeDoesNotExist => 4,
        }
    }
}

/// 会话信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub image_id: String,
    pub theme: Theme,
    pub state: SessionState,
    /// 会话终止时的结果码；客户端主动结束时为空
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
}

// ============ RPC 请求类型 ============

/// 建立配置会话请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfigurationRequest {
    pub image_id: String,
}

/// 建立配置会话响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfigurationResponse {
    pub session_id: String,
    pub status: Outcome,
}

/// 只携带会话 ID 的请求（start / end / get）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

/// 设置主题请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetThemeRequest {
    pub session_id: String,
    pub theme: String,
}

/// 输入请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub session_id: String,
    /// 用户输入，按 UTF-8 写入终端
    pub data: String,
}

/// 带结果码的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

// ============ RPC 通知类型 ============

/// 终端输出通知（partial）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNotification {
    pub session_id: String,
    pub data: String,
}

/// 会话结束通知（final）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalNotification {
    pub session_id: String,
    pub status: Outcome,
    pub code: i32,
}

/// 会话状态变更通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStateNotification {
    pub session_id: String,
    pub state: SessionState,
}

// ============ JSON-RPC 2.0 协议类型 ============

/// JSON-RPC 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// JSON-RPC 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

impl JsonRpcResponse {
    /// 创建成功响应
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// 创建错误响应
    pub fn error(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// 解析错误 (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    /// 无效请求 (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// 方法不存在 (-32601)
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method.into()),
            data: None,
        }
    }

    /// 无效参数 (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// 内部错误 (-32603)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// 创建新通知
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}
