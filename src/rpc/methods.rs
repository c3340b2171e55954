//! RPC 方法注册和调用
//!
//! 实现 JSON-RPC 方法的注册和分发。

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{
    InitConfigurationRequest, InitConfigurationResponse, InputRequest, JsonRpcError,
    JsonRpcResponse, Outcome, SessionRequest, SetThemeRequest, StatusResponse,
};
use crate::session::SessionManager;
use crate::utils::error::ConfiguratorError;

/// RPC 方法处理器
pub struct RpcMethods {
    manager: SessionManager,
}

impl RpcMethods {
    /// 创建新的方法处理器
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// 调用指定方法
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        match method {
            "configuration.init" => self.configuration_init(params, id).await,
            "configuration.themes" => self.configuration_themes(id),
            "configuration.set_theme" => self.configuration_set_theme(params, id).await,
            "configuration.start" => self.configuration_start(params, id).await,
            "configuration.input" => self.configuration_input(params, id).await,
            "configuration.end" => self.configuration_end(params, id).await,
            "session.list" => self.session_list(id),
            "session.get" => self.session_get(params, id),
            _ => JsonRpcResponse::error(id, JsonRpcError::method_not_found(method)),
        }
    }

    /// 结束全部会话
    pub async fn shutdown(&mut self) {
        self.manager.shutdown().await;
    }

    /// 建立配置会话
    async fn configuration_init(
        &mut self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: InitConfigurationRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self.manager.create_session(&request.image_id).await {
            Ok(session_id) => success(
                id,
                InitConfigurationResponse {
                    session_id,
                    status: Outcome::Ready,
                },
            ),
            Err(e) => JsonRpcResponse::error(id, e.into()),
        }
    }

    /// 可用主题列表
    fn configuration_themes(&self, id: serde_json::Value) -> JsonRpcResponse {
        success(id, self.manager.themes())
    }

    /// 设置主题
    async fn configuration_set_theme(
        &mut self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: SetThemeRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self
            .manager
            .set_theme(&request.session_id, &request.theme)
            .await
        {
            Ok(_) => success(id, status(Outcome::Ready)),
            // 未知主题是正常结果而不是错误
            Err(ConfiguratorError::ThemeDoesNotExist(theme)) => {
                tracing::debug!("会话 {} 请求了不存在的主题: {}", request.session_id, theme);
                success(id, status(Outcome::ThemeDoesNotExist))
            }
            Err(e) => JsonRpcResponse::error(id, e.into()),
        }
    }

    /// 启动配置器
    async fn configuration_start(
        &mut self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: SessionRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self.manager.start(&request.session_id).await {
            Ok(()) => success(
                id,
                StatusResponse {
                    status: "starting".to_string(),
                },
            ),
            Err(e) => JsonRpcResponse::error(id, e.into()),
        }
    }

    /// 发送输入
    async fn configuration_input(
        &mut self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: InputRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self
            .manager
            .send_input(&request.session_id, &request.data)
            .await
        {
            Ok(()) => JsonRpcResponse::success(id, serde_json::Value::Null),
            Err(e) => JsonRpcResponse::error(id, e.into()),
        }
    }

    /// 结束会话
    async fn configuration_end(
        &mut self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: SessionRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self.manager.end_session(&request.session_id).await {
            Ok(()) => JsonRpcResponse::success(id, serde_json::Value::Null),
            Err(e) => JsonRpcResponse::error(id, e.into()),
        }
    }

    /// 列出所有会话
    fn session_list(&self, id: serde_json::Value) -> JsonRpcResponse {
        success(id, self.manager.list_sessions())
    }

    /// 获取会话信息
    fn session_get(
        &self,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        let request: SessionRequest = match parse_params(params) {
            Ok(r) => r,
            Err(e) => return JsonRpcResponse::error(id, e),
        };

        match self.manager.get_session(&request.session_id) {
            Some(session) => success(id, session),
            None => JsonRpcResponse::error(
                id,
                ConfiguratorError::SessionNotFound(request.session_id).into(),
            ),
        }
    }
}

/// 解析请求参数
fn parse_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("缺少参数"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("参数解析错误: {}", e)))
}

/// 序列化成功结果
fn success(id: serde_json::Value, result: impl Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, ConfiguratorError::from(e).into()),
    }
}

fn status(outcome: Outcome) -> StatusResponse {
    StatusResponse {
        status: serde_json::to_value(outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
    }
}
