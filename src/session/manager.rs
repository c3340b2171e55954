//! 会话管理器
//!
//! 管理配置会话的建立、主题设置、启动、输入和结束。

use std::collections::HashMap;

use crate::rpc::types::{SessionInfo, SessionState};
use crate::utils::error::ConfiguratorError;

use super::session::{SessionDeps, SessionHandle};
use super::theme::{self, Theme};

/// 会话管理器
pub struct SessionManager {
    /// 会话映射表
    sessions: HashMap<String, SessionHandle>,
    deps: SessionDeps,
}

impl SessionManager {
    /// 创建新的会话管理器
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: HashMap::new(),
            deps,
        }
    }

    /// 为镜像建立配置会话
    ///
    /// 镜像不存在时返回 `ImageMissing`，不会创建会话。
    /// 已经自行终止的会话在此时被清理。
    pub async fn create_session(&mut self, image_id: &str) -> Result<String, ConfiguratorError> {
        self.prune_terminated();

        if self.deps.store.lookup_image(image_id).await?.is_none() {
            tracing::warn!("镜像不存在: {}", image_id);
            return Err(ConfiguratorError::ImageMissing(image_id.to_string()));
        }

        // 生成唯一会话 ID，同时用作配置文件名
        let session_id = uuid::Uuid::new_v4().to_string();
        let handle =
            SessionHandle::spawn(session_id.clone(), image_id.to_string(), self.deps.clone());
        self.sessions.insert(session_id.clone(), handle);

        tracing::info!("创建会话: {} (镜像 {})", session_id, image_id);
        Ok(session_id)
    }

    /// 可用主题
    pub fn themes(&self) -> Vec<&'static str> {
        theme::available_themes()
    }

    /// 设置会话主题
    pub async fn set_theme(&self, session_id: &str, theme: &str) -> Result<Theme, ConfiguratorError> {
        self.session(session_id)?.set_theme(theme).await
    }

    /// 启动会话的配置器
    pub async fn start(&self, session_id: &str) -> Result<(), ConfiguratorError> {
        self.session(session_id)?.start().await
    }

    /// 发送输入到会话
    pub async fn send_input(&self, session_id: &str, data: &str) -> Result<(), ConfiguratorError> {
        self.session(session_id)?.input(data).await?;
        tracing::debug!("发送输入到会话 {}: {} bytes", session_id, data.len());
        Ok(())
    }

    /// 结束会话，关闭流程完成后返回
    pub async fn end_session(&mut self, session_id: &str) -> Result<(), ConfiguratorError> {
        let handle = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ConfiguratorError::SessionNotFound(session_id.to_string()))?;

        handle.end().await;

        tracing::info!("结束会话: {}", session_id);
        Ok(())
    }

    /// 结束全部会话（连接断开）
    pub async fn shutdown(&mut self) {
        let handles: Vec<SessionHandle> = self.sessions.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        tracing::info!("连接结束，关闭 {} 个会话", handles.len());
        futures::future::join_all(handles.into_iter().map(SessionHandle::end)).await;
    }

    /// 列出所有会话
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(SessionHandle::info).collect()
    }

    /// 获取会话信息
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(SessionHandle::info)
    }

    /// 获取会话数量
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 移除已经自行终止的会话（配置器退出或启动失败）
    fn prune_terminated(&mut self) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, handle| handle.state() != SessionState::Terminated);

        let pruned = before - self.sessions.len();
        if pruned > 0 {
            tracing::debug!("清理 {} 个已终止的会话", pruned);
        }
    }

    fn session(&self, session_id: &str) -> Result<&SessionHandle, ConfiguratorError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| ConfiguratorError::SessionNotFound(session_id.to_string()))
    }
}
