//! RPC 服务器实现
//!
//! 通过 stdin/stdout 实现 JSON-RPC 2.0 通信。

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use super::methods::RpcMethods;
use super::types::{
    FinalNotification, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    Outcome, OutputNotification, SessionState, SessionStateNotification,
};
use crate::session::SessionManager;

/// 连接结束后等待剩余通知写出的时间
const NOTIFICATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type SendResult = Result<(), mpsc::error::SendError<JsonRpcNotification>>;

/// 通知发送器，可以克隆并在多个地方使用
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<JsonRpcNotification>,
}

impl NotificationSender {
    /// 创建新的通知发送器
    pub fn new(tx: mpsc::UnboundedSender<JsonRpcNotification>) -> Self {
        Self { tx }
    }

    /// 发送通知
    pub fn send(&self, notification: JsonRpcNotification) -> SendResult {
        self.tx.send(notification)
    }

    /// 发送配置器输出（partial）
    pub fn send_partial(&self, session_id: &str, data: &str) -> SendResult {
        let params = OutputNotification {
            session_id: session_id.to_string(),
            data: data.to_string(),
        };
        self.send(JsonRpcNotification::new(
            "configurator.output",
            serde_json::json!(params),
        ))
    }

    /// 发送会话最终结果（final）
    pub fn send_final(&self, session_id: &str, outcome: Outcome) -> SendResult {
        let params = FinalNotification {
            session_id: session_id.to_string(),
            status: outcome,
            code: outcome.code(),
        };
        self.send(JsonRpcNotification::new(
            "configurator.final",
            serde_json::json!(params),
        ))
    }

    /// 发送会话状态变更通知
    pub fn send_state(&self, session_id: &str, state: SessionState) -> SendResult {
        let params = SessionStateNotification {
            session_id: session_id.to_string(),
            state,
        };
        self.send(JsonRpcNotification::new("session.state", serde_json::json!(params)))
    }
}

/// RPC 服务器
pub struct RpcServer {
    methods: Arc<Mutex<RpcMethods>>,
    notification_rx: mpsc::UnboundedReceiver<JsonRpcNotification>,
}

impl RpcServer {
    /// 创建新的 RPC 服务器
    ///
    /// `build_manager` 接收通知发送器并构建会话管理器。
    pub fn new<F>(build_manager: F) -> Self
    where
        F: FnOnce(NotificationSender) -> SessionManager,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = build_manager(NotificationSender::new(tx));

        Self {
            methods: Arc::new(Mutex::new(RpcMethods::new(manager))),
            notification_rx: rx,
        }
    }

    /// 运行 RPC 服务器，直到 stdin 关闭
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            methods,
            mut notification_rx,
        } = self;

        let stdin = tokio::io::stdin();
        let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
        let mut reader = BufReader::new(stdin);

        let mut line = String::new();

        // 启动通知发送任务
        let stdout_for_notifications = stdout.clone();
        let mut notification_task = tokio::spawn(async move {
            while let Some(notification) = notification_rx.recv().await {
                let mut stdout = stdout_for_notifications.lock().await;
                if let Ok(json) = serde_json::to_string(&notification) {
                    let _ = stdout.write_all(json.as_bytes()).await;
                    let _ = stdout.write_all(b"\n").await;
                    let _ = stdout.flush().await;
                }
            }
        });

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                tracing::info!("stdin 关闭，结束所有会话");
                break;
            }

            let line_trimmed = line.trim();
            if line_trimmed.is_empty() {
                continue;
            }

            // 请求按顺序处理，保证输入按提交顺序写入终端
            let response = handle_request(&methods, line_trimmed).await;

            let response_json = serde_json::to_string(&response)?;
            let mut stdout = stdout.lock().await;
            stdout.write_all(response_json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }

        methods.lock().await.shutdown().await;
        // 释放全部发送端后通知任务自然结束
        drop(methods);

        if tokio::time::timeout(NOTIFICATION_DRAIN_TIMEOUT, &mut notification_task)
            .await
            .is_err()
        {
            tracing::warn!("通知未能在退出前全部写出");
            notification_task.abort();
        }

        Ok(())
    }
}

/// 处理单个请求
async fn handle_request(methods: &Mutex<RpcMethods>, line: &str) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return JsonRpcResponse::error(
                serde_json::Value::Null,
                JsonRpcError::parse_error(format!("JSON 解析错误: {}", e)),
            );
        }
    };

    // 验证 JSON-RPC 版本
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            request.id,
            JsonRpcError::invalid_request("无效的 JSON-RPC 版本"),
        );
    }

    let mut methods = methods.lock().await;
    methods.call(&request.method, request.params, request.id).await
}
