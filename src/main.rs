//! 内核配置器 CLI 入口点
//!
//! 该程序作为独立进程运行，通过 stdin/stdout 与前端进行 JSON-RPC 通信。
//! 主要功能：
//! - 在伪终端中运行内核配置器并转发输入输出
//! - 配置器结束后把生成的内核配置写回镜像数据
//! - JSON-RPC 2.0 协议通信

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kconfig_terminal::config::ConfiguratorConfig;
use kconfig_terminal::pty::NativeAllocator;
use kconfig_terminal::rpc::RpcServer;
use kconfig_terminal::session::{SessionDeps, SessionManager};
use kconfig_terminal::store::JsonFileImageStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，输出到 stderr 避免干扰 JSON-RPC 通信
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ConfiguratorConfig::from_env()?;
    tokio::fs::create_dir_all(&config.config_dir).await?;

    tracing::info!(
        "内核配置器服务启动: config_dir={}, store={}",
        config.config_dir.display(),
        config.store_path.display()
    );

    let store = Arc::new(JsonFileImageStore::new(&config.store_path));
    let config = Arc::new(config);

    // 创建并运行 RPC 服务器
    let server = RpcServer::new(|notifier| {
        SessionManager::new(SessionDeps {
            config,
            allocator: Arc::new(NativeAllocator),
            store,
            notifier,
        })
    });
    server.run().await?;

    tracing::info!("内核配置器服务退出");
    Ok(())
}
