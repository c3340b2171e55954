//! 终端分配器
//!
//! 使用 portable-pty 分配伪终端，并在 slave 端启动内核配置器。
//! 调用方只拿到 master 描述符和子进程，fork/exec 的细节不对外暴露。

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};

use crate::config::ConfiguratorConfig;
use crate::rpc::types::TermSize;
use crate::session::theme::Theme;
use crate::utils::error::ConfiguratorError;

use super::process::{ChildProcess, SessionProcess};

/// 配置器启动命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguratorCommand {
    pub program: String,
    pub args: Vec<String>,
    /// 子进程的完整环境（替换而不是继承）
    pub env: Vec<(String, String)>,
}

impl ConfiguratorCommand {
    /// 为会话构建启动命令：`<helper> <config_dir>/.<session_id> <theme>`
    pub fn for_session(config: &ConfiguratorConfig, session_id: &str, theme: Theme) -> Self {
        let inherited_path = std::env::var("PATH").ok();
        Self {
            program: config.helper_script.clone(),
            args: vec![
                config.artifact_path(session_id).display().to_string(),
                theme.as_str().to_string(),
            ],
            env: vec![
                ("PATH".to_string(), config.child_path(inherited_path.as_deref())),
                ("TERM".to_string(), config.term.clone()),
            ],
        }
    }
}

/// 分配成功后的终端：master 描述符和子进程
pub struct SpawnedTerminal {
    pub descriptor: OwnedFd,
    pub process: Box<dyn SessionProcess>,
}

/// 终端分配器
pub trait TerminalAllocator: Send + Sync {
    /// 分配伪终端并启动命令
    ///
    /// 失败时不会留下任何已打开的描述符或子进程。
    fn spawn(
        &self,
        command: &ConfiguratorCommand,
        term_size: TermSize,
    ) -> Result<SpawnedTerminal, ConfiguratorError>;
}

/// 基于系统伪终端的分配器
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAllocator;

impl TerminalAllocator for NativeAllocator {
    fn spawn(
        &self,
        command: &ConfiguratorCommand,
        term_size: TermSize,
    ) -> Result<SpawnedTerminal, ConfiguratorError> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(pty_size(term_size))
            .map_err(|e| ConfiguratorError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.env_clear();
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| ConfiguratorError::SpawnFailed(e.to_string()))?;
        // 父进程不保留 slave 端，子进程退出后 master 读取才会报错
        drop(slave);

        let mut process = ChildProcess::new(child);

        let descriptor = match duplicate_master(master.as_ref()) {
            Ok(fd) => fd,
            Err(e) => {
                process.terminate();
                process.wait();
                return Err(e);
            }
        };

        tracing::debug!(
            "配置器已启动: {} (pid {:?}, fd {})",
            command.program,
            process.pid(),
            descriptor.as_raw_fd()
        );

        Ok(SpawnedTerminal {
            descriptor,
            process: Box::new(process),
        })
    }
}

/// 复制 master 描述符，复制品独立于 portable-pty 的 master 对象
fn duplicate_master(master: &dyn MasterPty) -> Result<OwnedFd, ConfiguratorError> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| ConfiguratorError::SpawnFailed("PTY master 没有文件描述符".to_string()))?;

    // SAFETY: raw 属于 master，master 在本函数返回前保持打开
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    borrowed
        .try_clone_to_owned()
        .map_err(|e| ConfiguratorError::SpawnFailed(format!("复制 PTY master 失败: {}", e)))
}

/// 转换为 portable-pty 的尺寸
pub fn pty_size(term_size: TermSize) -> PtySize {
    PtySize {
        rows: term_size.rows,
        cols: term_size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
