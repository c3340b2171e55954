//! 配置器子进程
//!
//! 持有子进程的 PID，提供存活检测和强制终止。

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::ExitStatus;

/// 会话子进程
///
/// 只被会话的就绪检测和关闭流程使用。
pub trait SessionProcess: Send {
    /// 子进程 PID
    fn pid(&self) -> Option<u32>;

    /// 非阻塞的存活检测（只检查 PID 是否存在，不回收僵尸进程）
    fn is_alive(&self) -> bool;

    /// 发送 SIGKILL，错误只记录不传播，可重复调用
    fn terminate(&mut self);

    /// 非阻塞地获取退出状态，成功时回收子进程
    fn try_wait(&mut self) -> Option<ExitStatus>;

    /// 阻塞等待子进程退出并回收
    fn wait(&mut self) -> Option<ExitStatus>;
}

/// 由 portable-pty 创建的子进程
pub struct ChildProcess {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    pid: Option<u32>,
    /// 已回收时的退出状态；回收后 PID 可能被复用，不能再向其发送信号
    exit_status: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn new(child: Box<dyn portable_pty::Child + Send + Sync>) -> Self {
        let pid = child.process_id();
        Self {
            child,
            pid,
            exit_status: None,
        }
    }

    fn nix_pid(&self) -> Option<Pid> {
        self.pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw)
    }
}

impl SessionProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.nix_pid() {
            // EPERM 说明进程存在，只是无权发送信号
            Some(pid) => matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM)),
            None => false,
        }
    }

    fn terminate(&mut self) {
        if !self.is_alive() {
            tracing::debug!("子进程已不存在，跳过终止: {:?}", self.pid);
            return;
        }
        let Some(pid) = self.nix_pid() else {
            return;
        };

        tracing::debug!("终止配置器子进程: {}", pid);
        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            tracing::error!("终止子进程 {} 时出错: {}", pid, e);
        }
    }

    fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit_status = status,
                Err(e) => tracing::warn!("获取子进程 {:?} 状态失败: {}", self.pid, e),
            }
        }
        self.exit_status.clone()
    }

    fn wait(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => tracing::warn!("等待子进程 {:?} 退出失败: {}", self.pid, e),
            }
        }
        self.exit_status.clone()
    }
}
