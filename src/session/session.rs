//! 配置器会话
//!
//! 每个会话由一个独立的 tokio 任务驱动，任务独占会话的全部状态：
//! 终端描述符、配置器子进程、I/O 桥和主题。外部通过 [`SessionHandle`]
//! 发送命令，会话按 IDLE → STARTING → RUNNING → TERMINATED 推进，
//! 并保证关闭流程只执行一次。

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::ConfiguratorConfig;
use crate::pty::{ConfiguratorCommand, SessionProcess, TerminalAllocator, TerminalBridge};
use crate::rpc::server::NotificationSender;
use crate::rpc::types::{Outcome, SessionInfo, SessionState, TermSize};
use crate::store::{self, ImageStore};
use crate::utils::error::ConfiguratorError;
use crate::utils::state::SessionStateManager;

use super::theme::Theme;

/// 启动配置器前发给客户端的提示
pub const START_BANNER: &str = "The kernel configurator will be started in a few seconds...\r\n";

/// 终端读写失败后查询退出状态的次数和间隔
const EXIT_STATUS_POLLS: u32 = 20;
const EXIT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 等待被终止的子进程回收的最长时间
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// 会话依赖
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<ConfiguratorConfig>,
    pub allocator: Arc<dyn TerminalAllocator>,
    pub store: Arc<dyn ImageStore>,
    pub notifier: NotificationSender,
}

type Reply<T> = oneshot::Sender<Result<T, ConfiguratorError>>;

/// 发给会话任务的命令
enum SessionCommand {
    SetTheme { theme: String, reply: Reply<Theme> },
    Start { reply: Reply<()> },
    Input { data: String, reply: Reply<()> },
    End { reply: oneshot::Sender<()> },
}

/// 会话句柄
///
/// 句柄被丢弃时会话任务收到通道关闭，执行关闭流程后退出。
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    info: watch::Receiver<SessionInfo>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// 启动会话任务
    pub fn spawn(id: String, image_id: String, deps: SessionDeps) -> Self {
        let info = SessionInfo {
            id: id.clone(),
            image_id: image_id.clone(),
            theme: Theme::default(),
            state: SessionState::Idle,
            outcome: None,
            created_at: Utc::now(),
        };
        let (info_tx, info_rx) = watch::channel(info);
        let (tx, rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("session", id = %id, image = %image_id);
        let session = Session {
            state: SessionStateManager::new(id.clone()),
            id: id.clone(),
            image_id,
            theme: Theme::default(),
            deps,
            process: None,
            pending_descriptor: None,
            bridge: None,
            info: info_tx,
            torn_down: false,
        };
        let task = tokio::spawn(session.run(rx).instrument(span));

        Self {
            id,
            commands: tx,
            info: info_rx,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前会话信息（会话结束后仍可读取）
    pub fn info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.info.borrow().state
    }

    pub fn theme(&self) -> Theme {
        self.info.borrow().theme
    }

    /// 设置主题，只能在启动前调用
    pub async fn set_theme(&self, theme: &str) -> Result<Theme, ConfiguratorError> {
        let theme = theme.to_string();
        self.request(|reply| SessionCommand::SetTheme { theme, reply })
            .await
    }

    /// 启动配置器
    ///
    /// 会话进入 STARTING 后立即返回，就绪结果通过 final 通知发出。
    pub async fn start(&self) -> Result<(), ConfiguratorError> {
        self.request(|reply| SessionCommand::Start { reply }).await
    }

    /// 把客户端输入写入终端
    pub async fn input(&self, data: &str) -> Result<(), ConfiguratorError> {
        let data = data.to_string();
        self.request(|reply| SessionCommand::Input { data, reply })
            .await
    }

    /// 结束会话，关闭流程完成后返回
    pub async fn end(self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::End { reply }).is_ok() {
            let _ = rx.await;
        }
        // 会话任务在关闭后立即退出
        if let Err(e) = self.task.await {
            tracing::error!("会话 {} 任务异常退出: {}", self.id, e);
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, ConfiguratorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ConfiguratorError::session_terminated(&self.id))?;
        rx.await
            .map_err(|_| ConfiguratorError::session_terminated(&self.id))?
    }
}

/// 就绪检测结果
enum Readiness {
    Ready,
    TimedOut,
    /// 会话在检测期间被结束，关闭流程已执行
    Cancelled,
}

/// 会话任务状态
struct Session {
    id: String,
    image_id: String,
    theme: Theme,
    state: SessionStateManager,
    deps: SessionDeps,
    process: Option<Box<dyn SessionProcess>>,
    /// STARTING 期间持有的 master 描述符，就绪后交给 I/O 桥
    pending_descriptor: Option<OwnedFd>,
    /// 只在 RUNNING 状态存在
    bridge: Option<TerminalBridge>,
    info: watch::Sender<SessionInfo>,
    torn_down: bool,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        tracing::debug!("会话已创建");

        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut commands).await,
                    None => {
                        tracing::info!("会话上下文已结束");
                        self.teardown(None).await;
                    }
                },
                output = next_output(self.bridge.as_mut()) => self.handle_output(output).await,
            }
        }

        tracing::debug!("会话任务退出");
    }

    async fn handle_command(
        &mut self,
        command: SessionCommand,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        match command {
            SessionCommand::SetTheme { theme, reply } => {
                let _ = reply.send(self.set_theme(&theme));
            }
            SessionCommand::Start { reply } => {
                if let Err(e) = self.state.transition_to(SessionState::Starting).into_result() {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.publish();
                let _ = reply.send(Ok(()));
                self.start(commands).await;
            }
            SessionCommand::Input { data, reply } => {
                let _ = reply.send(self.input(&data).await);
            }
            SessionCommand::End { reply } => {
                self.teardown(None).await;
                let _ = reply.send(());
            }
        }
    }

    fn set_theme(&mut self, theme: &str) -> Result<Theme, ConfiguratorError> {
        if self.state.has_started() {
            return Err(ConfiguratorError::InvalidState(
                "配置器已启动，不能修改主题".to_string(),
            ));
        }
        let theme: Theme = theme.parse()?;
        self.theme = theme;
        self.publish();
        tracing::debug!("主题设置为 {}", theme);
        Ok(theme)
    }

    async fn input(&mut self, data: &str) -> Result<(), ConfiguratorError> {
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(ConfiguratorError::InvalidState(format!(
                "配置器未运行: {:?}",
                self.state.state()
            )));
        };

        match bridge.write(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                self.handle_io_error(e).await;
                Err(ConfiguratorError::Terminated(message))
            }
        }
    }

    /// 启动配置器并等待就绪
    async fn start(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) {
        let _ = self.deps.notifier.send_partial(&self.id, START_BANNER);

        let command = ConfiguratorCommand::for_session(&self.deps.config, &self.id, self.theme);
        let spawned = match self.deps.allocator.spawn(&command, TermSize::default()) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("无法启动内核配置器: {}", e);
                self.finish(Outcome::ConfiguratorPrepareFailed).await;
                return;
            }
        };

        tracing::debug!("内核配置器已启动, pid {:?}", spawned.process.pid());
        self.process = Some(spawned.process);
        self.pending_descriptor = Some(spawned.descriptor);

        match self.wait_until_ready(commands).await {
            Readiness::Ready => self.attach().await,
            Readiness::TimedOut => {
                tracing::error!(
                    "内核配置器未能在 {} 次检测内就绪",
                    self.deps.config.readiness_attempts
                );
                self.finish(Outcome::ConfiguratorPrepareFailed).await;
            }
            Readiness::Cancelled => {}
        }
    }

    /// 按固定间隔检测子进程是否存在
    ///
    /// 等待期间仍处理命令：结束会话会取消检测，其余命令被拒绝。
    async fn wait_until_ready(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Readiness {
        let interval = self.deps.config.readiness_interval;

        for attempt in 0..self.deps.config.readiness_attempts {
            if self.process.as_ref().is_some_and(|p| p.is_alive()) {
                tracing::debug!("内核配置器在第 {} 次检测时就绪", attempt + 1);
                return Readiness::Ready;
            }

            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    biased;
                    command = commands.recv() => match command {
                        Some(SessionCommand::End { reply }) => {
                            self.teardown(None).await;
                            let _ = reply.send(());
                            return Readiness::Cancelled;
                        }
                        Some(SessionCommand::SetTheme { reply, .. }) => {
                            let _ = reply.send(Err(starting_error()));
                        }
                        Some(SessionCommand::Start { reply } | SessionCommand::Input { reply, .. }) => {
                            let _ = reply.send(Err(starting_error()));
                        }
                        None => {
                            tracing::info!("会话上下文在启动期间结束");
                            self.teardown(None).await;
                            return Readiness::Cancelled;
                        }
                    },
                    _ = &mut sleep => break,
                }
            }
        }

        Readiness::TimedOut
    }

    /// 把描述符交给 I/O 桥并进入 RUNNING
    async fn attach(&mut self) {
        let Some(descriptor) = self.pending_descriptor.take() else {
            tracing::error!("就绪后没有可用的终端描述符");
            self.finish(Outcome::ConfiguratorPrepareFailed).await;
            return;
        };

        if let Err(e) = self.state.transition_to(SessionState::Running).into_result() {
            tracing::error!("无法进入运行状态: {}", e);
            self.finish(Outcome::ConfiguratorPrepareFailed).await;
            return;
        }

        match TerminalBridge::attach(descriptor, self.deps.config.read_chunk_size) {
            Ok(bridge) => {
                self.bridge = Some(bridge);
                self.publish();
                let _ = self.deps.notifier.send_state(&self.id, SessionState::Running);
                tracing::info!("内核配置器正在运行");
            }
            Err(e) => {
                tracing::error!("注册终端描述符失败: {}", e);
                self.finish(Outcome::ConfiguratorPrepareFailed).await;
            }
        }
    }

    async fn handle_output(&mut self, output: io::Result<String>) {
        match output {
            Ok(chunk) => {
                let _ = self.deps.notifier.send_partial(&self.id, &chunk);
            }
            Err(e) => self.handle_io_error(e).await,
        }
    }

    /// 终端读写失败：子进程已经退出或崩溃
    async fn handle_io_error(&mut self, error: io::Error) {
        tracing::info!("终端读写结束: {}", error);
        let outcome = self.exit_outcome().await;
        self.finish(outcome).await;
    }

    /// 根据子进程退出状态区分正常退出和异常终止
    async fn exit_outcome(&mut self) -> Outcome {
        let Some(process) = self.process.as_mut() else {
            return Outcome::ConfiguratorTerminated;
        };

        for _ in 0..EXIT_STATUS_POLLS {
            if let Some(status) = process.try_wait() {
                tracing::debug!("内核配置器退出: {:?}", status);
                return if status.success() {
                    Outcome::Ready
                } else {
                    Outcome::ConfiguratorTerminated
                };
            }
            tokio::time::sleep(EXIT_STATUS_POLL_INTERVAL).await;
        }

        tracing::warn!("未能获取内核配置器的退出状态");
        Outcome::ConfiguratorTerminated
    }

    /// 执行关闭流程并发送最终结果
    async fn finish(&mut self, outcome: Outcome) {
        if self.teardown(Some(outcome)).await {
            let _ = self.deps.notifier.send_final(&self.id, outcome);
        }
    }

    /// 关闭流程，只执行一次
    ///
    /// 返回本次调用是否实际执行了关闭。
    async fn teardown(&mut self, outcome: Option<Outcome>) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        if let Some(mut bridge) = self.bridge.take() {
            bridge.detach();
        }
        if self.pending_descriptor.take().is_some() {
            tracing::debug!("关闭未注册的终端描述符");
        }

        if let Some(mut process) = self.process.take() {
            if process.is_alive() {
                process.terminate();
            }
            reap(process).await;
        }

        let artifact = self.deps.config.artifact_path(&self.id);
        match store::save_kernel_config(self.deps.store.as_ref(), &self.image_id, &artifact).await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("未找到内核配置文件: {}", artifact.display()),
            Err(e) => tracing::error!("保存内核配置失败: {}", e),
        }

        self.state.terminate(outcome);
        self.publish();
        let _ = self.deps.notifier.send_state(&self.id, SessionState::Terminated);
        true
    }

    fn publish(&self) {
        let state = self.state.state();
        let outcome = self.state.outcome();
        let theme = self.theme;
        self.info.send_modify(|info| {
            info.state = state;
            info.outcome = outcome;
            info.theme = theme;
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // 运行时关闭时任务可能未走完关闭流程，只能同步释放资源
        if let Some(mut bridge) = self.bridge.take() {
            bridge.detach();
        }
        self.pending_descriptor.take();
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        tracing::warn!("会话 {} 未完成关闭流程，内核配置未保存", self.id);
    }
}

/// 等待下一段终端输出；没有注册的描述符时永远挂起
async fn next_output(bridge: Option<&mut TerminalBridge>) -> io::Result<String> {
    match bridge {
        Some(bridge) => bridge.read_chunk().await,
        None => std::future::pending().await,
    }
}

fn starting_error() -> ConfiguratorError {
    ConfiguratorError::InvalidState("内核配置器正在启动".to_string())
}

/// 在阻塞线程上回收子进程
async fn reap(mut process: Box<dyn SessionProcess>) {
    let pid = process.pid();
    let wait = tokio::task::spawn_blocking(move || process.wait());
    match tokio::time::timeout(REAP_TIMEOUT, wait).await {
        Ok(Ok(Some(status))) => tracing::debug!("子进程 {:?} 已回收: {:?}", pid, status),
        Ok(Ok(None)) => tracing::debug!("子进程 {:?} 无退出状态", pid),
        Ok(Err(e)) => tracing::error!("回收子进程 {:?} 失败: {}", pid, e),
        Err(_) => tracing::warn!("等待子进程 {:?} 退出超时", pid),
    }
}
