//! 会话测试工具
//!
//! 用 socketpair 代替伪终端，用脚本化的假进程代替配置器子进程。

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::ExitStatus;
use tokio::sync::mpsc;

use crate::config::ConfiguratorConfig;
use crate::pty::{ConfiguratorCommand, SessionProcess, SpawnedTerminal, TerminalAllocator};
use crate::rpc::server::NotificationSender;
use crate::rpc::types::{JsonRpcNotification, Outcome, SessionState, TermSize};
use crate::store::{ImageRecord, ImageStore, MemoryImageStore, Props};
use crate::utils::error::ConfiguratorError;

use super::manager::SessionManager;
use super::session::{SessionDeps, SessionHandle};

pub const TEST_IMAGE: &str = "img-1";
pub const KERNEL_CONFIG: &str = "CONFIG_USB=y\nCONFIG_SOUND=m\n";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(2);

// ============ 假进程 ============

/// 假进程的共享状态，测试端用来模拟退出和检查终止次数
pub struct FakeProcessState {
    /// 前 N 次存活检测返回 false；None 表示永远不出现
    alive_after: Option<u32>,
    checks: AtomicU32,
    exit_status: Mutex<Option<ExitStatus>>,
    terminations: AtomicU32,
}

impl FakeProcessState {
    fn new(alive_after: Option<u32>) -> Self {
        Self {
            alive_after,
            checks: AtomicU32::new(0),
            exit_status: Mutex::new(None),
            terminations: AtomicU32::new(0),
        }
    }

    pub fn liveness_checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn set_exit(&self, code: u32) {
        let mut status = self.exit_status.lock().unwrap();
        if status.is_none() {
            *status = Some(ExitStatus::with_exit_code(code));
        }
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status.lock().unwrap().clone()
    }
}

struct FakeProcess(Arc<FakeProcessState>);

impl SessionProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_alive(&self) -> bool {
        if self.0.exit_status().is_some() {
            return false;
        }
        let check = self.0.checks.fetch_add(1, Ordering::SeqCst);
        self.0.alive_after.is_some_and(|after| check >= after)
    }

    fn terminate(&mut self) {
        self.0.terminations.fetch_add(1, Ordering::SeqCst);
        self.0.set_exit(137);
    }

    fn try_wait(&mut self) -> Option<ExitStatus> {
        self.0.exit_status()
    }

    fn wait(&mut self) -> Option<ExitStatus> {
        self.0.exit_status()
    }
}

// ============ 假分配器 ============

/// 测试端持有的终端另一端
pub struct FakeTerminal {
    pub peer: UnixStream,
    pub process: Arc<FakeProcessState>,
}

impl FakeTerminal {
    /// 模拟子进程退出：先记录退出码，再关闭 slave 端
    pub fn exit(self, code: u32) {
        self.process.set_exit(code);
        drop(self.peer);
    }
}

enum Behavior {
    Fail,
    Spawn { alive_after: Option<u32> },
}

struct FakeAllocatorInner {
    behavior: Behavior,
    terminals: Mutex<Vec<FakeTerminal>>,
    commands: Mutex<Vec<ConfiguratorCommand>>,
}

/// 用 socketpair 模拟伪终端的分配器
#[derive(Clone)]
pub struct FakeAllocator {
    inner: Arc<FakeAllocatorInner>,
}

impl FakeAllocator {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(FakeAllocatorInner {
                behavior,
                terminals: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 第 n + 1 次存活检测时进程出现
    pub fn alive_after(checks: u32) -> Self {
        Self::with_behavior(Behavior::Spawn {
            alive_after: Some(checks),
        })
    }

    pub fn never_alive() -> Self {
        Self::with_behavior(Behavior::Spawn { alive_after: None })
    }

    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Fail)
    }

    pub fn commands(&self) -> Vec<ConfiguratorCommand> {
        self.inner.commands.lock().unwrap().clone()
    }

    /// 等待下一个被分配的终端
    pub async fn wait_for_terminal(&self) -> FakeTerminal {
        let inner = self.inner.clone();
        wait_until(move || {
            let mut terminals = inner.terminals.lock().unwrap();
            (!terminals.is_empty()).then(|| terminals.remove(0))
        })
        .await
    }

    /// 等待最近一次启动命令
    pub async fn wait_for_command(&self) -> ConfiguratorCommand {
        let inner = self.inner.clone();
        wait_until(move || inner.commands.lock().unwrap().last().cloned()).await
    }
}

impl TerminalAllocator for FakeAllocator {
    fn spawn(
        &self,
        command: &ConfiguratorCommand,
        _term_size: TermSize,
    ) -> Result<SpawnedTerminal, ConfiguratorError> {
        self.inner.commands.lock().unwrap().push(command.clone());

        let alive_after = match self.inner.behavior {
            Behavior::Fail => {
                return Err(ConfiguratorError::SpawnFailed("no pty available".to_string()))
            }
            Behavior::Spawn { alive_after } => alive_after,
        };

        let (ours, peer) = UnixStream::pair()?;
        peer.set_read_timeout(Some(WAIT_TIMEOUT))?;

        let state = Arc::new(FakeProcessState::new(alive_after));
        self.inner.terminals.lock().unwrap().push(FakeTerminal {
            peer,
            process: state.clone(),
        });

        Ok(SpawnedTerminal {
            descriptor: OwnedFd::from(ours),
            process: Box::new(FakeProcess(state)),
        })
    }
}

// ============ 计数存储 ============

/// 记录写入次数的内存存储
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryImageStore,
    persists: AtomicUsize,
}

impl CountingStore {
    pub async fn insert(&self, image_id: &str, props: Props) {
        self.inner.insert(image_id, props).await;
    }

    pub async fn props(&self, image_id: &str) -> Option<Props> {
        self.inner.props(image_id).await
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageStore for CountingStore {
    async fn lookup_image(&self, image_id: &str) -> Result<Option<ImageRecord>, ConfiguratorError> {
        self.inner.lookup_image(image_id).await
    }

    async fn persist(&self, image_id: &str, props: Props) -> Result<(), ConfiguratorError> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(image_id, props).await
    }
}

// ============ 测试环境 ============

pub struct TestEnv {
    pub deps: SessionDeps,
    pub config: Arc<ConfiguratorConfig>,
    pub store: Arc<CountingStore>,
    pub notifications: mpsc::UnboundedReceiver<JsonRpcNotification>,
    _dir: tempfile::TempDir,
}

/// 创建测试环境：临时配置目录、包含 `img-1` 的存储和 1ms 的就绪检测间隔
pub async fn deps(allocator: FakeAllocator) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ConfiguratorConfig::with_base_dir(dir.path());
    config.readiness_interval = Duration::from_millis(1);
    std::fs::create_dir_all(&config.config_dir).unwrap();
    let config = Arc::new(config);

    let store = Arc::new(CountingStore::default());
    let mut props = Props::new();
    props.insert("PIEMAN_ENABLE_SSH".to_string(), serde_json::Value::Bool(true));
    store.insert(TEST_IMAGE, props).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let deps = SessionDeps {
        config: config.clone(),
        allocator: Arc::new(allocator),
        store: store.clone(),
        notifier: NotificationSender::new(tx),
    };

    TestEnv {
        deps,
        config,
        store,
        notifications: rx,
        _dir: dir,
    }
}

/// 没有镜像、不会启动配置器的管理器
pub fn idle_manager() -> SessionManager {
    let (tx, _rx) = mpsc::unbounded_channel();
    SessionManager::new(SessionDeps {
        config: Arc::new(ConfiguratorConfig::with_base_dir(std::env::temp_dir())),
        allocator: Arc::new(FakeAllocator::failing()),
        store: Arc::new(CountingStore::default()),
        notifier: NotificationSender::new(tx),
    })
}

impl TestEnv {
    pub fn manager(&self) -> SessionManager {
        SessionManager::new(self.deps.clone())
    }

    /// 等待会话进入指定状态
    pub async fn wait_for_state(&self, handle: &SessionHandle, state: SessionState) {
        wait_until(|| (handle.state() == state).then_some(())).await
    }

    /// 等待指定内容的输出通知，跳过之前的其他通知
    pub async fn expect_partial(&mut self, data: &str) {
        loop {
            let notification = recv(&mut self.notifications).await;
            let params = notification.params.unwrap_or_default();
            match notification.method.as_str() {
                "configurator.output" if params["data"] == data => return,
                "configurator.final" => panic!("收到 final 之前没有等到输出 {:?}", data),
                _ => {}
            }
        }
    }

    /// 取出已到达的全部 final 结果
    pub fn drain_finals(&mut self) -> Vec<Outcome> {
        let mut finals = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            if notification.method == "configurator.final" {
                let params = notification.params.unwrap_or_default();
                finals.push(serde_json::from_value(params["status"].clone()).unwrap());
            }
        }
        finals
    }
}

/// 收集输出直到 final 通知，返回输出内容和结果
pub async fn collect_until_final(
    notifications: &mut mpsc::UnboundedReceiver<JsonRpcNotification>,
) -> (Vec<String>, Outcome) {
    let mut partials = Vec::new();
    loop {
        let notification = recv(notifications).await;
        let params = notification.params.unwrap_or_default();
        match notification.method.as_str() {
            "configurator.output" => {
                partials.push(params["data"].as_str().unwrap().to_string());
            }
            "configurator.final" => {
                let outcome = serde_json::from_value(params["status"].clone()).unwrap();
                return (partials, outcome);
            }
            _ => {}
        }
    }
}

async fn recv(
    notifications: &mut mpsc::UnboundedReceiver<JsonRpcNotification>,
) -> JsonRpcNotification {
    tokio::time::timeout(WAIT_TIMEOUT, notifications.recv())
        .await
        .expect("等待通知超时")
        .expect("通知通道已关闭")
}

async fn wait_until<T>(mut check: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("等待条件超时")
}
