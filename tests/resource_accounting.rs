//! 资源计数测试
//!
//! 未进入 RUNNING 的会话在结束后不应留下描述符或子进程。
//! 计数针对整个进程，所以这里只有一个测试函数，不与其他测试并行。

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use kconfig_terminal::config::ConfiguratorConfig;
use kconfig_terminal::pty::{ConfiguratorCommand, NativeAllocator, TerminalAllocator};
use kconfig_terminal::rpc::types::{JsonRpcNotification, TermSize};
use kconfig_terminal::rpc::NotificationSender;
use kconfig_terminal::session::{SessionDeps, SessionHandle};
use kconfig_terminal::store::{MemoryImageStore, Props};

const IMAGE: &str = "img-1";

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// 父进程是本进程的进程数（包括未回收的僵尸进程）
fn child_processes() -> usize {
    let me = std::process::id().to_string();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.chars().all(|c| c.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| {
            // "pid (comm) state ppid ..."，comm 可能包含空格
            stat.rfind(')')
                .and_then(|end| stat[end + 1..].split_whitespace().nth(1))
                .is_some_and(|ppid| ppid == me)
        })
        .count()
}

/// 等待计数回到基线，子进程回收和描述符关闭可能稍有延迟
async fn settle(baseline_fds: usize, baseline_children: usize) -> (usize, usize) {
    for _ in 0..100 {
        if open_fds() <= baseline_fds && child_processes() <= baseline_children {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (open_fds(), child_processes())
}

async fn wait_for_final(rx: &mut mpsc::UnboundedReceiver<JsonRpcNotification>) -> String {
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("等待 final 超时")
            .expect("通知通道已关闭");
        if notification.method == "configurator.final" {
            let params = notification.params.unwrap_or_default();
            return params["status"].as_str().unwrap_or_default().to_string();
        }
    }
}

#[tokio::test]
async fn test_sessions_that_never_run_release_resources() {
    let dir = tempfile::tempdir().unwrap();

    // 一直运行的配置器替身，只有被终止才会退出
    let helper = dir.path().join("run-configuration.sh");
    std::fs::write(&helper, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = ConfiguratorConfig::with_base_dir(dir.path());
    config.helper_script = helper.display().to_string();
    // 不做任何就绪检测，直接走超时路径
    config.readiness_attempts = 0;
    std::fs::create_dir_all(&config.config_dir).unwrap();

    let store = Arc::new(MemoryImageStore::new());
    store.insert(IMAGE, Props::new()).await;

    let baseline_fds = open_fds();
    let baseline_children = child_processes();

    // 反复创建失败
    let missing = ConfiguratorCommand {
        program: "/nonexistent/run-configuration.sh".to_string(),
        args: Vec::new(),
        env: vec![("PATH".to_string(), "/nonexistent".to_string())],
    };
    for _ in 0..20 {
        assert!(NativeAllocator.spawn(&missing, TermSize::default()).is_err());
    }
    let (fds, children) = settle(baseline_fds, baseline_children).await;
    assert_eq!(fds, baseline_fds, "创建失败后描述符数量应回到基线");
    assert_eq!(children, baseline_children);

    // 真实子进程在就绪检测超时后被终止并回收
    for round in 0..3 {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            config: Arc::new(config.clone()),
            allocator: Arc::new(NativeAllocator),
            store: store.clone(),
            notifier: NotificationSender::new(tx),
        };
        let handle = SessionHandle::spawn(format!("s-{}", round), IMAGE.to_string(), deps);

        handle.start().await.unwrap();
        assert_eq!(wait_for_final(&mut rx).await, "configurator_prepare_failed");
        handle.end().await;
    }

    let (fds, children) = settle(baseline_fds, baseline_children).await;
    assert_eq!(fds, baseline_fds, "就绪超时后描述符数量应回到基线");
    assert_eq!(children, baseline_children, "就绪超时后子进程应已回收");
}
