//! PTY 模块
//!
//! 伪终端分配、配置器子进程和终端 I/O 桥。

pub mod allocator;
pub mod bridge;
pub mod process;

pub use allocator::{ConfiguratorCommand, NativeAllocator, SpawnedTerminal, TerminalAllocator};
pub use bridge::TerminalBridge;
pub use process::{ChildProcess, SessionProcess};
