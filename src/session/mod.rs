//! 配置会话模块
//!
//! 每个会话对应一个内核配置器子进程，由独立的任务驱动其生命周期。

pub mod manager;
pub mod session;
pub mod theme;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::SessionManager;
pub use session::{SessionDeps, SessionHandle};
pub use theme::Theme;
