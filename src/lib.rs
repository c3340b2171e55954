//! 内核配置器终端库
//!
//! 提供内核配置会话的伪终端、会话状态机、数据存储和 JSON-RPC 通信模块。

pub mod config;
pub mod pty;
pub mod rpc;
pub mod session;
pub mod store;
pub mod utils;
