//! CLI 模块
//!
//! `lockctl` 是运维用的锁工具：
//!
//! - `hold` - 获取锁并持有一段时间
//! - `try` - 尝试获取一次锁并立即释放
//! - `status` - 查看锁记录的剩余存活时间
//! - `ping` - 检查锁存储是否可达
//!
//! # 使用示例
//!
//! ```bash
//! # 持有 30 秒，最多等待 5 秒
//! lockctl hold order:42 --hold-secs 30 --wait-secs 5
//!
//! # 使用内存后端演练
//! lockctl --backend memory try order:42
//!
//! # 查看锁状态
//! lockctl status order:42
//! ```

pub mod commands;
pub mod runner;

pub use commands::{BackendArg, Cli, Commands};
pub use runner::CommandRunner;
