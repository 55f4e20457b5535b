//! 共享库
//!
//! 包含锁服务与命令行工具共用的配置加载、可观测性初始化、重试策略和测试辅助代码。

pub mod config;
pub mod observability;
pub mod retry;
pub mod test_utils;
