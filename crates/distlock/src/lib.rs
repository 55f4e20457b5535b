//! 可重入分布式锁
//!
//! 基于共享存储（Redis 或层级节点存储）的跨进程互斥锁，
//! 在其上叠加进程内的等待者协调：同一进程内竞争同一把锁的调用方挂起等待唤醒，
//! 而不是轮询远端存储。
//!
//! ## 唤醒来源
//!
//! - **本进程释放**：`unlock` 成功后直接唤醒本进程内该 key 的等待者
//! - **跨进程释放**：释放通知器订阅后端的释放事件
//! - **看门狗**：存储不可达时全量放行，锁记录静默过期时唤醒对应 key
//!
//! ## 模块结构
//!
//! - `backend`: 远端锁后端（KV 脚本、层级节点、进程内实现）
//! - `registry`: 本地等待者注册表
//! - `waiter`: 挂起/唤醒原语
//! - `notifier`: 跨进程释放通知
//! - `watchdog`: 存储心跳与过期巡检
//! - `renewal`: 租约自动续期
//! - `lock`: 锁门面与守卫
//! - `client`: 进程内协调对象
//! - `cli`: `lockctl` 命令行工具
//!
//! ## 示例
//!
//! ```ignore
//! use distlock::{LockClient, Lease};
//!
//! let client = LockClient::connect(&config).await?;
//! let lock = client.lock("order:42")?;
//! lock.lock().await?;
//! // 临界区
//! lock.unlock().await?;
//! ```

pub mod backend;
pub mod cli;
pub mod client;
pub mod error;
pub mod key;
pub mod lock;
pub mod notifier;
pub mod registry;
pub mod renewal;
pub mod waiter;
pub mod watchdog;

pub use backend::{BackendKind, KeyTtl, LockBackend};
pub use client::LockClient;
pub use error::{LockError, Result, StoreError};
pub use key::{LockKey, OwnerId};
pub use lock::{DistributedLock, Lease, LockGuard, LockState};
pub use registry::{WaiterRegistry, WakeReason};
pub use waiter::{ParkOutcome, Waiter};
pub use watchdog::{SweepReport, Watchdog};
