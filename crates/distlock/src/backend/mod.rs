//! 远端锁后端
//!
//! 所有后端实现同一个 [`LockBackend`] 契约，但重入能力不同：
//!
//! - **KV 脚本后端**（[`RedisLockBackend`]）：锁记录为带 TTL 的 hash，支持重入计数
//! - **层级节点后端**（[`NodeLockBackend`]）：锁即临时节点，会话断开时节点消失，不支持重入
//! - **内存后端**（[`MemoryLockBackend`]）：进程内模拟 KV 后端的语义，用于测试和本地开发
//!
//! 重入差异通过 [`BackendKind::is_reentrant`] 暴露给调用方，而不是在门面层掩盖。

pub mod kv;
pub mod memory;
pub mod node;
pub mod scripts;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::config::{AppConfig, BackendStrategy};
use futures::stream::BoxStream;
use tracing::{info, warn};

use crate::error::{LockError, Result};
use crate::key::{LockKey, OwnerId};

pub use memory::{MemoryKvServer, MemoryLockBackend, MemoryNodeEnsemble, MemoryNodeSession};
pub use node::{CreateOutcome, NodeData, NodeLockBackend, NodeStore};
pub use kv::{KvScriptStore, RedisLockBackend, RedisStore};

/// 跨进程释放通知流，元素为被释放的锁 key
pub type ReleaseStream = BoxStream<'static, String>;

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    KvScript,
    Node,
    Memory,
}

impl BackendKind {
    /// 同一持有者能否重复获取同一把锁
    pub fn is_reentrant(self) -> bool {
        !matches!(self, Self::Node)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KvScript => "kv_script",
            Self::Node => "node",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 锁记录的剩余存活时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// 记录不存在（已释放或已过期）
    Absent,
    /// 记录存在但没有过期时间
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// 按 Redis PTTL 的约定解析：-2 不存在，-1 无过期时间
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => Self::Absent,
            m if m < 0 => Self::Persistent,
            m => Self::Expires(Duration::from_millis(m as u64)),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// 远端锁后端契约
///
/// `try_acquire` / `try_release` 必须在存储端原子执行；锁被他人持有、
/// 或释放者不是持有者时返回 `Ok(false)`，只有存储故障才返回错误。
#[async_trait]
pub trait LockBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// 尝试获取锁，成功时设置（或刷新）TTL
    async fn try_acquire(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool>;

    /// 尝试释放锁，计数归零时删除记录并发布释放通知
    async fn try_release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool>;

    /// 仅在 owner 仍持有锁时刷新 TTL，不改变重入计数
    async fn try_renew(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool>;

    /// 查询锁记录的剩余存活时间
    async fn remaining_ttl(&self, key: &LockKey) -> Result<KeyTtl>;

    /// 存储心跳
    async fn ping(&self) -> Result<()>;

    /// 订阅跨进程释放通知
    async fn release_events(&self) -> Result<ReleaseStream>;
}

/// 按配置构建锁后端
///
/// 层级节点后端需要调用方提供 [`NodeStore`]：用 [`NodeLockBackend::new`] 构建后交给
/// `LockClient::new`，这里直接返回配置错误。
pub async fn connect(config: &AppConfig) -> Result<Arc<dyn LockBackend>> {
    config.lock.validate().map_err(LockError::Config)?;

    let backend: Arc<dyn LockBackend> = match config.lock.backend {
        BackendStrategy::Redis => {
            let store = RedisStore::connect(&config.redis.url).await?;
            info!(url = %config.redis.url, "Redis lock backend connected");
            Arc::new(RedisLockBackend::new(store, config.lock.channel.clone()))
        }
        BackendStrategy::Node => {
            return Err(LockError::Config(
                "node backend requires an injected NodeStore".to_string(),
            ));
        }
        BackendStrategy::Memory => {
            warn!("Memory lock backend selected; locks are not shared across processes");
            Arc::new(MemoryKvServer::new().backend())
        }
    };

    Ok(backend)
}
