//! 本地等待者注册表
//!
//! 维护 "锁 key → 本进程内挂起的等待者集合" 的映射。等待者在挂起前登记，
//! 被唤醒或自行返回时移除。同一 key 的修改只在该 key 所在的 DashMap 分片锁内进行，
//! 不同 key 之间基本不会互相阻塞。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use distlock_shared::observability::metrics;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{LockError, Result};
use crate::key::LockKey;
use crate::waiter::Waiter;

/// 唤醒原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// 锁被显式释放（本进程或其他进程）
    Released,
    /// 锁记录已过期消失，但没有收到释放通知
    Expired,
    /// 存储不可达，全量放行
    StoreUnavailable,
    /// 锁客户端关闭
    Shutdown,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Expired => "expired",
            Self::StoreUnavailable => "store_unavailable",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 等待者在注册表内的唯一编号
pub type WaiterId = u64;

/// 进程内等待者注册表
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: DashMap<LockKey, HashMap<WaiterId, oneshot::Sender<WakeReason>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 key 登记一个新的等待者
    ///
    /// 返回的 [`Waiter`] 在 drop 时自动注销。注册表关闭后返回 `LockError::Shutdown`。
    pub fn register(self: &Arc<Self>, key: &LockKey) -> Result<Waiter> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Shutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(key.clone()).or_default().insert(id, tx);

        // close() 先置位再全量唤醒；插入后复查可保证不会漏掉关闭期间登记的等待者
        if self.closed.load(Ordering::SeqCst) {
            self.unregister(key, id);
            return Err(LockError::Shutdown);
        }

        Ok(Waiter::new(key.clone(), id, rx, Arc::clone(self)))
    }

    /// 注销等待者，集合为空时一并删除 key
    ///
    /// 等待者已被唤醒方移除时为空操作。
    pub fn unregister(&self, key: &LockKey, id: WaiterId) {
        if let Some(mut set) = self.waiters.get_mut(key) {
            set.remove(&id);
        }
        self.waiters.remove_if(key, |_, set| set.is_empty());
    }

    /// 唤醒某个 key 下的全部等待者并清空该 key 的集合
    pub fn wake_key(&self, key: &LockKey, reason: WakeReason) -> usize {
        let woken = match self.waiters.remove(key) {
            Some((_, set)) => notify_all(set, reason),
            None => 0,
        };
        if woken > 0 {
            debug!(key = %key, woken, reason = %reason, "Woke local waiters");
        }
        metrics::record_wakeups(reason.as_str(), woken);
        woken
    }

    /// 唤醒所有 key 下的全部等待者
    pub fn wake_all(&self, reason: WakeReason) -> usize {
        let mut woken = 0;
        self.waiters.retain(|_, set| {
            woken += notify_all(std::mem::take(set), reason);
            false
        });
        if woken > 0 {
            debug!(woken, reason = %reason, "Woke all local waiters");
        }
        metrics::record_wakeups(reason.as_str(), woken);
        woken
    }

    /// 当前存在等待者的 key 快照
    pub fn keys(&self) -> Vec<LockKey> {
        self.waiters.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 某个 key 下的等待者数量
    pub fn waiter_count(&self, key: &LockKey) -> usize {
        self.waiters.get(key).map(|set| set.len()).unwrap_or(0)
    }

    /// 所有 key 下的等待者总数
    pub fn total_waiters(&self) -> usize {
        self.waiters.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// 关闭注册表：拒绝新的登记，并以 `Shutdown` 唤醒所有等待者
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.wake_all(WakeReason::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn notify_all(set: HashMap<WaiterId, oneshot::Sender<WakeReason>>, reason: WakeReason) -> usize {
    // 接收端已被丢弃说明等待者已经返回，不计入唤醒数
    set.into_values()
        .filter_map(|tx| tx.send(reason).ok())
        .count()
}
