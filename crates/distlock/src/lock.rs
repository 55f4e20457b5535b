//! 锁门面
//!
//! [`DistributedLock`] 是单个持有者的锁句柄，状态机为
//! `Idle → Acquiring → Held → Releasing → Idle`。
//!
//! 阻塞加锁是"唤醒后重试"的循环而不是一次性等待：唤醒只是提示，
//! 被唤醒的等待者不保证能赢得下一次竞争。
//!
//! ## 公平性
//!
//! 同一 key 的本地等待者之间不保证 FIFO。锁释放时所有等待者同时被唤醒并重新竞争，
//! 成功者继续执行，其余重新挂起。这是以简单性换取公平性的取舍。

use std::future::Future;
use std::time::Duration;

use distlock_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::client::LockClient;
use crate::error::{LockError, Result};
use crate::key::{LockKey, OwnerId};
use crate::registry::WakeReason;
use crate::renewal::{RenewalHandle, spawn_renewal};
use crate::waiter::ParkOutcome;

/// 锁租约
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// 最多持有指定时长，到期后由存储删除
    Fixed(Duration),
    /// 持有期间后台自动续期，TTL 取配置中的 `auto_lease_secs`
    Auto,
}

/// 锁句柄状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
}

struct HandleState {
    state: LockState,
    holds: u32,
    renewal: Option<RenewalHandle>,
}

/// 分布式锁句柄
///
/// 每个句柄对应一个 [`OwnerId`]，通过同一句柄的重复加锁即为重入。
/// 句柄由 [`LockClient::lock`] 创建。
pub struct DistributedLock {
    client: LockClient,
    key: LockKey,
    owner: OwnerId,
    lease: Lease,
    inner: Mutex<HandleState>,
}

impl DistributedLock {
    pub(crate) fn new(client: LockClient, key: LockKey, owner: OwnerId, lease: Lease) -> Self {
        Self {
            client,
            key,
            owner,
            lease,
            inner: Mutex::new(HandleState {
                state: LockState::Idle,
                holds: 0,
                renewal: None,
            }),
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    /// 本句柄当前的持有深度
    pub fn hold_count(&self) -> u32 {
        self.inner.lock().holds
    }

    pub fn is_held(&self) -> bool {
        self.hold_count() > 0
    }

    /// 当前后端是否支持重入
    pub fn is_reentrant(&self) -> bool {
        self.client.backend_kind().is_reentrant()
    }

    fn ttl(&self) -> Duration {
        match self.lease {
            Lease::Fixed(ttl) => ttl,
            Lease::Auto => self.client.config().auto_lease(),
        }
    }

    /// 非阻塞加锁，只调用一次后端
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn try_lock(&self) -> Result<bool> {
        if self.client.is_shutdown() {
            return Err(LockError::Shutdown);
        }
        let _acquiring = AcquireScope::enter(self);
        let acquired = self.attempt().await?;
        if acquired {
            self.on_acquired();
        }
        Ok(acquired)
    }

    /// 阻塞直到获取锁
    pub async fn lock(&self) -> Result<()> {
        self.lock_or_cancel(std::future::pending()).await
    }

    /// 阻塞直到获取锁，`cancel` 完成时放弃等待并返回 `LockError::Cancelled`
    pub async fn lock_or_cancel<C>(&self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = std::pin::pin!(cancel);
        self.acquire_loop(None, &mut cancel).await.map(|_| ())
    }

    /// 在 `timeout` 内获取锁，超时返回 `Ok(false)`
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.try_lock_for_or_cancel(timeout, std::future::pending())
            .await
    }

    pub async fn try_lock_for_or_cancel<C>(&self, timeout: Duration, cancel: C) -> Result<bool>
    where
        C: Future<Output = ()>,
    {
        let deadline = Instant::now() + timeout;
        let mut cancel = std::pin::pin!(cancel);
        self.acquire_loop(Some(deadline), &mut cancel).await
    }

    #[instrument(skip(self, cancel), fields(key = %self.key))]
    async fn acquire_loop<C>(&self, deadline: Option<Instant>, cancel: &mut C) -> Result<bool>
    where
        C: Future<Output = ()> + Unpin,
    {
        if self.is_held() && !self.is_reentrant() {
            return Err(LockError::NotReentrant {
                key: self.key.to_string(),
            });
        }

        self.client.ensure_started();
        let _acquiring = AcquireScope::enter(self);
        let started = Instant::now();

        loop {
            // 先登记再尝试：尝试失败到挂起之间的释放通知会留在 waiter 中
            let waiter = self.client.registry().register(&self.key)?;

            if self.attempt().await? {
                drop(waiter);
                self.on_acquired();
                metrics::record_wait(started.elapsed().as_secs_f64());
                return Ok(true);
            }

            match waiter.park(deadline, cancel).await {
                ParkOutcome::Woken(WakeReason::Shutdown) => return Err(LockError::Shutdown),
                ParkOutcome::Woken(reason) => {
                    debug!(reason = %reason, "Waiter woken, retrying acquire");
                }
                ParkOutcome::TimedOut => {
                    debug!("Timed out waiting for lock");
                    return Ok(false);
                }
                ParkOutcome::Cancelled => {
                    debug!("Lock wait cancelled");
                    return Err(LockError::Cancelled);
                }
            }
        }
    }

    async fn attempt(&self) -> Result<bool> {
        let backend = self.client.backend();
        let acquired = backend.try_acquire(&self.key, &self.owner, self.ttl()).await?;
        metrics::record_acquire(backend.kind().as_str(), acquired);
        Ok(acquired)
    }

    fn on_acquired(&self) {
        let mut inner = self.inner.lock();
        inner.holds += 1;
        inner.state = LockState::Held;

        if inner.holds == 1 && self.lease == Lease::Auto {
            inner.renewal = Some(spawn_renewal(
                self.client.backend().clone(),
                self.key.clone(),
                self.owner.clone(),
                self.ttl(),
            ));
        }
        debug!(key = %self.key, owner = %self.owner, holds = inner.holds, "Lock acquired");
    }

    /// 释放一层持有
    ///
    /// 成功时唤醒本进程内该 key 的全部等待者；调用者不是持有者时返回 `Ok(false)`，
    /// 不会删除他人的锁记录。
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn unlock(&self) -> Result<bool> {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if inner.holds > 0 {
                inner.state = LockState::Releasing;
            }
            previous
        };

        let backend = self.client.backend();
        let released = match backend.try_release(&self.key, &self.owner).await {
            Ok(released) => released,
            Err(e) => {
                self.inner.lock().state = previous;
                return Err(e);
            }
        };
        metrics::record_release(backend.kind().as_str(), released);

        {
            let mut inner = self.inner.lock();
            if released {
                inner.holds = inner.holds.saturating_sub(1);
            } else if inner.holds > 0 {
                warn!(owner = %self.owner, "Lock no longer held by this owner, lease likely expired");
                inner.holds = 0;
            }

            if inner.holds == 0 {
                inner.state = LockState::Idle;
                inner.renewal = None;
            } else {
                inner.state = LockState::Held;
            }
        }

        if released {
            self.client
                .registry()
                .wake_key(&self.key, WakeReason::Released);
        }
        Ok(released)
    }

    /// 转换为守卫，由守卫负责释放
    pub fn into_guard(self) -> LockGuard {
        LockGuard {
            lock: self,
            released: false,
        }
    }
}

/// 加锁期间的状态守卫
///
/// 加锁失败、取消或 future 被丢弃时把 `Acquiring` 恢复为 `Idle`。
struct AcquireScope<'a> {
    lock: &'a DistributedLock,
}

impl<'a> AcquireScope<'a> {
    fn enter(lock: &'a DistributedLock) -> Self {
        let mut inner = lock.inner.lock();
        if inner.holds == 0 {
            inner.state = LockState::Acquiring;
        }
        Self { lock }
    }
}

impl Drop for AcquireScope<'_> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        if inner.state == LockState::Acquiring {
            inner.state = LockState::Idle;
        }
    }
}

/// 锁守卫
///
/// 持有锁的 RAII 包装器。建议使用 `release()` 显式释放：
/// Drop 无法执行异步操作，未释放的守卫只能等锁随 TTL 过期。
pub struct LockGuard {
    lock: DistributedLock,
    /// 标记锁是否已被释放，避免重复释放
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        self.lock.key()
    }

    pub fn owner(&self) -> &OwnerId {
        self.lock.owner()
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// 显式释放锁
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        self.lock.unlock().await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                lock_key = %self.lock.key,
                owner = %self.lock.owner,
                "LockGuard dropped without explicit release - lock will expire via TTL"
            );
        }
    }
}
