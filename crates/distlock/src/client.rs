//! 锁客户端
//!
//! [`LockClient`] 是进程内的协调对象：持有后端、等待者注册表和配置，
//! 负责按需启动释放通知器与看门狗，并在关闭时统一停止它们。
//! 客户端显式构造并通过依赖注入传递，可以廉价克隆。

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use distlock_shared::config::{AppConfig, LockConfig};
use distlock_shared::retry::RetryPolicy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{self, BackendKind, LockBackend};
use crate::error::{LockError, Result};
use crate::key::{LockKey, OwnerId};
use crate::lock::{DistributedLock, Lease, LockGuard};
use crate::notifier::ReleaseNotifier;
use crate::registry::WaiterRegistry;
use crate::watchdog::Watchdog;

struct ClientInner {
    backend: Arc<dyn LockBackend>,
    registry: Arc<WaiterRegistry>,
    config: LockConfig,
    /// 实例唯一标识，作为 OwnerId 的前缀
    instance_id: String,
    started: OnceLock<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // 后台任务不持有客户端，最后一个引用消失时通知它们退出
        self.shutdown_tx.send_replace(true);
    }
}

/// 分布式锁客户端
#[derive(Clone)]
pub struct LockClient {
    inner: Arc<ClientInner>,
}

impl LockClient {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid lock config");
        }
        let (shutdown_tx, _) = watch::channel(false);
        let instance_id = Uuid::new_v4().to_string();
        info!(instance_id = %instance_id, backend = %backend.kind(), "Lock client created");

        Self {
            inner: Arc::new(ClientInner {
                backend,
                registry: Arc::new(WaiterRegistry::new()),
                config,
                instance_id,
                started: OnceLock::new(),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 按配置连接后端并创建客户端
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let backend = backend::connect(config).await?;
        Ok(Self::new(backend, config.lock.clone()))
    }

    /// 创建使用默认租约的锁句柄
    pub fn lock(&self, key: impl AsRef<str>) -> Result<DistributedLock> {
        self.lock_with_lease(key, Lease::Fixed(self.inner.config.default_lease()))
    }

    /// 创建锁句柄，每个句柄有独立的 OwnerId
    pub fn lock_with_lease(&self, key: impl AsRef<str>, lease: Lease) -> Result<DistributedLock> {
        let key = LockKey::new(key)?;
        let owner = OwnerId::generate(&self.inner.instance_id);
        Ok(DistributedLock::new(self.clone(), key, owner, lease))
    }

    /// 阻塞获取锁并返回守卫
    pub async fn acquire(&self, key: impl AsRef<str>, lease: Lease) -> Result<LockGuard> {
        let lock = self.lock_with_lease(key, lease)?;
        lock.lock().await?;
        Ok(lock.into_guard())
    }

    /// 在锁保护下执行 `fut`
    ///
    /// 在 `wait` 内获取锁（为零时只尝试一次），执行完毕后释放。
    /// 获取不到时返回 `LockError::Contended`。释放失败只记录日志，锁随 TTL 过期。
    pub async fn run_exclusive<F, T>(
        &self,
        key: impl AsRef<str>,
        lease: Lease,
        wait: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let lock = self.lock_with_lease(key, lease)?;
        let acquired = if wait.is_zero() {
            lock.try_lock().await?
        } else {
            lock.try_lock_for(wait).await?
        };
        if !acquired {
            return Err(LockError::Contended {
                key: lock.key().to_string(),
            });
        }

        let output = fut.await;

        match lock.unlock().await {
            Ok(true) => {}
            Ok(false) => warn!(key = %lock.key(), "Lock was lost before the task finished"),
            Err(e) => warn!(key = %lock.key(), error = %e, "Failed to release lock, it will expire via TTL"),
        }
        Ok(output)
    }

    /// 立即启动通知器与看门狗
    ///
    /// 必须在 tokio 运行时内调用。重复调用是空操作。
    pub fn start(&self) {
        self.ensure_started();
    }

    /// 首次阻塞加锁时调用，并发调用时只启动一次
    pub(crate) fn ensure_started(&self) {
        if self.is_shutdown() {
            return;
        }
        self.inner.started.get_or_init(|| self.spawn_background());
    }

    fn spawn_background(&self) {
        let inner = &self.inner;
        let config = &inner.config;
        let mut tasks = Vec::with_capacity(3);

        let policy = RetryPolicy::new(
            Duration::from_millis(config.resubscribe_initial_ms),
            Duration::from_millis(config.resubscribe_max_ms),
        );
        let notifier = ReleaseNotifier::new(inner.backend.clone(), inner.registry.clone(), policy);
        tasks.push(notifier.spawn(inner.shutdown_tx.subscribe()));

        if config.watchdog_enabled {
            let watchdog =
                Watchdog::from_config(inner.backend.clone(), inner.registry.clone(), config);
            tasks.extend(watchdog.spawn(inner.shutdown_tx.subscribe()));
        } else {
            debug!("Lock watchdog disabled by configuration");
        }

        inner.tasks.lock().extend(tasks);
    }

    /// 关闭客户端
    ///
    /// 停止后台任务，以 `Shutdown` 唤醒所有等待者（其加锁调用返回 `LockError::Shutdown`）。
    /// 可重复调用。
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }

        let woken = self.inner.registry.close();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Lock background task ended abnormally");
            }
        }
        info!(woken, "Lock client shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// 后台任务是否已启动
    pub fn is_started(&self) -> bool {
        self.inner.started.get().is_some()
    }

    pub fn registry(&self) -> &Arc<WaiterRegistry> {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.inner.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }
}
