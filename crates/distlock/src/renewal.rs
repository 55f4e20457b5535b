//! 租约自动续期
//!
//! 以自动租约持有锁时，后台任务每隔 TTL 的三分之一刷新一次 TTL，
//! 直到锁被最终释放。续期发现锁已丢失或存储出错时记录日志并停止。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::backend::LockBackend;
use crate::key::{LockKey, OwnerId};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// 续期任务句柄，drop 时终止任务
pub struct RenewalHandle {
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// 停止续期，等价于 drop
    pub fn stop(self) {}

    /// 续期任务是否已退出（锁丢失或存储出错）
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 续期间隔：TTL 的三分之一
pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_INTERVAL)
}

/// 启动续期任务，第一次续期在一个间隔之后
pub fn spawn_renewal(
    backend: Arc<dyn LockBackend>,
    key: LockKey,
    owner: OwnerId,
    ttl: Duration,
) -> RenewalHandle {
    let interval = renewal_interval(ttl);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match backend.try_renew(&key, &owner, ttl).await {
                Ok(true) => debug!(key = %key, "Lease renewed"),
                Ok(false) => {
                    warn!(key = %key, owner = %owner, "Lease lost, stopping renewal");
                    break;
                }
                Err(e) => {
                    warn!(key = %key, owner = %owner, error = %e, "Lease renewal failed, stopping renewal");
                    break;
                }
            }
        }
    });

    RenewalHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKvServer;

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(renewal_interval(Duration::from_millis(3)), MIN_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lock_alive_until_stopped() {
        let server = MemoryKvServer::new();
        let backend: Arc<dyn LockBackend> = Arc::new(server.backend());
        let key = LockKey::new("job:1").unwrap();
        let owner = OwnerId::from_raw("p1:a");
        let ttl = Duration::from_secs(3);

        assert!(backend.try_acquire(&key, &owner, ttl).await.unwrap());
        let handle = spawn_renewal(backend.clone(), key.clone(), owner.clone(), ttl);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(server.record("job:1").is_some());
        assert!(!handle.is_finished());

        handle.stop();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(server.record("job:1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_stops_when_lease_lost() {
        let server = MemoryKvServer::new();
        let backend: Arc<dyn LockBackend> = Arc::new(server.backend());
        let key = LockKey::new("job:1").unwrap();
        let owner = OwnerId::from_raw("p1:a");
        let ttl = Duration::from_secs(3);

        backend.try_acquire(&key, &owner, ttl).await.unwrap();
        let handle = spawn_renewal(backend, key, owner, ttl);

        server.expire_now("job:1");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
