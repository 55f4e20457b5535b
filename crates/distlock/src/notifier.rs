//! 跨进程释放通知
//!
//! 订阅后端的释放事件流，收到某个 key 的释放消息时唤醒本进程内该 key 的全部等待者。
//! 通知器本身不尝试加锁，被唤醒的等待者各自重新进入加锁循环。

use std::sync::Arc;

use distlock_shared::retry::RetryPolicy;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::LockBackend;
use crate::key::LockKey;
use crate::registry::{WaiterRegistry, WakeReason};

/// 释放通知订阅者
pub struct ReleaseNotifier {
    backend: Arc<dyn LockBackend>,
    registry: Arc<WaiterRegistry>,
    policy: RetryPolicy,
}

impl ReleaseNotifier {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        registry: Arc<WaiterRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            registry,
            policy,
        }
    }

    /// 处理一条释放消息，返回唤醒的等待者数量
    ///
    /// 重复消息或没有等待者的 key 都是空操作。
    pub fn handle_message(&self, payload: &str) -> usize {
        match LockKey::new(payload) {
            Ok(key) => self.registry.wake_key(&key, WakeReason::Released),
            Err(_) => {
                debug!("Ignoring empty release message");
                0
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// 订阅循环
    ///
    /// 订阅流结束或订阅失败时按退避策略重新订阅。每次订阅成功后全量唤醒一次，
    /// 因为断开期间的释放消息已经丢失。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                result = self.backend.release_events() => result,
                _ = shutdown.changed() => break,
            };

            match subscribed {
                Ok(mut events) => {
                    attempt = 0;
                    let woken = self.registry.wake_all(WakeReason::Released);
                    info!(backend = %self.backend.kind(), woken, "Release notifier subscribed");

                    loop {
                        tokio::select! {
                            event = events.next() => match event {
                                Some(payload) => {
                                    self.handle_message(&payload);
                                }
                                None => {
                                    warn!("Release subscription ended, re-subscribing");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                info!("Release notifier stopped");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, attempt, "Failed to subscribe to release channel");
                }
            }

            let delay = self.policy.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Release notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKvServer;
    use crate::key::OwnerId;
    use crate::waiter::ParkOutcome;
    use std::time::Duration;

    fn notifier(server: &MemoryKvServer, registry: &Arc<WaiterRegistry>) -> ReleaseNotifier {
        ReleaseNotifier::new(
            Arc::new(server.backend()),
            registry.clone(),
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_handle_message_is_idempotent() {
        let server = MemoryKvServer::new();
        let registry = Arc::new(WaiterRegistry::new());
        let notifier = notifier(&server, &registry);
        let key = LockKey::new("job:1").unwrap();

        let _waiter = registry.register(&key).unwrap();
        assert_eq!(notifier.handle_message("job:1"), 1);
        assert_eq!(notifier.handle_message("job:1"), 0);
        assert_eq!(notifier.handle_message("job:unknown"), 0);
        assert_eq!(notifier.handle_message(""), 0);
    }

    #[tokio::test]
    async fn test_remote_release_wakes_local_waiter() {
        let server = MemoryKvServer::new();
        let registry = Arc::new(WaiterRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = notifier(&server, &registry).spawn(shutdown_rx);

        // 另一个“进程”持有并释放锁
        let remote = server.backend();
        let key = LockKey::new("job:1").unwrap();
        let owner = OwnerId::from_raw("p2:b");
        remote.try_acquire(&key, &owner, Duration::from_secs(30)).await.unwrap();

        // 等订阅建立后的全量唤醒过去再登记
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = registry.register(&key).unwrap();
        remote.try_release(&key, &owner).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let outcome = waiter.park(Some(deadline), &mut std::future::pending()).await;
        assert_eq!(outcome, ParkOutcome::Woken(WakeReason::Released));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_and_wakes_all_after_outage() {
        let server = MemoryKvServer::new();
        let registry = Arc::new(WaiterRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = notifier(&server, &registry).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = registry.register(&LockKey::new("job:1").unwrap()).unwrap();

        // 断开订阅，恢复后重新订阅时补发一次全量唤醒
        server.set_available(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        server.set_available(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let outcome = waiter.park(Some(deadline), &mut std::future::pending()).await;
        assert_eq!(outcome, ParkOutcome::Woken(WakeReason::Released));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
