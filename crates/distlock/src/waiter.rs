//! 挂起/唤醒原语
//!
//! 一个 [`Waiter`] 代表一次挂起：要么被注册表唤醒，要么截止时间到期，要么被调用方取消。
//! 无论以哪种方式返回，drop 时都会从注册表注销，返回后不会再收到迟到的唤醒。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::key::LockKey;
use crate::registry::{WaiterId, WaiterRegistry, WakeReason};

/// 挂起结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    Woken(WakeReason),
    TimedOut,
    Cancelled,
}

/// 已登记在注册表中的等待者
pub struct Waiter {
    key: LockKey,
    id: WaiterId,
    rx: oneshot::Receiver<WakeReason>,
    registry: Arc<WaiterRegistry>,
}

impl Waiter {
    pub(crate) fn new(
        key: LockKey,
        id: WaiterId,
        rx: oneshot::Receiver<WakeReason>,
        registry: Arc<WaiterRegistry>,
    ) -> Self {
        Self {
            key,
            id,
            rx,
            registry,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    /// 挂起直到被唤醒、到达截止时间或 `cancel` 完成
    ///
    /// `deadline` 为 None 时无限等待。`cancel` 以可变引用传入，便于调用方在循环中复用同一个取消信号。
    pub async fn park<C>(mut self, deadline: Option<Instant>, cancel: &mut C) -> ParkOutcome
    where
        C: Future<Output = ()> + Unpin,
    {
        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            woken = &mut self.rx => match woken {
                Ok(reason) => ParkOutcome::Woken(reason),
                // 发送端被丢弃只会发生在注册表销毁时
                Err(_) => ParkOutcome::Woken(WakeReason::Shutdown),
            },
            _ = sleep => ParkOutcome::TimedOut,
            _ = cancel => ParkOutcome::Cancelled,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, self.id);
    }
}
