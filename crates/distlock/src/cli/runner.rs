//! 命令执行器
//!
//! 负责执行各 CLI 子命令的具体逻辑，结果输出到标准输出，过程日志走 tracing。

use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{error, info};

use crate::backend::KeyTtl;
use crate::client::LockClient;
use crate::lock::Lease;

/// 命令执行器
pub struct CommandRunner {
    client: LockClient,
}

impl CommandRunner {
    pub fn new(client: LockClient) -> Self {
        Self { client }
    }

    /// 执行 hold 命令
    ///
    /// 以自动租约持有锁，直到持有时长结束或收到 Ctrl+C。
    pub async fn run_hold(&self, key: &str, hold: Duration, wait: Option<Duration>) -> Result<()> {
        let lock = self.client.lock_with_lease(key, Lease::Auto)?;

        let acquired = match wait {
            Some(wait) => lock.try_lock_for_or_cancel(wait, shutdown_signal()).await?,
            None => {
                lock.lock_or_cancel(shutdown_signal()).await?;
                true
            }
        };
        if !acquired {
            bail!("等待超时，未能获取锁: {}", key);
        }

        info!(key, owner = %lock.owner(), hold_secs = hold.as_secs(), "Lock acquired, holding");
        println!("acquired {} as {}", key, lock.owner());

        tokio::select! {
            _ = tokio::time::sleep(hold) => {}
            _ = shutdown_signal() => info!("Interrupted, releasing early"),
        }

        let released = lock.unlock().await?;
        println!("{} {}", if released { "released" } else { "lost" }, key);
        Ok(())
    }

    /// 执行 try 命令，返回是否获取成功
    pub async fn run_try(&self, key: &str) -> Result<bool> {
        let lock = self.client.lock(key)?;
        let acquired = lock.try_lock().await?;
        if acquired {
            lock.unlock().await?;
            println!("acquired {}", key);
        } else {
            println!("contended {}", key);
        }
        Ok(acquired)
    }

    /// 执行 status 命令
    pub async fn run_status(&self, key: &str) -> Result<KeyTtl> {
        let key = crate::key::LockKey::new(key)?;
        let ttl = self.client.backend().remaining_ttl(&key).await?;
        match ttl {
            KeyTtl::Absent => println!("{} free", key),
            KeyTtl::Persistent => println!("{} held (no expiry)", key),
            KeyTtl::Expires(remaining) => {
                println!("{} held, expires in {:.1}s", key, remaining.as_secs_f64())
            }
        }
        Ok(ttl)
    }

    /// 执行 ping 命令
    pub async fn run_ping(&self) -> Result<()> {
        self.client.backend().ping().await?;
        println!("{} backend reachable", self.client.backend_kind());
        Ok(())
    }
}

/// 等待 Ctrl+C
///
/// 信号处理器安装失败时永不返回，避免误判为中断。
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "安装 CTRL+C 信号处理器失败");
        std::future::pending::<()>().await;
    }
    info!("收到关闭信号");
}
