//! 存活看门狗
//!
//! 两个相互独立的周期任务：
//!
//! - **存储心跳**：ping 后端，失败时以 `StoreUnavailable` 唤醒本进程的全部等待者（放行）
//! - **过期巡检**：逐个检查存在等待者的 key，锁记录已不存在时以 `Expired` 唤醒该 key 的等待者
//!
//! 锁记录可能在持有者崩溃后静默过期而不发出释放通知，巡检保证等待者不会永久挂起。

use std::sync::Arc;
use std::time::Duration;

use distlock_shared::config::LockConfig;
use distlock_shared::observability::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{KeyTtl, LockBackend};
use crate::registry::{WaiterRegistry, WakeReason};

/// 周期下限，零间隔会让 `interval_at` panic
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// 一次巡检的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// 已检查的 key 数
    pub checked: usize,
    /// 锁记录已不存在的 key 数
    pub expired: usize,
    /// 唤醒的等待者数（含放行）
    pub woken: usize,
    /// 是否因存储不可达提前结束
    pub aborted: bool,
}

pub struct Watchdog {
    backend: Arc<dyn LockBackend>,
    registry: Arc<WaiterRegistry>,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
}

impl Watchdog {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        registry: Arc<WaiterRegistry>,
        heartbeat_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        if heartbeat_interval < MIN_INTERVAL || sweep_interval < MIN_INTERVAL {
            warn!(
                heartbeat_ms = heartbeat_interval.as_millis() as u64,
                sweep_ms = sweep_interval.as_millis() as u64,
                "Watchdog interval too small, clamping to {:?}",
                MIN_INTERVAL
            );
        }
        Self {
            backend,
            registry,
            heartbeat_interval: heartbeat_interval.max(MIN_INTERVAL),
            sweep_interval: sweep_interval.max(MIN_INTERVAL),
        }
    }

    pub fn from_config(
        backend: Arc<dyn LockBackend>,
        registry: Arc<WaiterRegistry>,
        config: &LockConfig,
    ) -> Self {
        Self::new(
            backend,
            registry,
            config.heartbeat_interval(),
            config.sweep_interval(),
        )
    }

    /// 执行一次心跳，存储可达时返回 true
    pub async fn heartbeat_once(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Lock store heartbeat failed");
                self.fail_open();
                false
            }
        }
    }

    /// 执行一次过期巡检
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self.registry.keys() {
            report.checked += 1;
            match self.backend.remaining_ttl(&key).await {
                Ok(KeyTtl::Absent) => {
                    report.expired += 1;
                    let woken = self.registry.wake_key(&key, WakeReason::Expired);
                    report.woken += woken;
                    info!(key = %key, woken, "Lock record gone without release notice, waking waiters");
                }
                Ok(_) => {}
                Err(e) if e.is_unavailable() => {
                    warn!(key = %key, error = %e, "Lock store unreachable during sweep");
                    report.woken += self.fail_open();
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to query lock TTL, skipping key");
                }
            }
        }

        if report.checked > 0 {
            debug!(?report, "Stale key sweep finished");
        }
        report
    }

    fn fail_open(&self) -> usize {
        metrics::record_fail_open();
        let woken = self.registry.wake_all(WakeReason::StoreUnavailable);
        warn!(woken, "Failing open: woke all local waiters");
        woken
    }

    /// 启动心跳与巡检两个任务，第一次执行在一个周期之后
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let watchdog = Arc::new(self);
        info!(
            heartbeat_secs = watchdog.heartbeat_interval.as_secs_f64(),
            sweep_secs = watchdog.sweep_interval.as_secs_f64(),
            "Lock watchdog started"
        );

        let heartbeat = {
            let watchdog = watchdog.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let period = watchdog.heartbeat_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                while !*shutdown.borrow() {
                    tokio::select! {
                        _ = ticker.tick() => {
                            watchdog.heartbeat_once().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Heartbeat task stopped");
            })
        };

        let sweep = {
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let period = watchdog.sweep_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                while !*shutdown.borrow() {
                    tokio::select! {
                        _ = ticker.tick() => {
                            watchdog.sweep_once().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Sweep task stopped");
            })
        };

        vec![heartbeat, sweep]
    }
}
