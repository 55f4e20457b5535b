//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 导出器自带 HTTP 监听，供 Prometheus 抓取。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// 安装 Prometheus recorder 并在指定端口暴露指标
///
/// 需要在 tokio 运行时内调用。
pub fn init(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_lock_metrics();
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// 注册锁相关指标的描述
///
/// 这些描述会出现在 /metrics 端点的 HELP 注释中
fn describe_lock_metrics() {
    metrics::describe_counter!("lock_acquire_total", "Total number of lock acquire attempts");
    metrics::describe_counter!("lock_release_total", "Total number of lock release attempts");
    metrics::describe_counter!("lock_wakeups_total", "Total number of parked waiters woken");
    metrics::describe_counter!(
        "lock_watchdog_failopen_total",
        "Total number of fail-open wakes triggered by the watchdog"
    );
    metrics::describe_histogram!(
        "lock_wait_duration_seconds",
        "Time spent waiting for a contended lock"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次远端加锁尝试
#[inline]
pub fn record_acquire(backend: &'static str, acquired: bool) {
    let result = if acquired { "acquired" } else { "contended" };
    metrics::counter!("lock_acquire_total", "backend" => backend, "result" => result).increment(1);
}

/// 记录一次远端解锁尝试
#[inline]
pub fn record_release(backend: &'static str, released: bool) {
    let result = if released { "released" } else { "not_owner" };
    metrics::counter!("lock_release_total", "backend" => backend, "result" => result).increment(1);
}

/// 记录被唤醒的等待者数量
#[inline]
pub fn record_wakeups(reason: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!("lock_wakeups_total", "reason" => reason).increment(count as u64);
    }
}

/// 记录看门狗触发的全量唤醒
#[inline]
pub fn record_fail_open() {
    metrics::counter!("lock_watchdog_failopen_total").increment(1);
}

/// 记录阻塞等待耗时
#[inline]
pub fn record_wait(duration_secs: f64) {
    metrics::histogram!("lock_wait_duration_seconds").record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // 未安装 recorder 时记录操作是空操作，不应 panic
        record_acquire("memory", true);
        record_release("memory", false);
        record_wakeups("released", 3);
        record_wakeups("released", 0);
        record_fail_open();
        record_wait(0.5);
    }
}
