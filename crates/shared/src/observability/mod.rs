//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。
//! 锁库本身只通过 `tracing` 宏和 `metrics` 宏上报，由进程入口决定是否安装订阅者和导出器。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use serde::Deserialize;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识日志和指标的来源
    pub service_name: String,

    /// 日志级别（如 "info", "debug"）
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    pub json_logs: bool,

    /// Prometheus 指标导出端口，为空时不启动导出器
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            log_level: "info".to_string(),
            json_logs: false,
            metrics_port: None,
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus 指标，仅在配置了端口时）
///
/// # Example
///
/// ```ignore
/// use distlock_shared::observability::{init, ObservabilityConfig};
///
/// let config = ObservabilityConfig::default().with_service_name("lockctl");
/// init(&config)?;
/// ```
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    tracing::init(config)?;

    if let Some(port) = config.metrics_port {
        metrics::init(port)?;
    }

    info!(
        service = %config.service_name,
        metrics_port = ?config.metrics_port,
        "Observability initialized"
    );

    Ok(())
}
