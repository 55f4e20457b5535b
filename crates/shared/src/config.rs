//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// 锁后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStrategy {
    /// Redis Lua 脚本实现，支持重入
    Redis,
    /// 层级节点（临时节点）实现，不支持重入
    Node,
    /// 进程内模拟的 KV 存储，用于本地开发和测试
    Memory,
}

/// 分布式锁配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// 使用的锁后端
    pub backend: BackendStrategy,
    /// 未显式指定时的锁持有时间（秒）
    pub default_lease_secs: u64,
    /// 自动续期模式下每次写入的 TTL（秒）
    pub auto_lease_secs: u64,
    /// 释放通知的发布/订阅通道
    pub channel: String,
    /// 层级节点后端的锁路径前缀
    pub node_prefix: String,
    /// 是否启动存活看门狗
    pub watchdog_enabled: bool,
    /// 存储心跳间隔（秒）
    pub heartbeat_secs: u64,
    /// 过期 key 巡检间隔（秒）
    pub sweep_secs: u64,
    /// 订阅断开后的重连初始退避（毫秒）
    pub resubscribe_initial_ms: u64,
    /// 订阅断开后的重连最大退避（毫秒）
    pub resubscribe_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: BackendStrategy::Redis,
            default_lease_secs: 30,
            auto_lease_secs: 30,
            channel: "_distlock:released".to_string(),
            node_prefix: "/_lock_".to_string(),
            watchdog_enabled: true,
            heartbeat_secs: 30,
            sweep_secs: 60,
            resubscribe_initial_ms: 500,
            resubscribe_max_ms: 30_000,
        }
    }
}

impl LockConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_lease_secs)
    }

    pub fn auto_lease(&self) -> Duration {
        Duration::from_secs(self.auto_lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }

    /// 校验配置取值，零间隔会让周期任务空转
    pub fn validate(&self) -> Result<(), String> {
        if self.default_lease_secs == 0 || self.auto_lease_secs == 0 {
            return Err("lease seconds must be greater than zero".to_string());
        }
        if self.heartbeat_secs == 0 || self.sweep_secs == 0 {
            return Err("watchdog intervals must be greater than zero".to_string());
        }
        if self.channel.trim().is_empty() {
            return Err("notification channel must not be empty".to_string());
        }
        if !self.node_prefix.starts_with('/') {
            return Err(format!("node prefix must be absolute: {}", self.node_prefix));
        }
        Ok(())
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（DISTLOCK_ 前缀，层级用双下划线，如 DISTLOCK_REDIS__URL -> redis.url）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("DISTLOCK_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("DISTLOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        if config.observability.service_name.is_empty() {
            config.observability.service_name = config.service_name.clone();
        }

        config.lock.validate().map_err(ConfigError::Message)?;

        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lock_config() {
        let config = LockConfig::default();
        assert_eq!(config.backend, BackendStrategy::Redis);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.default_lease(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = LockConfig {
            heartbeat_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LockConfig {
            default_lease_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_prefix() {
        let config = LockConfig {
            node_prefix: "locks".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_strategy_deserialize() {
        let config = Config::builder()
            .set_override("backend", "node")
            .unwrap()
            .build()
            .unwrap();
        let lock: LockConfig = config.try_deserialize().unwrap();
        assert_eq!(lock.backend, BackendStrategy::Node);
        // 未覆盖的字段取默认值
        assert_eq!(lock.channel, "_distlock:released");
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        // SAFETY: 测试只读取不存在的目录，不修改其他测试依赖的变量
        unsafe {
            std::env::set_var("CONFIG_DIR", "/nonexistent-distlock-config");
        }
        let config = AppConfig::load("lockctl").unwrap();
        assert_eq!(config.service_name, "lockctl");
        assert_eq!(config.observability.service_name, "lockctl");
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(!config.is_production());
    }
}
