//! 配置加载集成测试
//!
//! 环境变量是进程级状态，本文件只保留一个测试函数以避免并行测试互相干扰。

use std::path::PathBuf;
use std::time::Duration;

use distlock_shared::config::{AppConfig, BackendStrategy};

fn workspace_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
}

#[test]
fn test_load_layers_files_and_env_overrides() {
    // SAFETY: 本测试二进制中只有这一个测试，不存在并发读写环境变量
    unsafe {
        std::env::set_var("CONFIG_DIR", workspace_config_dir());
        std::env::set_var("DISTLOCK_ENV", "production");
        std::env::set_var("DISTLOCK_LOCK__BACKEND", "node");
        std::env::set_var("DISTLOCK_LOCK__HEARTBEAT_SECS", "5");
        std::env::set_var("DISTLOCK_REDIS__URL", "redis://cache:6380/2");
    }

    let config = AppConfig::load("lockctl").unwrap();
    assert_eq!(config.service_name, "lockctl");
    assert!(config.is_production());
    assert_eq!(config.observability.service_name, "lockctl");
    // default.toml 提供的值
    assert_eq!(config.lock.channel, "_distlock:released");
    assert_eq!(config.lock.sweep_interval(), Duration::from_secs(60));
    // 环境变量覆盖
    assert_eq!(config.lock.backend, BackendStrategy::Node);
    assert_eq!(config.lock.heartbeat_interval(), Duration::from_secs(5));
    assert_eq!(config.redis.url, "redis://cache:6380/2");

    // 校验失败时加载报错
    unsafe {
        std::env::set_var("DISTLOCK_LOCK__HEARTBEAT_SECS", "0");
    }
    assert!(AppConfig::load("lockctl").is_err());

    unsafe {
        for var in [
            "CONFIG_DIR",
            "DISTLOCK_ENV",
            "DISTLOCK_LOCK__BACKEND",
            "DISTLOCK_LOCK__HEARTBEAT_SECS",
            "DISTLOCK_REDIS__URL",
        ] {
            std::env::remove_var(var);
        }
    }
}
