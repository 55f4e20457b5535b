//! 测试工具模块
//!
//! 提供集成测试所需的配置辅助函数和唯一 key 生成器。

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::config::{BackendStrategy, LockConfig, RedisConfig};

// ==================== 测试配置辅助 ====================

/// 创建测试用 Redis 配置
///
/// 优先使用环境变量，默认使用 db 1 避免污染开发数据
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("TEST_REDIS_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
    }
}

/// 创建测试用锁配置
///
/// 使用内存后端，并把看门狗间隔缩短到秒级
pub fn test_lock_config() -> LockConfig {
    LockConfig {
        backend: BackendStrategy::Memory,
        default_lease_secs: 10,
        auto_lease_secs: 3,
        heartbeat_secs: 1,
        sweep_secs: 2,
        resubscribe_initial_ms: 10,
        resubscribe_max_ms: 100,
        ..LockConfig::default()
    }
}

/// 生成唯一的测试锁 key
///
/// 使用 UUID + 原子计数器确保并行测试之间互不干扰
pub fn test_lock_key(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test:{}:{}:{}", prefix, Uuid::new_v4().simple(), seq)
}
