//! KV 后端的服务端脚本
//!
//! 锁记录是一个 hash：`owner` 字段保存持有者，`count` 字段保存重入深度，key 本身带 TTL。

use std::time::Duration;

/// 持有者字段名
pub const OWNER_FIELD: &str = "owner";
/// 重入计数字段名
pub const COUNT_FIELD: &str = "count";
/// 首次获取时的重入计数
pub const INITIAL_COUNT: &str = "1";

/// 获取锁
///
/// KEYS[1] = 锁 key
/// ARGV = [owner 字段, count 字段, 持有者, 初始计数, TTL 秒]
/// 返回 1 表示获取（或重入）成功，0 表示被他人持有
pub const ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3], ARGV[2], ARGV[4])
    redis.call('EXPIRE', KEYS[1], ARGV[5])
    return 1
end
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[3] then
    redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
    redis.call('EXPIRE', KEYS[1], ARGV[5])
    return 1
end
return 0
"#;

/// 释放锁
///
/// KEYS[1] = 锁 key，KEYS[2] = 释放通知频道
/// ARGV = [owner 字段, count 字段, 持有者]
/// 返回 1 表示完全释放（已删除并发布通知），2 表示仅减少重入深度，0 表示未持有
pub const RELEASE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[3] then
    return 0
end
local count = redis.call('HINCRBY', KEYS[1], ARGV[2], -1)
if count <= 0 then
    redis.call('DEL', KEYS[1])
    redis.call('PUBLISH', KEYS[2], KEYS[1])
    return 1
end
return 2
"#;

/// 续期
///
/// KEYS[1] = 锁 key
/// ARGV = [owner 字段, 持有者, TTL 秒]
/// 返回 1 表示续期成功，0 表示已不再持有
pub const RENEW: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
    return 1
end
return 0
"#;

pub const ACQUIRED: i64 = 1;
pub const NOT_ACQUIRED: i64 = 0;
pub const RELEASED: i64 = 1;
pub const DEPTH_REDUCED: i64 = 2;
pub const NOT_HELD: i64 = 0;

/// 脚本种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Acquire,
    Release,
    Renew,
}

impl Script {
    pub const ALL: [Script; 3] = [Script::Acquire, Script::Release, Script::Renew];

    pub fn body(self) -> &'static str {
        match self {
            Self::Acquire => ACQUIRE,
            Self::Release => RELEASE,
            Self::Renew => RENEW,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::Renew => "renew",
        }
    }
}

/// 已注册脚本的 SHA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptShas {
    pub acquire: String,
    pub release: String,
    pub renew: String,
}

impl ScriptShas {
    pub fn get(&self, script: Script) -> &str {
        match script {
            Script::Acquire => &self.acquire,
            Script::Release => &self.release,
            Script::Renew => &self.renew,
        }
    }
}

/// TTL 转换为脚本使用的秒数，向上取整且至少为 1
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
