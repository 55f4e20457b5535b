//! 锁 key 与持有者标识

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{LockError, Result};

/// 互斥资源的标识，保证非空
///
/// 内部使用 `Arc<str>`，克隆成本低，可在注册表和后台任务间共享。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(Arc<str>);

impl LockKey {
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let key = key.as_ref();
        if key.trim().is_empty() {
            return Err(LockError::InvalidKey);
        }
        Ok(Self(Arc::from(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for LockKey {
    type Error = LockError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for LockKey {
    type Error = LockError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// 锁持有者标识
///
/// 格式: `instance_id:uuid`，instance_id 区分进程内的不同客户端实例，
/// uuid 区分同一实例下的不同锁句柄。同一句柄的重入调用使用同一个 OwnerId。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(Arc<str>);

impl OwnerId {
    pub fn generate(instance_id: &str) -> Self {
        Self(Arc::from(format!("{}:{}", instance_id, Uuid::new_v4())))
    }

    /// 从存储中读出的原始值构造，用于比较和展示
    pub fn from_raw(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_rejects_empty() {
        assert!(matches!(LockKey::new(""), Err(LockError::InvalidKey)));
        assert!(matches!(LockKey::new("   "), Err(LockError::InvalidKey)));
        assert_eq!(LockKey::new("job:1").unwrap().as_str(), "job:1");
    }

    #[test]
    fn test_lock_key_try_from() {
        let key: LockKey = "redeem:user123".try_into().unwrap();
        assert_eq!(key.to_string(), "redeem:user123");
        assert!(LockKey::try_from(String::new()).is_err());
    }

    #[test]
    fn test_owner_format() {
        let instance_id = Uuid::new_v4().to_string();
        let owner = OwnerId::generate(&instance_id);

        let parts: Vec<&str> = owner.as_str().split(':').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], instance_id);
        assert!(Uuid::parse_str(parts[1]).is_ok());
    }

    #[test]
    fn test_owner_uniqueness() {
        let a = OwnerId::generate("instance");
        let b = OwnerId::generate("instance");
        assert_ne!(a, b);
        assert_eq!(OwnerId::from_raw(a.as_str()), a);
    }
}
