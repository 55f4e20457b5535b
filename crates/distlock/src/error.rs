//! 锁错误类型
//!
//! 区分存储不可用、协议错误、取消等失败；锁被他人持有不是错误，以 `Ok(false)` 表示。

use thiserror::Error;

/// 存储适配层错误
///
/// 由 `KvScriptStore` / `NodeStore` 的实现返回，再由后端转换为 [`LockError`]。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// 服务端脚本缓存中找不到对应 SHA
    #[error("script not cached on server")]
    NoScript,

    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("NOSCRIPT") {
            Self::NoScript
        } else if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::Unavailable(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// 存储适配层 Result 类型别名
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 分布式锁错误
#[derive(Debug, Error)]
pub enum LockError {
    #[error("锁 key 不能为空")]
    InvalidKey,

    #[error("锁存储不可用: {0}")]
    BackendUnavailable(String),

    #[error("锁存储返回了意外结果: {0}")]
    Protocol(String),

    #[error("等待锁被取消")]
    Cancelled,

    #[error("当前后端不支持重入: key={key}")]
    NotReentrant { key: String },

    #[error("锁被其他持有者占用: key={key}")]
    Contended { key: String },

    #[error("锁客户端已关闭")]
    Shutdown,

    #[error("配置错误: {0}")]
    Config(String),
}

/// 锁 Result 类型别名
pub type Result<T> = std::result::Result<T, LockError>;

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::BackendUnavailable(msg),
            // 走到这里说明重试后仍然缺少脚本
            StoreError::NoScript => Self::Protocol("NOSCRIPT after script reload".to_string()),
            StoreError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl LockError {
    /// 是否为存储不可用（调用方可选择无锁继续或中止）
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}
