//! KV 脚本后端
//!
//! 锁的获取与释放都以服务端脚本原子执行。脚本在首次使用时注册一次，
//! 服务端脚本缓存被清空（NOSCRIPT）时重新注册并重试一次。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::Client;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::scripts::{self, Script, ScriptShas};
use super::{BackendKind, KeyTtl, LockBackend, ReleaseStream};
use crate::error::{LockError, Result, StoreError, StoreResult};
use crate::key::{LockKey, OwnerId};

/// 后端依赖的存储能力：执行脚本、查询 TTL、心跳、订阅频道
///
/// 连接管理由实现方负责，后端只调用这些能力。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvScriptStore: Send + Sync {
    /// 注册脚本，返回 SHA
    async fn script_load(&self, body: &str) -> StoreResult<String>;

    /// 按 SHA 执行脚本，脚本返回整数
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> StoreResult<i64>;

    /// 剩余存活毫秒数，-2 表示不存在，-1 表示无过期时间
    async fn pttl(&self, key: &str) -> StoreResult<i64>;

    async fn ping(&self) -> StoreResult<()>;

    /// 订阅频道，流中元素为消息负载
    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>>;
}

/// 基于 Redis 的存储实现
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// 建立连接，ConnectionManager 在连接断开后自动重连
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Redis client created");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl KvScriptStore for RedisStore {
    async fn script_load(&self, body: &str) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        let result: i64 = cmd.query_async(&mut conn).await?;
        Ok(result)
    }

    async fn pttl(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(millis)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, "Subscribed to release channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed release message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// KV 脚本锁后端，支持重入
pub struct RedisLockBackend<S> {
    store: S,
    channel: String,
    shas: OnceCell<ScriptShas>,
}

impl<S: KvScriptStore> RedisLockBackend<S> {
    pub fn new(store: S, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
            shas: OnceCell::new(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 首次使用时注册全部脚本，并发的首次调用只有一个会真正执行注册
    async fn shas(&self) -> Result<&ScriptShas> {
        let shas = self
            .shas
            .get_or_try_init(|| async {
                let acquire = self.store.script_load(Script::Acquire.body()).await?;
                let release = self.store.script_load(Script::Release.body()).await?;
                let renew = self.store.script_load(Script::Renew.body()).await?;
                info!("Lock scripts registered");
                Ok::<_, StoreError>(ScriptShas {
                    acquire,
                    release,
                    renew,
                })
            })
            .await?;
        Ok(shas)
    }

    async fn eval(&self, script: Script, keys: &[String], args: &[String]) -> Result<i64> {
        let shas = self.shas().await?;
        match self.store.eval_sha(shas.get(script), keys, args).await {
            Err(StoreError::NoScript) => {
                warn!(script = script.name(), "Script cache miss, re-registering");
                let sha = self.store.script_load(script.body()).await?;
                Ok(self.store.eval_sha(&sha, keys, args).await?)
            }
            other => Ok(other?),
        }
    }
}

fn unexpected(script: Script, value: i64) -> LockError {
    LockError::Protocol(format!("{} script returned {}", script.name(), value))
}

#[async_trait]
impl<S: KvScriptStore> LockBackend for RedisLockBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::KvScript
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn try_acquire(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool> {
        let keys = [key.to_string()];
        let args = [
            scripts::OWNER_FIELD.to_string(),
            scripts::COUNT_FIELD.to_string(),
            owner.to_string(),
            scripts::INITIAL_COUNT.to_string(),
            scripts::ttl_secs(ttl).to_string(),
        ];
        match self.eval(Script::Acquire, &keys, &args).await? {
            scripts::ACQUIRED => Ok(true),
            scripts::NOT_ACQUIRED => Ok(false),
            other => Err(unexpected(Script::Acquire, other)),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn try_release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool> {
        let keys = [key.to_string(), self.channel.clone()];
        let args = [
            scripts::OWNER_FIELD.to_string(),
            scripts::COUNT_FIELD.to_string(),
            owner.to_string(),
        ];
        match self.eval(Script::Release, &keys, &args).await? {
            scripts::RELEASED => {
                debug!("Lock record deleted");
                Ok(true)
            }
            scripts::DEPTH_REDUCED => Ok(true),
            scripts::NOT_HELD => Ok(false),
            other => Err(unexpected(Script::Release, other)),
        }
    }

    async fn try_renew(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool> {
        let keys = [key.to_string()];
        let args = [
            scripts::OWNER_FIELD.to_string(),
            owner.to_string(),
            scripts::ttl_secs(ttl).to_string(),
        ];
        match self.eval(Script::Renew, &keys, &args).await? {
            1 => Ok(true),
            0 => Ok(false),
            other => Err(unexpected(Script::Renew, other)),
        }
    }

    async fn remaining_ttl(&self, key: &LockKey) -> Result<KeyTtl> {
        let millis = self.store.pttl(key.as_str()).await?;
        Ok(KeyTtl::from_pttl(millis))
    }

    async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }

    async fn release_events(&self) -> Result<ReleaseStream> {
        Ok(self.store.subscribe(&self.channel).await?)
    }
}
