//! 层级节点后端
//!
//! 每把锁对应前缀下的一个临时节点，节点负载为持有者标识。节点本身就是锁，
//! 没有重入计数；持有者会话断开时节点由存储端删除，代替 TTL 过期。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, instrument};

use super::{BackendKind, KeyTtl, LockBackend, ReleaseStream};
use crate::error::{Result, StoreResult};
use crate::key::{LockKey, OwnerId};

/// 创建节点的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// 节点负载及其版本，删除时以版本做比较
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: u64,
}

/// 后端依赖的层级节点存储能力
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// 创建绑定当前会话的临时节点
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> StoreResult<CreateOutcome>;

    async fn get_data(&self, path: &str) -> StoreResult<Option<NodeData>>;

    /// 仅当版本一致时删除，返回是否删除
    async fn delete(&self, path: &str, version: u64) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;

    /// 监听前缀下节点的删除事件，流中元素为被删除节点的完整路径
    async fn watch_deletions(&self, prefix: &str) -> StoreResult<BoxStream<'static, String>>;
}

/// 临时节点锁后端，不支持重入
pub struct NodeLockBackend<S> {
    store: Arc<S>,
    prefix: String,
}

impl<S: NodeStore> NodeLockBackend<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { store, prefix }
    }

    pub fn node_path(&self, key: &LockKey) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

#[async_trait]
impl<S: NodeStore + 'static> LockBackend for NodeLockBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Node
    }

    /// 临时节点随会话存活，`ttl` 不参与
    #[instrument(skip_all, fields(key = %key))]
    async fn try_acquire(&self, key: &LockKey, owner: &OwnerId, _ttl: Duration) -> Result<bool> {
        let path = self.node_path(key);
        match self.store.create_ephemeral(&path, owner.as_bytes()).await? {
            CreateOutcome::Created => Ok(true),
            CreateOutcome::AlreadyExists => Ok(false),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn try_release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool> {
        let path = self.node_path(key);
        let Some(node) = self.store.get_data(&path).await? else {
            return Ok(false);
        };
        if node.data != owner.as_bytes() {
            debug!("Release attempted by non-owner");
            return Ok(false);
        }
        Ok(self.store.delete(&path, node.version).await?)
    }

    async fn try_renew(&self, key: &LockKey, owner: &OwnerId, _ttl: Duration) -> Result<bool> {
        let node = self.store.get_data(&self.node_path(key)).await?;
        Ok(node.is_some_and(|node| node.data == owner.as_bytes()))
    }

    async fn remaining_ttl(&self, key: &LockKey) -> Result<KeyTtl> {
        match self.store.get_data(&self.node_path(key)).await? {
            Some(_) => Ok(KeyTtl::Persistent),
            None => Ok(KeyTtl::Absent),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }

    async fn release_events(&self) -> Result<ReleaseStream> {
        let deletions = self.store.watch_deletions(&self.prefix).await?;
        let prefix = format!("{}/", self.prefix);
        let keys = deletions.filter_map(move |path| {
            let key = path.strip_prefix(&prefix).map(str::to_string);
            async move { key }
        });
        Ok(keys.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryNodeEnsemble;

    fn key() -> LockKey {
        LockKey::new("job:1").unwrap()
    }

    fn backend(ensemble: &MemoryNodeEnsemble) -> NodeLockBackend<crate::backend::MemoryNodeSession> {
        NodeLockBackend::new(Arc::new(ensemble.session()), "/_lock_/")
    }

    #[tokio::test]
    async fn test_node_lock_is_not_reentrant() {
        let ensemble = MemoryNodeEnsemble::new();
        let backend = backend(&ensemble);
        let owner = OwnerId::from_raw("p1:a");
        let ttl = Duration::from_secs(30);

        assert!(backend.try_acquire(&key(), &owner, ttl).await.unwrap());
        // 同一持有者再次创建同一路径同样失败
        assert!(!backend.try_acquire(&key(), &owner, ttl).await.unwrap());
        assert_eq!(backend.node_path(&key()), "/_lock_/job:1");
    }

    #[tokio::test]
    async fn test_only_owner_can_release() {
        let ensemble = MemoryNodeEnsemble::new();
        let first = backend(&ensemble);
        let second = backend(&ensemble);
        let (a, b) = (OwnerId::from_raw("p1:a"), OwnerId::from_raw("p2:b"));

        assert!(first.try_acquire(&key(), &a, Duration::ZERO).await.unwrap());
        assert!(!second.try_acquire(&key(), &b, Duration::ZERO).await.unwrap());
        assert!(!second.try_release(&key(), &b).await.unwrap());
        assert_eq!(second.remaining_ttl(&key()).await.unwrap(), KeyTtl::Persistent);

        assert!(first.try_release(&key(), &a).await.unwrap());
        assert!(!first.try_release(&key(), &a).await.unwrap());
        assert_eq!(first.remaining_ttl(&key()).await.unwrap(), KeyTtl::Absent);
        assert!(second.try_acquire(&key(), &b, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_events_map_paths_to_keys() {
        let ensemble = MemoryNodeEnsemble::new();
        let backend = backend(&ensemble);
        let owner = OwnerId::from_raw("p1:a");
        let mut events = backend.release_events().await.unwrap();

        backend.try_acquire(&key(), &owner, Duration::ZERO).await.unwrap();
        backend.try_release(&key(), &owner).await.unwrap();

        assert_eq!(events.next().await.as_deref(), Some("job:1"));
    }

    #[tokio::test]
    async fn test_renew_checks_ownership() {
        let ensemble = MemoryNodeEnsemble::new();
        let backend = backend(&ensemble);
        let owner = OwnerId::from_raw("p1:a");

        assert!(!backend.try_renew(&key(), &owner, Duration::ZERO).await.unwrap());
        backend.try_acquire(&key(), &owner, Duration::ZERO).await.unwrap();
        assert!(backend.try_renew(&key(), &owner, Duration::ZERO).await.unwrap());
        assert!(
            !backend
                .try_renew(&key(), &OwnerId::from_raw("p2:b"), Duration::ZERO)
                .await
                .unwrap()
        );
    }
}
