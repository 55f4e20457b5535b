//! 进程内后端
//!
//! [`MemoryKvServer`] 按 KV 脚本的语义保存锁记录（持有者、重入计数、TTL），
//! [`MemoryNodeEnsemble`] 模拟带会话的临时节点存储。两者都可以切换为不可用状态，
//! 用于演练存储故障时的放行路径。多个后端实例共享同一个 server/ensemble 即可模拟多进程。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::node::{CreateOutcome, NodeData, NodeStore};
use super::{BackendKind, KeyTtl, LockBackend, ReleaseStream};
use crate::error::{LockError, Result, StoreError, StoreResult};
use crate::key::{LockKey, OwnerId};

const EVENT_CAPACITY: usize = 1024;

/// 把广播接收端转换为事件流
///
/// 接收端落后（Lagged）时结束流：丢失的事件无法补回，由订阅方重新订阅并全量唤醒。
fn broadcast_stream(rx: broadcast::Receiver<String>) -> BoxStream<'static, String> {
    futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(item) => Some((item, rx)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Release event subscriber lagged");
                None
            }
            Err(RecvError::Closed) => None,
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// KV
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KvRecord {
    owner: String,
    count: u32,
    expires_at: Instant,
}

struct KvInner {
    records: Mutex<HashMap<String, KvRecord>>,
    available: AtomicBool,
    events: Mutex<broadcast::Sender<String>>,
}

/// 锁记录快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub owner: String,
    pub count: u32,
}

/// 进程内 KV 存储
#[derive(Clone)]
pub struct MemoryKvServer {
    inner: Arc<KvInner>,
}

impl Default for MemoryKvServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvServer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(KvInner {
                records: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                events: Mutex::new(events),
            }),
        }
    }

    /// 创建连接到本存储的后端，多个后端共享锁记录
    pub fn backend(&self) -> MemoryLockBackend {
        MemoryLockBackend {
            server: self.clone(),
        }
    }

    /// 切换可用状态；置为不可用时现有订阅全部断开
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            *self.inner.events.lock() = events;
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// 未过期的锁记录快照
    pub fn record(&self, key: &str) -> Option<MemoryRecord> {
        let mut records = self.inner.records.lock();
        live_record(&mut records, key).map(|record| MemoryRecord {
            owner: record.owner.clone(),
            count: record.count,
        })
    }

    /// 让记录立即过期，模拟持有者崩溃后 TTL 到期（不发布释放通知）
    pub fn expire_now(&self, key: &str) -> bool {
        self.inner.records.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut records = self.inner.records.lock();
        records.retain(|_, record| record.expires_at > now);
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(LockError::BackendUnavailable("memory store offline".to_string()))
        }
    }

    fn publish(&self, key: &str) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.inner.events.lock().send(key.to_string());
    }
}

/// 读取记录时顺带清理已过期的记录
fn live_record<'a>(records: &'a mut HashMap<String, KvRecord>, key: &str) -> Option<&'a mut KvRecord> {
    let expired = records
        .get(key)
        .is_some_and(|record| record.expires_at <= Instant::now());
    if expired {
        records.remove(key);
    }
    records.get_mut(key)
}

/// 进程内 KV 锁后端，语义与 KV 脚本后端一致
#[derive(Clone)]
pub struct MemoryLockBackend {
    server: MemoryKvServer,
}

impl MemoryLockBackend {
    pub fn server(&self) -> &MemoryKvServer {
        &self.server
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn try_acquire(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool> {
        self.server.check_available()?;
        let expires_at = Instant::now() + ttl;
        let mut records = self.server.inner.records.lock();

        match live_record(&mut records, key.as_str()) {
            None => {
                records.insert(
                    key.to_string(),
                    KvRecord {
                        owner: owner.to_string(),
                        count: 1,
                        expires_at,
                    },
                );
                Ok(true)
            }
            Some(record) if record.owner == owner.as_str() => {
                record.count = record.count.checked_add(1).ok_or_else(|| {
                    LockError::Protocol(format!("reentrancy count overflow for {}", key))
                })?;
                record.expires_at = expires_at;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn try_release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool> {
        self.server.check_available()?;
        let released = {
            let mut records = self.server.inner.records.lock();
            match live_record(&mut records, key.as_str()) {
                Some(record) if record.owner == owner.as_str() => {
                    record.count = record.count.saturating_sub(1);
                    if record.count == 0 {
                        records.remove(key.as_str());
                        Some(true)
                    } else {
                        Some(false)
                    }
                }
                _ => None,
            }
        };

        match released {
            Some(true) => {
                debug!(key = %key, "Lock record deleted");
                self.server.publish(key.as_str());
                Ok(true)
            }
            Some(false) => Ok(true),
            None => Ok(false),
        }
    }

    async fn try_renew(&self, key: &LockKey, owner: &OwnerId, ttl: Duration) -> Result<bool> {
        self.server.check_available()?;
        let mut records = self.server.inner.records.lock();
        match live_record(&mut records, key.as_str()) {
            Some(record) if record.owner == owner.as_str() => {
                record.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remaining_ttl(&self, key: &LockKey) -> Result<KeyTtl> {
        self.server.check_available()?;
        let mut records = self.server.inner.records.lock();
        Ok(match live_record(&mut records, key.as_str()) {
            Some(record) => KeyTtl::Expires(record.expires_at.saturating_duration_since(Instant::now())),
            None => KeyTtl::Absent,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.server.check_available()
    }

    async fn release_events(&self) -> Result<ReleaseStream> {
        self.server.check_available()?;
        let rx = self.server.inner.events.lock().subscribe();
        Ok(broadcast_stream(rx))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: u64,
    session: u64,
}

struct EnsembleInner {
    nodes: Mutex<HashMap<String, Node>>,
    next_session: AtomicU64,
    next_version: AtomicU64,
    available: AtomicBool,
    events: broadcast::Sender<String>,
}

impl EnsembleInner {
    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("node ensemble offline".to_string()))
        }
    }

    fn notify_deleted(&self, path: &str) {
        let _ = self.events.send(path.to_string());
    }
}

/// 进程内层级节点存储
#[derive(Clone)]
pub struct MemoryNodeEnsemble {
    inner: Arc<EnsembleInner>,
}

impl Default for MemoryNodeEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNodeEnsemble {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(EnsembleInner {
                nodes: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                next_version: AtomicU64::new(1),
                available: AtomicBool::new(true),
                events,
            }),
        }
    }

    /// 打开新会话，会话创建的临时节点在会话关闭时删除
    pub fn session(&self) -> MemoryNodeSession {
        MemoryNodeSession {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            ensemble: self.inner.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    pub fn node_owner(&self, path: &str) -> Option<String> {
        self.inner
            .nodes
            .lock()
            .get(path)
            .map(|node| String::from_utf8_lossy(&node.data).into_owned())
    }
}

/// 存储会话
pub struct MemoryNodeSession {
    id: u64,
    ensemble: Arc<EnsembleInner>,
    closed: AtomicBool,
}

impl MemoryNodeSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 关闭会话并删除其全部临时节点，返回删除数量
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let removed: Vec<String> = {
            let mut nodes = self.ensemble.nodes.lock();
            let paths: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.session == self.id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                nodes.remove(path);
            }
            paths
        };

        for path in &removed {
            self.ensemble.notify_deleted(path);
        }
        if !removed.is_empty() {
            debug!(session = self.id, removed = removed.len(), "Session closed, ephemeral nodes removed");
        }
        removed.len()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Unavailable(format!("session {} closed", self.id)));
        }
        self.ensemble.check_available()
    }
}

impl Drop for MemoryNodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl NodeStore for MemoryNodeSession {
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> StoreResult<CreateOutcome> {
        self.check_open()?;
        let mut nodes = self.ensemble.nodes.lock();
        if nodes.contains_key(path) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: self.ensemble.next_version.fetch_add(1, Ordering::Relaxed),
                session: self.id,
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<NodeData>> {
        self.check_open()?;
        Ok(self.ensemble.nodes.lock().get(path).map(|node| NodeData {
            data: node.data.clone(),
            version: node.version,
        }))
    }

    async fn delete(&self, path: &str, version: u64) -> StoreResult<bool> {
        self.check_open()?;
        let deleted = {
            let mut nodes = self.ensemble.nodes.lock();
            let matches = nodes.get(path).is_some_and(|node| node.version == version);
            if matches {
                nodes.remove(path);
            }
            matches
        };
        if deleted {
            self.ensemble.notify_deleted(path);
        }
        Ok(deleted)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_open()
    }

    async fn watch_deletions(&self, prefix: &str) -> StoreResult<BoxStream<'static, String>> {
        self.check_open()?;
        let prefix = prefix.to_string();
        let paths = broadcast_stream(self.ensemble.events.subscribe()).filter(move |path| {
            let matched = path.starts_with(&prefix);
            async move { matched }
        });
        Ok(paths.boxed())
    }
}
