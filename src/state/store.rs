use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use super::{ContactFlowState, SuspensionRecord};
use crate::error::{ChatFlowError, Result};

/// 单个联系人的排他锁凭证
///
/// 持有期间同一联系人的其他事件处理必须等待；通过 [`ContactStateStore::commit`]
/// 或 [`ContactStateStore::release`] 交还。
pub struct ContactLock {
    contact_id: String,
    token: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ContactLock {
    pub fn new(contact_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            token: token.into(),
            guard: None,
        }
    }

    fn with_guard(mut self, guard: OwnedMutexGuard<()>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for ContactLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactLock")
            .field("contact_id", &self.contact_id)
            .field("token", &self.token)
            .finish()
    }
}

/// 联系人流程状态存储 trait
#[async_trait]
pub trait ContactStateStore: Send + Sync {
    /// 获取联系人排他锁，超过 `wait` 返回 [`ChatFlowError::LockTimeout`]
    async fn lock(&self, contact_id: &str, wait: Duration) -> Result<ContactLock>;

    async fn load(&self, lock: &ContactLock) -> Result<Option<ContactFlowState>>;

    /// 原子地写入状态并释放锁；`None` 表示删除该联系人的状态行
    async fn commit(&self, lock: ContactLock, state: Option<&ContactFlowState>) -> Result<()>;

    /// 不写入任何变更，直接释放锁
    async fn release(&self, lock: ContactLock) -> Result<()>;

    async fn record_suspension(&self, record: SuspensionRecord) -> Result<()>;

    async fn suspension_records(&self, contact_id: &str) -> Result<Vec<SuspensionRecord>>;

    /// 最后更新时间早于 `cutoff` 的联系人
    async fn idle_contacts(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// 无锁读取，仅用于观察与测试
    async fn peek(&self, contact_id: &str) -> Result<Option<ContactFlowState>>;
}

/// 内存存储实现
pub struct MemoryContactStore {
    rows: RwLock<HashMap<String, ContactFlowState>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    audit: RwLock<Vec<SuspensionRecord>>,
    next_token: AtomicU64,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            audit: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// 直接写入一行状态，跳过锁；用于预置数据
    pub fn seed(&self, state: ContactFlowState) {
        self.rows.write().insert(state.contact_id.clone(), state);
    }

    fn row_lock(&self, contact_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(contact_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 无状态行且无人持有或等待时移除该联系人的锁
    fn prune_lock(&self, contact_id: &str) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(contact_id)
            .map(|mutex| Arc::strong_count(mutex) == 1)
            .unwrap_or(false);
        if idle && !self.rows.read().contains_key(contact_id) {
            locks.remove(contact_id);
        }
    }
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStateStore for MemoryContactStore {
    async fn lock(&self, contact_id: &str, wait: Duration) -> Result<ContactLock> {
        let mutex = self.row_lock(contact_id);
        let guard = match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(contact = contact_id, wait_ms = wait.as_millis() as u64, "contact lock timed out");
                return Err(ChatFlowError::LockTimeout(contact_id.to_string()));
            }
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        Ok(ContactLock::new(contact_id, token).with_guard(guard))
    }

    async fn load(&self, lock: &ContactLock) -> Result<Option<ContactFlowState>> {
        Ok(self.rows.read().get(lock.contact_id()).cloned())
    }

    async fn commit(&self, lock: ContactLock, state: Option<&ContactFlowState>) -> Result<()> {
        let contact_id = lock.contact_id.clone();
        match state {
            Some(state) => {
                self.rows.write().insert(contact_id, state.clone());
                drop(lock);
            }
            None => {
                self.rows.write().remove(&contact_id);
                drop(lock);
                self.prune_lock(&contact_id);
            }
        }
        Ok(())
    }

    async fn release(&self, lock: ContactLock) -> Result<()> {
        let contact_id = lock.contact_id.clone();
        drop(lock);
        self.prune_lock(&contact_id);
        Ok(())
    }

    async fn record_suspension(&self, record: SuspensionRecord) -> Result<()> {
        self.audit.write().push(record);
        Ok(())
    }

    async fn suspension_records(&self, contact_id: &str) -> Result<Vec<SuspensionRecord>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|record| record.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn idle_contacts(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut idle: Vec<String> = self
            .rows
            .read()
            .values()
            .filter(|state| state.updated_at < cutoff)
            .map(|state| state.contact_id.clone())
            .collect();
        idle.sort();
        Ok(idle)
    }

    async fn peek(&self, contact_id: &str) -> Result<Option<ContactFlowState>> {
        Ok(self.rows.read().get(contact_id).cloned())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis {
    use super::*;
    use ::redis::AsyncCommands;

    const COMMIT_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
if ARGV[2] == '' then
  redis.call('DEL', KEYS[2])
  redis.call('ZREM', KEYS[3], ARGV[4])
else
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[4])
end
redis.call('DEL', KEYS[1])
return 1
"#;

    const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

    const RETRY_INTERVAL: Duration = Duration::from_millis(25);

    fn store_err(err: ::redis::RedisError) -> ChatFlowError {
        ChatFlowError::Store(err.to_string())
    }

    /// Redis 存储实现：`SET NX PX` 行锁 + Lua 比较提交
    pub struct RedisContactStore {
        client: ::redis::Client,
        prefix: String,
        lock_ttl: Duration,
        next_token: AtomicU64,
    }

    impl RedisContactStore {
        pub fn new(client: ::redis::Client) -> Self {
            Self {
                client,
                prefix: "chatflow".to_string(),
                lock_ttl: Duration::from_secs(30),
                next_token: AtomicU64::new(1),
            }
        }

        pub fn from_url(url: &str) -> Result<Self> {
            let client = ::redis::Client::open(url).map_err(store_err)?;
            Ok(Self::new(client))
        }

        pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
            self.prefix = prefix.into();
            self
        }

        pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
            self.lock_ttl = ttl;
            self
        }

        fn state_key(&self, contact_id: &str) -> String {
            format!("{}:state:{}", self.prefix, contact_id)
        }

        fn lock_key(&self, contact_id: &str) -> String {
            format!("{}:lock:{}", self.prefix, contact_id)
        }

        fn audit_key(&self, contact_id: &str) -> String {
            format!("{}:audit:{}", self.prefix, contact_id)
        }

        fn index_key(&self) -> String {
            format!("{}:contacts", self.prefix)
        }

        async fn connection(&self) -> Result<::redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(store_err)
        }

        fn owner_token(&self) -> String {
            format!(
                "{}-{}-{}",
                std::process::id(),
                Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                self.next_token.fetch_add(1, Ordering::Relaxed)
            )
        }
    }

    #[async_trait]
    impl ContactStateStore for RedisContactStore {
        async fn lock(&self, contact_id: &str, wait: Duration) -> Result<ContactLock> {
            let mut conn = self.connection().await?;
            let key = self.lock_key(contact_id);
            let token = self.owner_token();
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                let acquired: Option<String> = ::redis::cmd("SET")
                    .arg(&key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(self.lock_ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
                    .map_err(store_err)?;
                if acquired.is_some() {
                    return Ok(ContactLock::new(contact_id, token));
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(contact = contact_id, "contact lock timed out");
                    return Err(ChatFlowError::LockTimeout(contact_id.to_string()));
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }

        async fn load(&self, lock: &ContactLock) -> Result<Option<ContactFlowState>> {
            self.peek(lock.contact_id()).await
        }

        async fn commit(&self, lock: ContactLock, state: Option<&ContactFlowState>) -> Result<()> {
            let mut conn = self.connection().await?;
            let payload = match state {
                Some(state) => serde_json::to_string(state)?,
                None => String::new(),
            };
            let score = state
                .map(|state| state.updated_at.timestamp())
                .unwrap_or_default();
            let committed: i64 = ::redis::Script::new(COMMIT_SCRIPT)
                .key(self.lock_key(lock.contact_id()))
                .key(self.state_key(lock.contact_id()))
                .key(self.index_key())
                .arg(lock.token())
                .arg(payload)
                .arg(score)
                .arg(lock.contact_id())
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?;
            if committed == 0 {
                return Err(ChatFlowError::Store(format!(
                    "lock for contact `{}` expired before commit",
                    lock.contact_id()
                )));
            }
            Ok(())
        }

        async fn release(&self, lock: ContactLock) -> Result<()> {
            let mut conn = self.connection().await?;
            let _: i64 = ::redis::Script::new(RELEASE_SCRIPT)
                .key(self.lock_key(lock.contact_id()))
                .arg(lock.token())
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?;
            Ok(())
        }

        async fn record_suspension(&self, record: SuspensionRecord) -> Result<()> {
            let mut conn = self.connection().await?;
            let payload = serde_json::to_string(&record)?;
            let _: i64 = conn
                .rpush(self.audit_key(&record.contact_id), payload)
                .await
                .map_err(store_err)?;
            Ok(())
        }

        async fn suspension_records(&self, contact_id: &str) -> Result<Vec<SuspensionRecord>> {
            let mut conn = self.connection().await?;
            let raw: Vec<String> = conn
                .lrange(self.audit_key(contact_id), 0, -1)
                .await
                .map_err(store_err)?;
            raw.iter()
                .map(|entry| serde_json::from_str(entry).map_err(ChatFlowError::from))
                .collect()
        }

        async fn idle_contacts(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
            let mut conn = self.connection().await?;
            let contacts: Vec<String> = conn
                .zrangebyscore(self.index_key(), "-inf", format!("({}", cutoff.timestamp()))
                .await
                .map_err(store_err)?;
            Ok(contacts)
        }

        async fn peek(&self, contact_id: &str) -> Result<Option<ContactFlowState>> {
            let mut conn = self.connection().await?;
            let raw: Option<String> = conn
                .get(self.state_key(contact_id))
                .await
                .map_err(store_err)?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }
    }
}
