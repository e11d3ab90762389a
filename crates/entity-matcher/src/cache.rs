//! 带 TTL 与容量上限的内存缓存
//!
//! - 过期：读取时惰性检查，另有可选的后台任务周期清理
//! - 容量：超出 `max_items` 时淘汰最早插入的条目（FIFO，不是 LRU）
//! - 统计：启用后维护命中/未命中与键值字节数，每次变更后保持精确
//!
//! 所有状态由一把 `parking_lot::Mutex` 保护，并发调用方看到的是串行化的变更序列。

use async_trait::async_trait;
use matcher_shared::config::CacheConfig;
use matcher_shared::observability::metrics::{
    record_cache_eviction, record_cache_expirations, record_cache_hit, record_cache_miss,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

// ============================================================================
// 时钟
// ============================================================================

/// 时间来源
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// 系统单调时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 可手动推进的时钟，用于测试过期行为
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// 推进时间
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

// ============================================================================
// 存储抽象
// ============================================================================

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub key_count: usize,
    pub key_bytes: usize,
    pub value_bytes: usize,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// 命中率，无访问时为 0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 同步缓存接口
///
/// 所有操作都不返回错误：后端故障应退化为未命中。
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    /// 使用默认 TTL 写入
    fn set(&self, key: &str, value: V);

    /// 使用显式 TTL 写入，`Duration::ZERO` 表示永不过期
    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration);

    fn delete(&self, key: &str) -> bool;

    fn clear(&self);

    /// 统计信息，未启用统计时为 None
    fn stats(&self) -> Option<CacheStats>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 异步缓存接口
///
/// 远程后端（如 Redis）实现该 trait；任何同步 [`CacheStore`] 自动获得实现，语义不变。
#[async_trait]
pub trait AsyncCacheStore<V: Send + 'static>: Send + Sync {
    async fn get(&self, key: &str) -> Option<V>;

    async fn set(&self, key: &str, value: V);

    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration);

    async fn delete(&self, key: &str) -> bool;

    async fn clear(&self);

    async fn stats(&self) -> Option<CacheStats>;
}

#[async_trait]
impl<V, T> AsyncCacheStore<V> for T
where
    V: Send + 'static,
    T: CacheStore<V>,
{
    async fn get(&self, key: &str) -> Option<V> {
        CacheStore::get(self, key)
    }

    async fn set(&self, key: &str, value: V) {
        CacheStore::set(self, key, value)
    }

    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        CacheStore::set_with_ttl(self, key, value, ttl)
    }

    async fn delete(&self, key: &str) -> bool {
        CacheStore::delete(self, key)
    }

    async fn clear(&self) {
        CacheStore::clear(self)
    }

    async fn stats(&self) -> Option<CacheStats> {
        CacheStore::stats(self)
    }
}

// ============================================================================
// TtlCache
// ============================================================================

/// 缓存条目
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// None 表示永不过期
    expires_at: Option<Instant>,
    /// 插入序号，与淘汰队列中的记录对应
    seq: u64,
    key_bytes: usize,
    value_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// 插入顺序队列；删除或覆盖后残留的旧记录通过 seq 识别并跳过
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.stats.key_count = self.entries.len();
        self.stats.key_bytes -= entry.key_bytes;
        self.stats.value_bytes -= entry.value_bytes;
        self.compact_order();
        Some(entry)
    }

    /// 淘汰最早插入的存活条目
    fn evict_oldest(&mut self) -> Option<String> {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = self.entries.get(&key).is_some_and(|e| e.seq == seq);
            if live {
                self.remove(&key);
                self.stats.evictions += 1;
                return Some(key);
            }
        }
        None
    }

    /// 队列中的失效记录过多时整体重建，保证队列长度与条目数同阶
    fn compact_order(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 32 {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }
}

/// TTL + 容量受限的内存缓存
pub struct TtlCache<V> {
    default_ttl: Option<Duration>,
    max_items: usize,
    enable_stats: bool,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<V>>,
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("default_ttl", &self.default_ttl)
            .field("max_items", &self.max_items)
            .field("enable_stats", &self.enable_stats)
            .field("len", &self.inner.lock().entries.len())
            .finish()
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// 创建缓存，`max_items` 为 0 表示不限容量
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 使用指定时钟创建缓存
    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_ttl: config.default_ttl(),
            max_items: config.max_items,
            enable_stats: config.enable_stats,
            sweep_interval: config.sweep_interval(),
            clock,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// 读取，过期条目在此删除并计为未命中
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let result = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                inner.remove(key);
                inner.stats.expirations += 1;
                record_cache_expirations(1);
                trace!(key, "缓存条目已过期");
                None
            }
            None => None,
        };

        if result.is_some() {
            record_cache_hit();
        } else {
            record_cache_miss();
        }
        if self.enable_stats {
            if result.is_some() {
                inner.stats.hits += 1;
            } else {
                inner.stats.misses += 1;
            }
        }

        result
    }

    /// 使用默认 TTL 写入
    pub fn set(&self, key: &str, value: V) {
        self.insert(key, value, self.default_ttl);
    }

    /// 使用显式 TTL 写入，`Duration::ZERO` 表示永不过期
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.insert(key, value, (!ttl.is_zero()).then_some(ttl));
    }

    fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        let (key_bytes, value_bytes) = if self.enable_stats {
            (key.len(), Self::value_bytes(&value))
        } else {
            (0, 0)
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // 覆盖已有键：保留原插入位置，不触发淘汰
        if let Some(entry) = inner.entries.get_mut(key) {
            let old_value_bytes = entry.value_bytes;
            entry.value = value;
            entry.expires_at = expires_at;
            entry.value_bytes = value_bytes;
            inner.stats.value_bytes = inner.stats.value_bytes - old_value_bytes + value_bytes;
            return;
        }

        if self.max_items > 0 && inner.entries.len() >= self.max_items {
            if let Some(evicted) = inner.evict_oldest() {
                record_cache_eviction();
                debug!(key = %evicted, max_items = self.max_items, "缓存已满，淘汰最早插入的条目");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, key.to_string()));
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                seq,
                key_bytes,
                value_bytes,
            },
        );
        inner.stats.key_count = inner.entries.len();
        inner.stats.key_bytes += key_bytes;
        inner.stats.value_bytes += value_bytes;
    }

    /// 删除，返回键是否存在
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// 清空所有条目，命中/未命中计数保留
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let count = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        inner.stats.key_count = 0;
        inner.stats.key_bytes = 0;
        inner.stats.value_bytes = 0;
        info!("已清空 {} 条缓存", count);
    }

    /// 键存在且未过期（不计入命中统计）
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// 当前存储的条目数（包含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.enable_stats.then(|| self.inner.lock().stats.clone())
    }

    /// 清理所有已过期的条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        inner.stats.expirations += expired.len() as u64;

        if !expired.is_empty() {
            record_cache_expirations(expired.len());
        }
        expired.len()
    }

    /// 周期清理间隔
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// 启动后台过期清理任务
    ///
    /// 任务只持有弱引用：缓存被释放后自动退出；句柄 drop 时任务被中止。
    /// 必须在 tokio 运行时内调用。
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "周期清理过期缓存条目");
                }
            }
            debug!("缓存已释放，清理任务退出");
        });

        info!(interval_ms = period.as_millis() as u64, "缓存过期清理任务已启动");
        SweeperHandle { handle }
    }

    fn value_bytes(value: &V) -> usize {
        serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
    }
}

impl<V> CacheStore<V> for TtlCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        TtlCache::get(self, key)
    }

    fn set(&self, key: &str, value: V) {
        TtlCache::set(self, key, value)
    }

    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        TtlCache::set_with_ttl(self, key, value, ttl)
    }

    fn delete(&self, key: &str) -> bool {
        TtlCache::delete(self, key)
    }

    fn clear(&self) {
        TtlCache::clear(self)
    }

    fn stats(&self) -> Option<CacheStats> {
        TtlCache::stats(self)
    }

    fn len(&self) -> usize {
        TtlCache::len(self)
    }
}

/// 后台清理任务句柄，drop 时中止任务
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ttl_secs: u64, max_items: usize) -> CacheConfig {
        CacheConfig {
            default_ttl_secs: ttl_secs,
            max_items,
            enable_stats: true,
            ..Default::default()
        }
    }

    fn manual_cache(ttl_secs: u64, max_items: usize) -> (TtlCache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::with_clock(&config(ttl_secs, max_items), clock.clone());
        (cache, clock)
    }

    // ==================== TTL ====================

    #[test]
    fn test_ttl_round_trip() {
        let (cache, clock) = manual_cache(0, 10);
        cache.set_with_ttl("k", "v".to_string(), Duration::from_secs(1));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k"), None);
        // 惰性过期后条目被删除
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().unwrap().expirations, 1);
    }

    #[test]
    fn test_default_ttl_applies() {
        let (cache, clock) = manual_cache(5, 10);
        cache.set("k", "v".to_string());

        clock.advance(Duration::from_secs(4));
        assert!(cache.get("k").is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_explicit_ttl_overrides_default() {
        let (cache, clock) = manual_cache(5, 10);
        cache.set_with_ttl("short", "v".to_string(), Duration::from_secs(1));
        cache.set_with_ttl("forever", "v".to_string(), Duration::ZERO);

        clock.advance(Duration::from_secs(2));
        assert!(cache.get("short").is_none());

        clock.advance(Duration::from_secs(3600));
        assert!(cache.get("forever").is_some());
    }

    #[test]
    fn test_zero_default_ttl_never_expires() {
        let (cache, clock) = manual_cache(0, 10);
        cache.set("k", "v".to_string());
        clock.advance(Duration::from_secs(86_400));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn test_set_refreshes_expiry() {
        let (cache, clock) = manual_cache(10, 10);
        cache.set("k", "a".to_string());
        clock.advance(Duration::from_secs(8));
        cache.set("k", "b".to_string());
        clock.advance(Duration::from_secs(8));
        assert_eq!(cache.get("k"), Some("b".to_string()));
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = manual_cache(0, 10);
        cache.set_with_ttl("a", "1".to_string(), Duration::from_secs(1));
        cache.set_with_ttl("b", "2".to_string(), Duration::from_secs(10));
        cache.set("c", "3".to_string());

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    // ==================== 容量淘汰 ====================

    #[test]
    fn test_fifo_eviction() {
        let (cache, _) = manual_cache(0, 2);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.set("c", "3".to_string());

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().unwrap().evictions, 1);
    }

    #[test]
    fn test_eviction_ignores_access_recency() {
        let (cache, _) = manual_cache(0, 2);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        // 访问 a 不会改变淘汰顺序
        assert!(cache.get("a").is_some());
        cache.set("c", "3".to_string());

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_overwrite_keeps_insertion_position() {
        let (cache, _) = manual_cache(0, 2);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.set("a", "updated".to_string());
        assert_eq!(cache.len(), 2);

        cache.set("c", "3".to_string());
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_delete_then_reinsert_moves_to_back() {
        let (cache, _) = manual_cache(0, 2);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        assert!(cache.delete("a"));
        cache.set("a", "1".to_string());
        cache.set("c", "3".to_string());

        // b 是最早的存活插入
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_zero_max_items_is_unbounded() {
        let (cache, _) = manual_cache(0, 0);
        for i in 0..500 {
            cache.set(&format!("k{}", i), i.to_string());
        }
        assert_eq!(cache.len(), 500);
    }

    #[test]
    fn test_order_queue_stays_bounded() {
        let (cache, _) = manual_cache(0, 4);
        for i in 0..1_000 {
            let key = format!("k{}", i % 3);
            cache.set(&key, i.to_string());
            cache.delete(&key);
        }
        assert!(cache.inner.lock().order.len() <= 40);
    }

    // ==================== 统计 ====================

    #[test]
    fn test_stats_accounting() {
        let (cache, _) = manual_cache(0, 10);
        cache.set("ab", "xyz".to_string());
        cache.set("c", "q".to_string());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.key_bytes, 3);
        // JSON 编码："xyz" 5 字节，"q" 3 字节
        assert_eq!(stats.value_bytes, 8);

        cache.set("c", "qqq".to_string());
        assert_eq!(cache.stats().unwrap().value_bytes, 10);

        cache.delete("ab");
        let stats = cache.stats().unwrap();
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.key_bytes, 1);
        assert_eq!(stats.value_bytes, 5);

        assert!(cache.get("c").is_some());
        assert!(cache.get("ab").is_none());
        let stats = cache.stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);

        cache.clear();
        let stats = cache.stats().unwrap();
        assert_eq!((stats.key_count, stats.key_bytes, stats.value_bytes), (0, 0, 0));
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_stats_disabled() {
        let cache: TtlCache<bool> = TtlCache::new(&CacheConfig::default());
        cache.set("k", true);
        assert_eq!(cache.get("k"), Some(true));
        assert!(cache.stats().is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let cache: Arc<TtlCache<bool>> = Arc::new(TtlCache::new(&config(0, 100)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        cache.set(&format!("t{}-{}", t, i), i % 2 == 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.stats().unwrap();
        assert_eq!(cache.len(), 100);
        assert_eq!(stats.key_count, 100);
        assert_eq!(stats.evictions, 700);
    }

    // ==================== 异步接口与清理任务 ====================

    #[tokio::test]
    async fn test_async_store_adapter() {
        let cache: TtlCache<bool> = TtlCache::new(&config(60, 10));
        AsyncCacheStore::set(&cache, "k", true).await;
        assert_eq!(AsyncCacheStore::get(&cache, "k").await, Some(true));
        assert!(AsyncCacheStore::delete(&cache, "k").await);
        assert_eq!(AsyncCacheStore::get(&cache, "k").await, None);
        assert_eq!(AsyncCacheStore::stats(&cache).await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let cfg = CacheConfig {
            default_ttl_secs: 0,
            max_sweep_interval_secs: 1,
            ..config(0, 10)
        };
        let cache: Arc<TtlCache<bool>> = Arc::new(TtlCache::with_clock(&cfg, clock.clone()));
        cache.set_with_ttl("k", true, Duration::from_millis(10));

        let _sweeper = cache.spawn_sweeper();
        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        // 清理任务直接删除条目，未经过 get
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().unwrap().misses, 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_cache_dropped() {
        let cfg = CacheConfig {
            max_sweep_interval_secs: 1,
            ..config(0, 10)
        };
        let cache: Arc<TtlCache<bool>> = Arc::new(TtlCache::new(&cfg));
        let sweeper = cache.spawn_sweeper();
        drop(cache);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(sweeper.is_finished());
    }
}
