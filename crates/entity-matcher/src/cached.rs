//! 带缓存的规则评估器
//!
//! 以 `前缀 + 实体 ID + ":" + 规则标准形式` 作为键缓存评估结果。
//! 标准形式递归排序对象键与 AND/OR 子节点，构造顺序不同但逻辑相同的规则得到同一个键；
//! 整数值的浮点数（`5.0`）按整数（`5`）写出。
//!
//! 键只包含实体 ID，不包含属性值：同一 ID 的实体属性变化后，旧结果在 TTL 内仍会命中，
//! 调用方需在实体变更时调用 [`CachedEvaluator::clear`] 或缩短 TTL。

use crate::cache::{CacheStats, CacheStore};
use crate::evaluator::{Evaluate, RuleEvaluator};
use crate::models::{Entity, Filter, Rule};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 规则的标准序列化形式
pub fn canonical_rule(rule: &Rule) -> String {
    let mut out = String::new();
    write_rule(rule, &mut out);
    out
}

fn write_rule(rule: &Rule, out: &mut String) {
    match rule {
        Rule::And(children) => write_group("and", children, out),
        Rule::Or(children) => write_group("or", children, out),
        Rule::Attributes(filters) => {
            out.push_str("{\"attributes\":{");
            // BTreeMap 已按属性名排序
            for (i, (name, filter)) in filters.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_filter(filter, out);
            }
            out.push_str("}}");
        }
        Rule::Empty => out.push_str("{}"),
    }
}

fn write_group(key: &str, children: &[Rule], out: &mut String) {
    let mut parts: Vec<String> = children.iter().map(canonical_rule).collect();
    parts.sort_unstable();

    out.push_str("{\"");
    out.push_str(key);
    out.push_str("\":[");
    out.push_str(&parts.join(","));
    out.push_str("]}");
}

fn write_filter(filter: &Filter, out: &mut String) {
    match filter {
        Filter::Valid(conditions) => {
            let mut ops: Vec<(&'static str, &Value)> =
                conditions.iter().map(|(op, v)| (op.as_str(), v)).collect();
            ops.sort_unstable_by_key(|(name, _)| *name);

            out.push('{');
            for (i, (name, value)) in ops.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_value(value, out);
            }
            out.push('}');
        }
        // 作废的过滤器保留原始内容，避免不同的非法过滤器共用同一个键
        Filter::Rejected { raw, .. } => {
            out.push_str("{\"$rejected\":");
            write_value(raw, out);
            out.push('}');
        }
    }
}

/// 写出 JSON 值，对象键显式排序，不依赖 serde_json 的 Map 实现
fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            // 整数值浮点按整数写出，与评估时 5 == 5.0 一致
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::from(s).to_string());
}

/// 带缓存的评估器
///
/// 缓存条目完全由 [`CacheStore`] 持有，评估器本身不保存任何结果副本。
pub struct CachedEvaluator {
    inner: Arc<dyn Evaluate>,
    cache: Arc<dyn CacheStore<bool>>,
    key_prefix: String,
    /// 显式 TTL，None 时使用缓存的默认 TTL
    ttl: Option<Duration>,
}

impl CachedEvaluator {
    /// 以默认规则评估器和指定缓存创建
    pub fn new(cache: Arc<dyn CacheStore<bool>>, key_prefix: impl Into<String>) -> Self {
        Self::wrap(Arc::new(RuleEvaluator::new()), cache, key_prefix)
    }

    /// 包装任意评估器
    pub fn wrap(
        inner: Arc<dyn Evaluate>,
        cache: Arc<dyn CacheStore<bool>>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            cache,
            key_prefix: key_prefix.into(),
            ttl: None,
        }
    }

    /// 为写入的结果指定 TTL，`Duration::ZERO` 表示永不过期
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// 计算缓存键
    pub fn cache_key(&self, entity: &Entity, rule: &Rule) -> String {
        self.key_for(&entity.id, &canonical_rule(rule))
    }

    fn key_for(&self, entity_id: &str, canonical: &str) -> String {
        format!("{}{}:{}", self.key_prefix, entity_id, canonical)
    }

    fn store(&self, key: &str, matched: bool) {
        match self.ttl {
            Some(ttl) => self.cache.set_with_ttl(key, matched, ttl),
            None => self.cache.set(key, matched),
        }
    }

    /// 按已计算的键读取或评估
    fn resolve(&self, key: &str, entity: &Entity, rule: &Rule) -> bool {
        if let Some(matched) = self.cache.get(key) {
            return matched;
        }
        let matched = self.inner.evaluate(entity, rule);
        self.store(key, matched);
        matched
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }
}

impl Evaluate for CachedEvaluator {
    fn evaluate(&self, entity: &Entity, rule: &Rule) -> bool {
        let key = self.cache_key(entity, rule);
        self.resolve(&key, entity, rule)
    }

    /// 先划分已缓存与待评估两部分，再按原顺序合并
    fn evaluate_batch(&self, entities: &[Entity], rule: &Rule) -> Vec<bool> {
        let canonical = canonical_rule(rule);
        let mut results: Vec<Option<bool>> = Vec::with_capacity(entities.len());
        let mut pending: Vec<(usize, String)> = Vec::new();

        for (i, entity) in entities.iter().enumerate() {
            let key = self.key_for(&entity.id, &canonical);
            match self.cache.get(&key) {
                Some(matched) => results.push(Some(matched)),
                None => {
                    results.push(None);
                    pending.push((i, key));
                }
            }
        }

        debug!(
            total = entities.len(),
            cached = entities.len() - pending.len(),
            pending = pending.len(),
            "批量评估缓存划分"
        );

        for (i, key) in pending {
            let matched = self.inner.evaluate(&entities[i], rule);
            self.store(&key, matched);
            results[i] = Some(matched);
        }

        results.into_iter().map(|r| r.unwrap_or(false)).collect()
    }

    fn clear(&self) {
        self.cache.clear();
        self.inner.clear();
        info!("规则评估缓存已清空");
    }
}
