//! 指标模块
//!
//! 基于 metrics facade 记录规则评估与缓存指标。
//! recorder 由宿主进程安装（如 Prometheus exporter），未安装时所有记录均为空操作。

/// 注册指标描述
pub fn describe_metrics() {
    metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    metrics::describe_counter!("rule_cache_hits_total", "Total number of rule cache hits");
    metrics::describe_counter!("rule_cache_misses_total", "Total number of rule cache misses");
    metrics::describe_counter!(
        "rule_cache_evictions_total",
        "Total number of capacity evictions from the rule cache"
    );
    metrics::describe_counter!(
        "rule_cache_expirations_total",
        "Total number of expired rule cache entries removed"
    );
    metrics::describe_histogram!(
        "matching_duration_seconds",
        "Entity matching duration in seconds"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录规则评估
#[inline]
pub fn record_rule_evaluation(matched: bool) {
    metrics::counter!(
        "rule_evaluations_total",
        "result" => if matched { "matched" } else { "not_matched" }
    )
    .increment(1);
}

/// 记录缓存命中
#[inline]
pub fn record_cache_hit() {
    metrics::counter!("rule_cache_hits_total").increment(1);
}

/// 记录缓存未命中
#[inline]
pub fn record_cache_miss() {
    metrics::counter!("rule_cache_misses_total").increment(1);
}

/// 记录容量淘汰
#[inline]
pub fn record_cache_eviction() {
    metrics::counter!("rule_cache_evictions_total").increment(1);
}

/// 记录过期清理
#[inline]
pub fn record_cache_expirations(count: usize) {
    metrics::counter!("rule_cache_expirations_total").increment(count as u64);
}

/// 记录一次匹配操作
#[inline]
pub fn record_matching(operation: &'static str, entity_count: usize, duration_secs: f64) {
    metrics::histogram!(
        "matching_duration_seconds",
        "operation" => operation,
        "size" => size_bucket(entity_count)
    )
    .record(duration_secs);
}

/// 实体数量分桶，避免标签基数过高
fn size_bucket(count: usize) -> &'static str {
    match count {
        0..=100 => "small",
        101..=10_000 => "medium",
        _ => "large",
    }
}
