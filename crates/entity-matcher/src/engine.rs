//! 匹配引擎
//!
//! 在实体集合上批量评估规则集，支持 source/target 两段式匹配：
//! 先用 from 规则选出源实体，再在剩余实体中用 to 规则选出目标实体。
//!
//! 批大小按规则复杂度自适应收缩；批次之间相互独立，结果按原始下标写回，
//! 无论顺序执行还是并行执行，输出都保持输入顺序。

use crate::cache::CacheStore;
use crate::cached::CachedEvaluator;
use crate::evaluator::Evaluate;
use crate::models::{Entity, Rule};
use matcher_shared::config::{CacheConfig, MatchingConfig, RuleCombinator};
use matcher_shared::observability::metrics::record_matching;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// 单条规则的复杂度：组合节点为子节点之和，属性节点为过滤器数量，每个节点至少为 1
fn node_complexity(rule: &Rule) -> usize {
    match rule {
        Rule::And(children) | Rule::Or(children) => {
            children.iter().map(node_complexity).sum::<usize>().max(1)
        }
        Rule::Attributes(filters) => filters.len().max(1),
        Rule::Empty => 1,
    }
}

/// 规则集复杂度
pub fn rule_complexity(rules: &[Rule]) -> usize {
    rules.iter().map(node_complexity).sum()
}

/// 自适应批大小
///
/// 复杂度超过 10 时减半，超过 20 时取四分之一（均以配置上限为基准），
/// 最终限制在 `[1, entity_count]`。
pub fn batch_size(complexity: usize, max_batch_size: usize, entity_count: usize) -> usize {
    let base = max_batch_size.max(1);
    let size = if complexity > 20 {
        base / 4
    } else if complexity > 10 {
        base / 2
    } else {
        base
    };
    size.clamp(1, entity_count.max(1))
}

/// 两段式匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPair<'a> {
    pub from: Vec<&'a Entity>,
    pub to: Vec<&'a Entity>,
}

/// 匹配引擎
pub struct MatchingEngine {
    evaluator: Arc<dyn Evaluate>,
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(evaluator: Arc<dyn Evaluate>, config: MatchingConfig) -> Self {
        Self { evaluator, config }
    }

    /// 以外部注入的缓存构建带缓存的引擎
    pub fn with_cache(
        cache: Arc<dyn CacheStore<bool>>,
        cache_config: &CacheConfig,
        config: MatchingConfig,
    ) -> Self {
        let evaluator = CachedEvaluator::new(cache, cache_config.key_prefix.clone());
        Self::new(Arc::new(evaluator), config)
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluate> {
        &self.evaluator
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// 当前配置下，给定规则集与实体数量的批大小
    pub fn batch_size_for(&self, rules: &[Rule], entity_count: usize) -> usize {
        batch_size(rule_complexity(rules), self.config.max_batch_size, entity_count)
    }

    /// 实体是否满足规则集（按配置的组合方式）
    fn matches(&self, entity: &Entity, rules: &[Rule]) -> bool {
        match self.config.combinator {
            RuleCombinator::Any => self.evaluator.evaluate_any(entity, rules),
            RuleCombinator::All => self.evaluator.evaluate_all(entity, rules),
        }
    }

    /// 按自适应批大小切分，逐批评估后按下标写回
    fn batched<T>(
        &self,
        items: &[T],
        rules: &[Rule],
        eval_chunk: impl Fn(&[T]) -> Vec<bool>,
    ) -> Vec<bool> {
        let size = self.batch_size_for(rules, items.len());
        let mut flags = vec![false; items.len()];

        for (batch, chunk) in items.chunks(size).enumerate() {
            let offset = batch * size;
            let results = eval_chunk(chunk);
            flags[offset..offset + results.len()].copy_from_slice(&results);
        }
        flags
    }

    /// 单条规则时两种组合方式等价，直接走评估器的批量接口
    fn chunk_flags(&self, chunk: &[Entity], rules: &[Rule]) -> Vec<bool> {
        match rules {
            [rule] => self.evaluator.evaluate_batch(chunk, rule),
            _ => chunk.iter().map(|e| self.matches(e, rules)).collect(),
        }
    }

    fn flags_for(&self, entities: &[Entity], rules: &[Rule]) -> Vec<bool> {
        self.batched(entities, rules, |chunk| self.chunk_flags(chunk, rules))
    }

    fn flags_for_refs(&self, entities: &[&Entity], rules: &[Rule]) -> Vec<bool> {
        self.batched(entities, rules, |chunk| {
            chunk.iter().map(|e| self.matches(e, rules)).collect()
        })
    }

    /// 每个实体是否满足规则集，顺序与输入一致
    pub fn match_flags(&self, entities: &[Entity], rules: &[Rule]) -> Vec<bool> {
        self.flags_for(entities, rules)
    }

    /// 选出满足 from 规则集的实体
    #[instrument(skip_all, fields(entities = entities.len(), rules = rules.len()))]
    pub fn find_matching_from<'a>(
        &self,
        entities: &'a [Entity],
        rules: &[Rule],
    ) -> Vec<&'a Entity> {
        let start = Instant::now();
        let flags = self.flags_for(entities, rules);

        let matched: Vec<&Entity> = entities
            .iter()
            .zip(flags)
            .filter_map(|(entity, hit)| hit.then_some(entity))
            .collect();

        record_matching("find_matching_from", entities.len(), start.elapsed().as_secs_f64());
        debug!(matched = matched.len(), "源实体匹配完成");
        matched
    }

    /// 在 `all_entities - from_entities`（按 ID）中选出满足 to 规则集的实体
    ///
    /// from 集合中的实体即使满足 to 规则也不会出现在结果中。
    #[instrument(
        skip_all,
        fields(from = from_entities.len(), all = all_entities.len(), rules = to_rules.len())
    )]
    pub fn find_matching_to<'a, E: Borrow<Entity>>(
        &self,
        from_entities: &[E],
        to_rules: &[Rule],
        all_entities: &'a [Entity],
    ) -> Vec<&'a Entity> {
        let start = Instant::now();
        let candidates = Self::exclude(from_entities, all_entities.iter());
        let flags = self.flags_for_refs(&candidates, to_rules);

        let matched: Vec<&Entity> = candidates
            .into_iter()
            .zip(flags)
            .filter_map(|(entity, hit)| hit.then_some(entity))
            .collect();

        record_matching("find_matching_to", all_entities.len(), start.elapsed().as_secs_f64());
        debug!(matched = matched.len(), "目标实体匹配完成");
        matched
    }

    /// 完整的 source/target 流程
    pub fn find_matching_pairs<'a>(
        &self,
        entities: &'a [Entity],
        from_rules: &[Rule],
        to_rules: &[Rule],
    ) -> MatchPair<'a> {
        let from = self.find_matching_from(entities, from_rules);
        let to = self.find_matching_to(&from, to_rules, entities);
        MatchPair { from, to }
    }

    fn exclude<'a, E: Borrow<Entity>>(
        from_entities: &[E],
        all_entities: impl Iterator<Item = &'a Entity>,
    ) -> Vec<&'a Entity> {
        let excluded: HashSet<&str> = from_entities
            .iter()
            .map(|e| e.borrow().id.as_str())
            .collect();
        all_entities
            .filter(|e| !excluded.contains(e.id.as_str()))
            .collect()
    }

    // ========================================================================
    // 并行版本
    // ========================================================================

    /// 批次在 tokio 阻塞线程池上并行评估，按批次起始下标写回
    ///
    /// 任务失败（panic）的批次按不匹配处理。
    async fn parallel_flags(
        self: &Arc<Self>,
        entities: Arc<Vec<Entity>>,
        rules: Arc<Vec<Rule>>,
    ) -> Vec<bool> {
        let total = entities.len();
        let size = self.batch_size_for(&rules, total);
        let mut flags = vec![false; total];
        let mut tasks = JoinSet::new();

        for offset in (0..total).step_by(size) {
            let end = (offset + size).min(total);
            let engine = Arc::clone(self);
            let entities = Arc::clone(&entities);
            let rules = Arc::clone(&rules);

            tasks.spawn_blocking(move || {
                let batch = engine.flags_for(&entities[offset..end], &rules);
                (offset, batch)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((offset, batch)) => {
                    flags[offset..offset + batch.len()].copy_from_slice(&batch);
                }
                Err(e) => warn!(error = %e, "批次评估任务失败，按不匹配处理"),
            }
        }
        flags
    }

    /// [`find_matching_from`](Self::find_matching_from) 的并行版本
    pub async fn find_matching_from_parallel(
        self: &Arc<Self>,
        entities: Vec<Entity>,
        rules: Vec<Rule>,
    ) -> Vec<Entity> {
        let start = Instant::now();
        let entities = Arc::new(entities);
        let flags = self.parallel_flags(Arc::clone(&entities), Arc::new(rules)).await;

        let total = entities.len();
        let matched: Vec<Entity> = Arc::unwrap_or_clone(entities)
            .into_iter()
            .zip(flags)
            .filter_map(|(entity, hit)| hit.then_some(entity))
            .collect();

        record_matching("find_matching_from", total, start.elapsed().as_secs_f64());
        matched
    }

    /// [`find_matching_to`](Self::find_matching_to) 的并行版本
    pub async fn find_matching_to_parallel(
        self: &Arc<Self>,
        from_entities: &[Entity],
        to_rules: Vec<Rule>,
        all_entities: Vec<Entity>,
    ) -> Vec<Entity> {
        let start = Instant::now();
        let total = all_entities.len();
        let excluded: HashSet<&str> = from_entities.iter().map(|e| e.id.as_str()).collect();
        let candidates: Vec<Entity> = all_entities
            .into_iter()
            .filter(|e| !excluded.contains(e.id.as_str()))
            .collect();

        let candidates = Arc::new(candidates);
        let flags = self.parallel_flags(Arc::clone(&candidates), Arc::new(to_rules)).await;

        let matched: Vec<Entity> = Arc::unwrap_or_clone(candidates)
            .into_iter()
            .zip(flags)
            .filter_map(|(entity, hit)| hit.then_some(entity))
            .collect();

        record_matching("find_matching_to", total, start.elapsed().as_secs_f64());
        matched
    }
}
