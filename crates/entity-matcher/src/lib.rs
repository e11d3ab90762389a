//! 实体规则匹配引擎
//!
//! 对结构化实体评估 JSON 规则树，支持：
//! - AND/OR/属性过滤组成的规则树和 8 种比较操作符
//! - 失败即不匹配的评估语义（非法输入永不报错）
//! - 带 TTL 与容量上限的结果缓存
//! - 按规则复杂度自适应分批的 source/target 批量匹配
//! - 实体 schema 校验与界面条件映射

pub mod cache;
pub mod cached;
pub mod condition;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod operators;
pub mod schema;

pub use cache::{
    AsyncCacheStore, CacheStats, CacheStore, Clock, ManualClock, SweeperHandle, SystemClock,
    TtlCache,
};
pub use cached::{CachedEvaluator, canonical_rule};
pub use condition::{ConditionKind, UiCondition, conditions_to_rules};
pub use engine::{MatchPair, MatchingEngine, batch_size, rule_complexity};
pub use error::{MatchError, Result};
pub use evaluator::{ConditionEvaluator, Evaluate, EvaluationReport, RuleEvaluator};
pub use models::{Entity, Filter, Rule};
pub use operators::Operator;
pub use schema::{
    AsyncValidator, AttributeKind, AttributeSchema, EntitySchema, RawEntity, ValidationError,
};
