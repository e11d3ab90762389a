//! 规则评估器
//!
//! 纯函数式地判断实体是否满足规则：AND/OR 短路组合、属性过滤逐项比较。
//! 任何非法输入（未知操作符、类型不匹配、属性缺失、数组操作符的非数组目标）
//! 都只会让对应节点评估为 false，永不 panic 或返回错误。

use crate::models::{Entity, Filter, Rule};
use crate::operators::Operator;
use matcher_shared::observability::metrics::record_rule_evaluation;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::trace;

/// 评估能力抽象
///
/// 基础评估器与带缓存的评估器都实现该 trait，匹配引擎只依赖它。
pub trait Evaluate: Send + Sync {
    /// 评估单个实体与单条规则
    fn evaluate(&self, entity: &Entity, rule: &Rule) -> bool;

    /// 批量评估，输出与输入一一对应且保持顺序
    fn evaluate_batch(&self, entities: &[Entity], rule: &Rule) -> Vec<bool> {
        entities.iter().map(|e| self.evaluate(e, rule)).collect()
    }

    /// 实体满足任一规则
    fn evaluate_any(&self, entity: &Entity, rules: &[Rule]) -> bool {
        rules.iter().any(|r| self.evaluate(entity, r))
    }

    /// 实体满足全部规则，空规则列表不匹配
    fn evaluate_all(&self, entity: &Entity, rules: &[Rule]) -> bool {
        !rules.is_empty() && rules.iter().all(|r| self.evaluate(entity, r))
    }

    /// 清空内部状态（无状态实现为空操作）
    fn clear(&self) {}
}

/// 条件评估器
///
/// 实现单个 `(属性值, 操作符, 目标值)` 三元组的比较语义。
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `field_value` - 实体上的属性值，缺失时为 None
    /// * `operator` - 操作符
    /// * `target` - 规则中定义的目标值
    pub fn evaluate(field_value: Option<&Value>, operator: Operator, target: &Value) -> bool {
        // 属性缺失时所有操作符都不满足，包括 ne 和 notIn
        let Some(field) = field_value else {
            return false;
        };

        match operator {
            Operator::Eq => Self::eq(field, target),
            Operator::Ne => !Self::eq(field, target),
            Operator::Gt => Self::compare(field, target, |a, b| a > b),
            Operator::Gte => Self::compare(field, target, |a, b| a >= b),
            Operator::Lt => Self::compare(field, target, |a, b| a < b),
            Operator::Lte => Self::compare(field, target, |a, b| a <= b),
            Operator::In => Self::in_list(field, target).unwrap_or(false),
            Operator::NotIn => Self::in_list(field, target).is_some_and(|found| !found),
        }
    }

    /// 评估整个过滤器：所有操作符都必须满足
    pub fn evaluate_filter(field_value: Option<&Value>, filter: &Filter) -> bool {
        match filter {
            Filter::Valid(conditions) => conditions
                .iter()
                .all(|(op, target)| Self::evaluate(field_value, *op, target)),
            Filter::Rejected { reason, .. } => {
                trace!(reason = %reason, "过滤器已作废，按不匹配处理");
                false
            }
        }
    }

    /// 相等比较：目标为数组时表示成员关系
    fn eq(field: &Value, target: &Value) -> bool {
        match target {
            Value::Array(items) => items.iter().any(|item| Self::strict_eq(field, item)),
            _ => Self::strict_eq(field, target),
        }
    }

    /// 严格相等：不做跨类型转换，数值按数值比较（100 与 100.0 相等），不带容差
    fn strict_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                    return x == y;
                }
                if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                    return x == y;
                }
                match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    /// 数值比较，两侧都必须是数字
    fn compare<F>(field: &Value, target: &Value, cmp: F) -> bool
    where
        F: Fn(f64, f64) -> bool,
    {
        match (Self::as_f64(field), Self::as_f64(target)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => {
                trace!(
                    field_type = Self::type_name(field),
                    target_type = Self::type_name(target),
                    "数值比较类型不匹配"
                );
                false
            }
        }
    }

    /// 列表包含检查
    ///
    /// 目标不是数组时返回 None（in/notIn 都不满足）；
    /// 属性为数组时检查交集是否非空，否则检查成员关系。
    fn in_list(field: &Value, target: &Value) -> Option<bool> {
        let Value::Array(items) = target else {
            trace!(target_type = Self::type_name(target), "in/notIn 目标必须是数组");
            return None;
        };

        let found = match field {
            Value::Array(values) => values
                .iter()
                .any(|v| items.iter().any(|item| Self::strict_eq(v, item))),
            _ => items.iter().any(|item| Self::strict_eq(field, item)),
        };
        Some(found)
    }

    fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// 获取值的类型名称
    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

/// 评估报告（含追踪信息）
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub entity_id: String,
    pub matched: bool,
    pub trace: Vec<String>,
    pub evaluation_time_us: u64,
}

/// 评估追踪记录器，关闭时不分配任何内存
struct Tracer {
    enabled: bool,
    path: Vec<String>,
    lines: Vec<String>,
}

impl Tracer {
    fn disabled() -> Self {
        Self {
            enabled: false,
            path: Vec::new(),
            lines: Vec::new(),
        }
    }

    fn enabled() -> Self {
        Self {
            enabled: true,
            path: vec!["root".to_string()],
            lines: Vec::new(),
        }
    }

    fn enter(&mut self, segment: impl FnOnce() -> String) {
        if self.enabled {
            self.path.push(segment());
        }
    }

    fn leave(&mut self) {
        if self.enabled {
            self.path.pop();
        }
    }

    fn record(&mut self, message: impl FnOnce() -> String) {
        if self.enabled {
            let line = format!("{}: {}", self.path.join("."), message());
            self.lines.push(line);
        }
    }
}

/// 规则评估器
///
/// 无状态，可在线程间自由共享。
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// 评估并返回逐节点追踪
    pub fn explain(&self, entity: &Entity, rule: &Rule) -> EvaluationReport {
        let start = Instant::now();
        let mut tracer = Tracer::enabled();
        let matched = self.evaluate_node(entity, rule, &mut tracer);

        EvaluationReport {
            entity_id: entity.id.clone(),
            matched,
            trace: tracer.lines,
            evaluation_time_us: start.elapsed().as_micros() as u64,
        }
    }

    /// 递归评估规则节点
    fn evaluate_node(&self, entity: &Entity, rule: &Rule, tracer: &mut Tracer) -> bool {
        match rule {
            Rule::And(children) => {
                tracer.record(|| format!("开始评估 AND 组 (共 {} 个子节点)", children.len()));
                for (i, child) in children.iter().enumerate() {
                    tracer.enter(|| format!("and[{}]", i));
                    let matched = self.evaluate_node(entity, child, tracer);
                    tracer.leave();

                    if !matched {
                        tracer.record(|| format!("AND 短路 - 子节点 {} 不匹配", i));
                        return false;
                    }
                }
                tracer.record(|| "AND 组全部匹配".to_string());
                true
            }
            Rule::Or(children) => {
                tracer.record(|| format!("开始评估 OR 组 (共 {} 个子节点)", children.len()));
                for (i, child) in children.iter().enumerate() {
                    tracer.enter(|| format!("or[{}]", i));
                    let matched = self.evaluate_node(entity, child, tracer);
                    tracer.leave();

                    if matched {
                        tracer.record(|| format!("OR 短路 - 子节点 {} 匹配", i));
                        return true;
                    }
                }
                tracer.record(|| "OR 组无匹配".to_string());
                false
            }
            Rule::Attributes(filters) => self.evaluate_attributes(entity, filters, tracer),
            Rule::Empty => {
                tracer.record(|| "空规则 => NOT_MATCHED".to_string());
                false
            }
        }
    }

    /// 评估属性节点：每个属性过滤都必须满足
    fn evaluate_attributes(
        &self,
        entity: &Entity,
        filters: &BTreeMap<String, Filter>,
        tracer: &mut Tracer,
    ) -> bool {
        for (name, filter) in filters {
            let value = entity.attribute(name);
            let matched = ConditionEvaluator::evaluate_filter(value, filter);

            tracer.record(|| {
                format!(
                    "{} {} (实际值 {}) => {}",
                    name,
                    filter.to_value(),
                    value.map(Value::to_string).unwrap_or_else(|| "<缺失>".to_string()),
                    if matched { "MATCHED" } else { "NOT_MATCHED" }
                )
            });

            if !matched {
                return false;
            }
        }
        true
    }
}

impl Evaluate for RuleEvaluator {
    fn evaluate(&self, entity: &Entity, rule: &Rule) -> bool {
        let matched = self.evaluate_node(entity, rule, &mut Tracer::disabled());
        record_rule_evaluation(matched);
        matched
    }
}
