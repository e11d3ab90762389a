//! 界面条件到规则的映射
//!
//! 前端以 `(属性, 条件类型, 值)` 的形式描述筛选条件，这里把它们翻译为规则树。

use crate::error::{MatchError, Result};
use crate::models::{Filter, Rule};
use crate::operators::Operator;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

/// 条件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionKind {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    In,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Is => "IS",
            Self::IsNot => "IS_NOT",
            Self::Contains => "CONTAINS",
            Self::DoesNotContain => "DOES_NOT_CONTAIN",
            Self::In => "IN",
        }
    }

    /// 对应的规则操作符
    pub fn operator(&self) -> Operator {
        match self {
            Self::Is => Operator::Eq,
            Self::IsNot => Operator::Ne,
            Self::Contains | Self::In => Operator::In,
            Self::DoesNotContain => Operator::NotIn,
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionKind {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IS" => Ok(Self::Is),
            "IS_NOT" => Ok(Self::IsNot),
            "CONTAINS" => Ok(Self::Contains),
            "DOES_NOT_CONTAIN" => Ok(Self::DoesNotContain),
            "IN" => Ok(Self::In),
            _ => Err(MatchError::UnknownCondition(s.to_string())),
        }
    }
}

/// 单个界面条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiCondition {
    pub attribute: String,
    #[serde(alias = "type")]
    pub kind: ConditionKind,
    pub value: Value,
}

impl UiCondition {
    pub fn new(attribute: impl Into<String>, kind: ConditionKind, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            kind,
            value: value.into(),
        }
    }

    /// 从字符串形式的条件类型构建
    pub fn parse(
        attribute: impl Into<String>,
        kind: &str,
        value: impl Into<Value>,
    ) -> Result<Self> {
        Ok(Self::new(attribute, kind.parse()?, value))
    }

    /// 转换为过滤器
    pub fn to_filter(&self) -> Filter {
        let operator = self.kind.operator();
        let target = if operator.requires_array() {
            wrap_array(&self.value)
        } else {
            coerce_numeric(&self.value)
        };
        Filter::new().with(operator, target)
    }

    /// 转换为单属性规则
    pub fn to_rule(&self) -> Rule {
        Rule::attribute(self.attribute.clone(), self.to_filter())
    }
}

/// 每个条件生成一条规则，顺序与输入一致
pub fn conditions_to_rules(conditions: &[UiCondition]) -> Vec<Rule> {
    conditions.iter().map(UiCondition::to_rule).collect()
}

/// 形如数字的字符串转为数字，其余原样保留
fn coerce_numeric(value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| value.clone())
}

fn wrap_array(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        scalar => Value::Array(vec![scalar.clone()]),
    }
}
