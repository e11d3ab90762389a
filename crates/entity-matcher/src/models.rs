//! 匹配引擎领域模型
//!
//! 规则是递归组合的布尔表达式：AND / OR 组合子、属性过滤叶子节点，以及空规则。
//! JSON 形式兼容 `{"and": [...]}`、`{"or": [...]}`、`{"attributes": {...}}`
//! 以及把属性过滤直接写在顶层的旧格式。

use crate::error::{MatchError, Result};
use crate::operators::Operator;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// 待匹配的实体
///
/// `attributes` 由外部校验步骤产出；`validated` 表示类型已符合 schema，
/// 评估器只比较值，不做任何类型转换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub validated: bool,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: HashMap::new(),
            validated: false,
        }
    }

    /// 设置属性（构建器风格）
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// 标记为已校验
    pub fn validated(mut self) -> Self {
        self.validated = true;
        self
    }

    /// 获取属性值，null 视为缺失
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

/// 单个属性上的过滤条件
///
/// 同一过滤器内的多个操作符隐式 AND。包含未知操作符的过滤器整体作废（`Rejected`），
/// 评估时恒为 false。
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Valid(BTreeMap<Operator, Value>),
    Rejected { raw: Value, reason: String },
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::Valid(BTreeMap::new())
    }

    /// 严格解析：任何未知操作符都返回错误
    pub fn parse(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            MatchError::InvalidRule(format!("过滤条件必须是对象: {}", value))
        })?;

        let mut conditions = BTreeMap::new();
        for (key, target) in map {
            let op: Operator = key.parse()?;
            conditions.insert(op, target.clone());
        }
        Ok(Self::Valid(conditions))
    }

    /// 宽松解析：无法识别的过滤器被保留为 `Rejected`，不返回错误
    pub fn from_value_lenient(value: &Value) -> Self {
        match Self::parse(value) {
            Ok(filter) => filter,
            Err(e) => Self::Rejected {
                raw: value.clone(),
                reason: e.to_string(),
            },
        }
    }

    /// 追加一个操作符条件，已作废的过滤器保持作废
    pub fn with(mut self, op: Operator, value: impl Into<Value>) -> Self {
        if let Self::Valid(conditions) = &mut self {
            conditions.insert(op, value.into());
        }
        self
    }

    pub fn eq(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Ne, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Gt, value)
    }

    pub fn gte(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Gte, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Lt, value)
    }

    pub fn lte(self, value: impl Into<Value>) -> Self {
        self.with(Operator::Lte, value)
    }

    pub fn is_in(self, value: impl Into<Value>) -> Self {
        self.with(Operator::In, value)
    }

    pub fn not_in(self, value: impl Into<Value>) -> Self {
        self.with(Operator::NotIn, value)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// 操作符条件数量，作废的过滤器按 0 计
    pub fn len(&self) -> usize {
        match self {
            Self::Valid(conditions) => conditions.len(),
            Self::Rejected { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Valid(conditions) => Value::Object(
                conditions
                    .iter()
                    .map(|(op, v)| (op.as_str().to_string(), v.clone()))
                    .collect(),
            ),
            Self::Rejected { raw, .. } => raw.clone(),
        }
    }
}

/// 规则节点
///
/// 每个节点恰好是四种形态之一，JSON 中的优先级在解析时确定。
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Rule {
    /// 所有子规则都必须满足，空列表恒为 true
    And(Vec<Rule>),
    /// 至少一个子规则满足，空列表恒为 false
    Or(Vec<Rule>),
    /// 每个属性过滤都必须满足
    Attributes(BTreeMap<String, Filter>),
    /// 无任何条件的空规则，不匹配任何实体
    #[default]
    Empty,
}

const AND_KEY: &str = "and";
const OR_KEY: &str = "or";
const ATTRIBUTES_KEY: &str = "attributes";

impl Rule {
    pub fn and(children: Vec<Rule>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<Rule>) -> Self {
        Self::Or(children)
    }

    /// 单属性规则
    pub fn attribute(name: impl Into<String>, filter: Filter) -> Self {
        Self::Attributes(BTreeMap::from([(name.into(), filter)]))
    }

    /// 多属性规则，无属性时退化为空规则
    pub fn attributes<I, K>(filters: I) -> Self
    where
        I: IntoIterator<Item = (K, Filter)>,
        K: Into<String>,
    {
        let map: BTreeMap<String, Filter> =
            filters.into_iter().map(|(k, f)| (k.into(), f)).collect();
        if map.is_empty() {
            Self::Empty
        } else {
            Self::Attributes(map)
        }
    }

    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    /// 从 JSON 值解析
    ///
    /// 优先级：非空 `and` > 非空 `or` > 属性过滤（`attributes` 与顶层旧格式合并，
    /// `attributes` 中的同名项优先）> 空 `and` > 空 `or` > 空规则。
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| MatchError::InvalidRule(format!("规则节点必须是对象: {}", value)))?;

        let and = Self::parse_children(obj, AND_KEY)?;
        let or = Self::parse_children(obj, OR_KEY)?;

        if let Some(children) = and.as_ref().filter(|c| !c.is_empty()) {
            return Ok(Self::And(children.clone()));
        }
        if let Some(children) = or.as_ref().filter(|c| !c.is_empty()) {
            return Ok(Self::Or(children.clone()));
        }

        let filters = Self::parse_filters(obj)?;
        if !filters.is_empty() {
            return Ok(Self::Attributes(filters));
        }

        if and.is_some() {
            return Ok(Self::And(Vec::new()));
        }
        if or.is_some() {
            return Ok(Self::Or(Vec::new()));
        }
        Ok(Self::Empty)
    }

    fn parse_children(obj: &Map<String, Value>, key: &str) -> Result<Option<Vec<Rule>>> {
        let Some(raw) = obj.get(key) else {
            return Ok(None);
        };
        let items = raw
            .as_array()
            .ok_or_else(|| MatchError::InvalidRule(format!("`{}` 必须是数组", key)))?;
        items
            .iter()
            .map(Self::from_value)
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn parse_filters(obj: &Map<String, Value>) -> Result<BTreeMap<String, Filter>> {
        let mut filters = BTreeMap::new();

        for (name, raw) in obj {
            if name == AND_KEY || name == OR_KEY || name == ATTRIBUTES_KEY {
                continue;
            }
            filters.insert(name.clone(), Filter::from_value_lenient(raw));
        }

        if let Some(raw) = obj.get(ATTRIBUTES_KEY) {
            let attrs = raw.as_object().ok_or_else(|| {
                MatchError::InvalidRule(format!("`{}` 必须是对象", ATTRIBUTES_KEY))
            })?;
            for (name, raw) in attrs {
                filters.insert(name.clone(), Filter::from_value_lenient(raw));
            }
        }

        Ok(filters)
    }

    /// 转换为 JSON 值（标准形式，属性过滤统一写在 `attributes` 下）
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::And(children) => {
                obj.insert(
                    AND_KEY.to_string(),
                    Value::Array(children.iter().map(Rule::to_value).collect()),
                );
            }
            Self::Or(children) => {
                obj.insert(
                    OR_KEY.to_string(),
                    Value::Array(children.iter().map(Rule::to_value).collect()),
                );
            }
            Self::Attributes(filters) => {
                obj.insert(
                    ATTRIBUTES_KEY.to_string(),
                    Value::Object(
                        filters
                            .iter()
                            .map(|(name, f)| (name.clone(), f.to_value()))
                            .collect(),
                    ),
                );
            }
            Self::Empty => {}
        }
        Value::Object(obj)
    }

    pub fn is_empty_rule(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Rule::from_value(&value).map_err(D::Error::custom)
    }
}
