//! 实体校验
//!
//! 评估器假设属性类型已经正确，这里是产出 `validated = true` 实体的唯一入口。
//! 校验顺序：必填 → 类型 → 范围 → 正则 → 枚举 → 自定义校验。

use crate::models::Entity;
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("缺少必填属性: {attribute}")]
    Required { attribute: String },

    #[error("属性 {attribute} 类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch {
        attribute: String,
        expected: String,
        actual: &'static str,
    },

    #[error("属性 {attribute} 超出范围: {actual} 不在 [{min:?}, {max:?}] 内")]
    OutOfRange {
        attribute: String,
        min: Option<f64>,
        max: Option<f64>,
        actual: f64,
    },

    #[error("属性 {attribute} 不匹配格式 {pattern}")]
    PatternMismatch { attribute: String, pattern: String },

    #[error("属性 {attribute} 的值 {value} 不在允许列表中")]
    NotAllowed { attribute: String, value: Value },

    #[error("属性 {attribute} 未通过自定义校验")]
    CustomRejected { attribute: String },

    #[error("属性 {attribute} 的正则无效: {reason}")]
    InvalidPattern { attribute: String, reason: String },
}

impl ValidationError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Required { .. } => "REQUIRED",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::PatternMismatch { .. } => "PATTERN_MISMATCH",
            Self::NotAllowed { .. } => "NOT_ALLOWED",
            Self::CustomRejected { .. } => "CUSTOM_REJECTED",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
        }
    }

    pub fn attribute(&self) -> &str {
        match self {
            Self::Required { attribute }
            | Self::TypeMismatch { attribute, .. }
            | Self::OutOfRange { attribute, .. }
            | Self::PatternMismatch { attribute, .. }
            | Self::NotAllowed { attribute, .. }
            | Self::CustomRejected { attribute }
            | Self::InvalidPattern { attribute, .. } => attribute,
        }
    }
}

/// 未经校验的原始实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl RawEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// 属性类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    String,
    Number,
    Boolean,
    Array(Box<AttributeKind>),
}

impl AttributeKind {
    pub fn array_of(elem: AttributeKind) -> Self {
        Self::Array(Box::new(elem))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_)) => true,
            (Self::Array(elem), Value::Array(items)) => items.iter().all(|v| elem.matches(v)),
            _ => false,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Array(elem) => write!(f, "array<{}>", elem),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 同步自定义校验函数
pub type CustomValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// 异步自定义校验
///
/// 用于需要 I/O 的校验（如查询外部字典），返回 false 即拒绝。
#[async_trait]
pub trait AsyncValidator: Send + Sync {
    async fn validate(&self, attribute: &str, value: &Value) -> bool;
}

/// 单个属性的约束
#[derive(Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub kind: AttributeKind,
    pub required: bool,
    /// 数字按数值、字符串和数组按长度比较
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
    pub allowed: Vec<Value>,
    pub validator: Option<CustomValidator>,
}

impl fmt::Debug for AttributeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSchema")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("allowed", &self.allowed)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            min: None,
            max: None,
            pattern: None,
            allowed: Vec::new(),
            validator: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self, ValidationError> {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
            attribute: self.name.clone(),
            reason: e.to_string(),
        })?;
        self.pattern = Some(regex);
        Ok(self)
    }

    pub fn allowed(mut self, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn validator(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    /// 校验单个已存在的值
    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        if !self.kind.matches(value) {
            return Err(ValidationError::TypeMismatch {
                attribute: self.name.clone(),
                expected: self.kind.to_string(),
                actual: json_type(value),
            });
        }

        if let Some(actual) = measure(value) {
            let below = self.min.is_some_and(|min| actual < min);
            let above = self.max.is_some_and(|max| actual > max);
            if below || above {
                return Err(ValidationError::OutOfRange {
                    attribute: self.name.clone(),
                    min: self.min,
                    max: self.max,
                    actual,
                });
            }
        }

        if let (Some(regex), Value::String(s)) = (&self.pattern, value)
            && !regex.is_match(s)
        {
            return Err(ValidationError::PatternMismatch {
                attribute: self.name.clone(),
                pattern: regex.as_str().to_string(),
            });
        }

        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            return Err(ValidationError::NotAllowed {
                attribute: self.name.clone(),
                value: value.clone(),
            });
        }

        if let Some(validator) = &self.validator
            && !validator(value)
        {
            return Err(ValidationError::CustomRejected {
                attribute: self.name.clone(),
            });
        }

        Ok(())
    }
}

/// 范围校验的度量：数字取值，字符串取字符数，数组取长度
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

/// 实体 schema
#[derive(Clone, Default)]
pub struct EntitySchema {
    attributes: Vec<AttributeSchema>,
    async_validators: Vec<(String, Arc<dyn AsyncValidator>)>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.push(schema);
        self
    }

    pub fn async_validator(
        mut self,
        attribute: impl Into<String>,
        validator: Arc<dyn AsyncValidator>,
    ) -> Self {
        self.async_validators.push((attribute.into(), validator));
        self
    }

    pub fn attributes(&self) -> &[AttributeSchema] {
        &self.attributes
    }

    /// 同步校验，成功后返回 `validated = true` 的实体
    ///
    /// schema 未声明的属性原样保留；`null` 视为缺失。
    pub fn validate(&self, raw: RawEntity) -> Result<Entity, ValidationError> {
        for schema in &self.attributes {
            let result = match raw.attributes.get(&schema.name).filter(|v| !v.is_null()) {
                Some(value) => schema.check(value),
                None if schema.required => Err(ValidationError::Required {
                    attribute: schema.name.clone(),
                }),
                None => Ok(()),
            };
            result.inspect_err(|e| {
                debug!(entity_id = %raw.id, attribute = %schema.name, code = e.code(), "实体校验失败");
            })?;
        }

        Ok(Entity {
            id: raw.id,
            name: raw.name,
            attributes: raw.attributes,
            validated: true,
        })
    }

    /// 先执行同步校验，再并发执行异步校验；按声明顺序报告第一个失败
    pub async fn validate_async(&self, raw: RawEntity) -> Result<Entity, ValidationError> {
        let entity = self.validate(raw)?;

        let checks = self.async_validators.iter().filter_map(|(attribute, validator)| {
            entity.attribute(attribute).map(|value| async move {
                (attribute.as_str(), validator.validate(attribute, value).await)
            })
        });
        let results = join_all(checks).await;

        if let Some((attribute, _)) = results.into_iter().find(|(_, ok)| !ok) {
            debug!(entity_id = %entity.id, attribute, "异步校验未通过");
            return Err(ValidationError::CustomRejected {
                attribute: attribute.to_string(),
            });
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_schema() -> EntitySchema {
        EntitySchema::new()
            .attribute(AttributeSchema::new("category", AttributeKind::String).required())
            .attribute(AttributeSchema::new("price", AttributeKind::Number).min(0.0).max(10_000.0))
            .attribute(
                AttributeSchema::new("sku", AttributeKind::String)
                    .pattern(r"^[A-Z]{2}-\d+$")
                    .unwrap(),
            )
            .attribute(
                AttributeSchema::new("tags", AttributeKind::array_of(AttributeKind::String))
                    .max(3.0),
            )
            .attribute(
                AttributeSchema::new("status", AttributeKind::String)
                    .allowed(["active", "retired"]),
            )
    }

    fn laptop() -> RawEntity {
        RawEntity::new("1", "Laptop")
            .with_attribute("category", "electronics")
            .with_attribute("price", 999)
            .with_attribute("sku", "EL-100")
    }

    // ==================== 同步校验 ====================

    #[test]
    fn test_valid_entity_marked_validated() {
        let entity = product_schema()
            .validate(laptop().with_attribute("extra", json!({"k": 1})))
            .unwrap();
        assert!(entity.validated);
        assert_eq!(entity.attribute("extra"), Some(&json!({"k": 1})));
    }

    #[test]
    fn test_required_missing_or_null() {
        let schema = product_schema();
        let err = schema.validate(RawEntity::new("2", "Empty")).unwrap_err();
        assert_eq!(err, ValidationError::Required { attribute: "category".into() });

        let err = schema
            .validate(RawEntity::new("3", "Null").with_attribute("category", Value::Null))
            .unwrap_err();
        assert_eq!(err.code(), "REQUIRED");
    }

    #[test]
    fn test_type_mismatch() {
        let err = product_schema()
            .validate(laptop().with_attribute("price", "999"))
            .unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
        assert!(err.to_string().contains("number"));

        let err = product_schema()
            .validate(laptop().with_attribute("tags", json!(["a", 1])))
            .unwrap_err();
        assert_eq!(err.attribute(), "tags");
    }

    #[test]
    fn test_range_on_numbers_and_lengths() {
        let err = product_schema()
            .validate(laptop().with_attribute("price", -1))
            .unwrap_err();
        assert_eq!(err.code(), "OUT_OF_RANGE");

        let err = product_schema()
            .validate(laptop().with_attribute("tags", json!(["a", "b", "c", "d"])))
            .unwrap_err();
        assert_eq!(err.code(), "OUT_OF_RANGE");

        assert!(product_schema()
            .validate(laptop().with_attribute("tags", json!(["a", "b", "c"])))
            .is_ok());
    }

    #[test]
    fn test_pattern_and_allowed() {
        let err = product_schema()
            .validate(laptop().with_attribute("sku", "el-100"))
            .unwrap_err();
        assert_eq!(err.code(), "PATTERN_MISMATCH");

        let err = product_schema()
            .validate(laptop().with_attribute("status", "draft"))
            .unwrap_err();
        assert_eq!(err.code(), "NOT_ALLOWED");
    }

    #[test]
    fn test_invalid_pattern() {
        let err = AttributeSchema::new("sku", AttributeKind::String)
            .pattern("([")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATTERN");
    }

    #[test]
    fn test_custom_validator() {
        let schema = EntitySchema::new().attribute(
            AttributeSchema::new("qty", AttributeKind::Number)
                .validator(|v| v.as_i64().is_some_and(|n| n % 2 == 0)),
        );

        assert!(schema.validate(RawEntity::new("1", "a").with_attribute("qty", 4)).is_ok());
        let err = schema
            .validate(RawEntity::new("1", "a").with_attribute("qty", 3))
            .unwrap_err();
        assert_eq!(err.code(), "CUSTOM_REJECTED");
    }

    // ==================== 异步校验 ====================

    struct Blocklist(Vec<&'static str>);

    #[async_trait]
    impl AsyncValidator for Blocklist {
        async fn validate(&self, _attribute: &str, value: &Value) -> bool {
            value.as_str().is_none_or(|s| !self.0.iter().any(|blocked| *blocked == s))
        }
    }

    #[test]
    fn test_validate_async() {
        let schema = product_schema().async_validator("sku", Arc::new(Blocklist(vec!["EL-666"])));

        let entity = tokio_test::block_on(schema.validate_async(laptop())).unwrap();
        assert!(entity.validated);

        let blocked = laptop().with_attribute("sku", "EL-666");
        let err = tokio_test::block_on(schema.validate_async(blocked)).unwrap_err();
        assert_eq!(err, ValidationError::CustomRejected { attribute: "sku".into() });
    }

    #[tokio::test]
    async fn test_validate_async_runs_sync_checks_first() {
        let schema = product_schema().async_validator("sku", Arc::new(Blocklist(vec![])));
        let err = schema.validate_async(RawEntity::new("9", "x")).await.unwrap_err();
        assert_eq!(err.code(), "REQUIRED");
    }
}
