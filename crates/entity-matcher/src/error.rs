//! 匹配引擎错误类型
//!
//! 评估与缓存路径从不返回错误（失败即不匹配），错误只出现在规则构造、条件映射和实体校验的边界上。

use crate::schema::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("规则解析失败: {0}")]
    InvalidRule(String),

    #[error("未知的操作符: {0}")]
    UnknownOperator(String),

    #[error("未知的条件类型: {0}")]
    UnknownCondition(String),

    #[error("实体校验失败: {0}")]
    Validation(#[from] ValidationError),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl MatchError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRule(_) => "INVALID_RULE",
            Self::UnknownOperator(_) => "UNKNOWN_OPERATOR",
            Self::UnknownCondition(_) => "UNKNOWN_CONDITION",
            Self::Validation(e) => e.code(),
            Self::JsonError(_) => "JSON_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MatchError>;
