//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 默认 TTL（秒），0 表示永不过期
    pub default_ttl_secs: u64,
    /// 最大条目数，超出时淘汰最早插入的条目
    pub max_items: usize,
    /// 是否维护命中率和容量统计
    pub enable_stats: bool,
    /// 缓存键前缀
    pub key_prefix: String,
    /// 过期清理周期的上限（秒）
    pub max_sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_items: 10_000,
            enable_stats: false,
            key_prefix: "rule:".to_string(),
            max_sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    /// 默认 TTL，未启用过期时返回 None
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    /// 周期清理间隔：min(TTL, 上限)，TTL 关闭时取上限
    pub fn sweep_interval(&self) -> Duration {
        let cap = Duration::from_secs(self.max_sweep_interval_secs.max(1));
        match self.default_ttl() {
            Some(ttl) => ttl.min(cap),
            None => cap,
        }
    }
}

/// 多规则组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCombinator {
    /// 任一规则匹配即可
    #[default]
    Any,
    /// 所有规则都必须匹配
    All,
}

/// 匹配引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// 单批次最多评估的实体数量
    pub max_batch_size: usize,
    /// findMatchingFrom 的多规则组合方式
    pub combinator: RuleCombinator,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            combinator: RuleCombinator::Any,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识日志来源
    pub service_name: String,
    /// 日志级别（如 "info", "debug"）
    pub log_level: String,
    /// 是否启用 JSON 格式日志
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "entity-matcher".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub cache: CacheConfig,
    pub matching: MatchingConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（MATCHER_ 前缀，双下划线分隔层级，如 MATCHER_CACHE__MAX_ITEMS -> cache.max_items）
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(config_dir)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env = std::env::var("MATCHER_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            .set_default("environment", env.clone())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                Environment::with_prefix("MATCHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
