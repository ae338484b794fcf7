//! 从环境变量中读取的配置项
use serde::Deserialize;

pub const DEFAULT_DATABASE_PATH: &str = "chat_history.db";
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "sonnet-4";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

fn default_path() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_temperature() -> f64 {
    0.7
}

/// 数据库配置。环境变量前缀为`CHAT_DB_`，例如`CHAT_DB_PATH`。
/// `path`为SQLite数据库文件路径，`:memory:`表示内存数据库。
/// `connect_timeout_ms`为从连接池取得连接的最长等待时间，数据库无法打开时启动失败前最多等待这么久。
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CHAT_DB_").from_env::<Self>()
    }

    /// 指定数据库路径，其余使用默认值
    pub fn with_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }
}

/// 应用配置。环境变量前缀为`CHAT_`。
/// 未设置`CHAT_API_KEY`时使用`ANTHROPIC_API_KEY`。
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub models_file: Option<String>,
    pub log_dir: Option<String>,
}

#[derive(Deserialize)]
struct ProviderEnv {
    anthropic_api_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        let mut config = envy::prefixed("CHAT_").from_env::<Self>()?;
        if config.api_key.is_none() {
            config.api_key = envy::from_env::<ProviderEnv>()?.anthropic_api_key;
        }
        Ok(config)
    }
}
