//! 可用模型及其价格
//! 价格单位为美元/百万Token。模型表建立后不可修改，通过`Arc`共享。
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

// Custom Error
#[derive(Debug, Clone, PartialEq)]
pub struct Error(String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for Error {}

/// 单个模型的配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub key: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub max_output_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    #[serde(default)]
    pub extended_thinking: bool,
}

impl ModelConfig {
    /// 计算价值消耗
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_cost + f64::from(output_tokens) * self.output_cost)
            / 1_000_000.0
    }
}

#[allow(clippy::too_many_arguments)]
fn builtin(
    key: &str,
    id: &str,
    name: &str,
    description: &str,
    max_output_tokens: u32,
    input_cost: f64,
    output_cost: f64,
    extended_thinking: bool,
) -> ModelConfig {
    ModelConfig {
        key: key.to_string(),
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        max_output_tokens,
        input_cost,
        output_cost,
        extended_thinking,
    }
}

/// 模型表
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelConfig>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::from_models(vec![
            builtin(
                "opus-4.1",
                "claude-opus-4-1-20250805",
                "Claude Opus 4.1",
                "Most capable model",
                32000,
                15.0,
                75.0,
                true,
            ),
            builtin(
                "opus-4",
                "claude-opus-4-20240229",
                "Claude Opus 4",
                "Previous flagship model",
                32000,
                12.0,
                60.0,
                true,
            ),
            builtin(
                "sonnet-4",
                "claude-sonnet-4-20250514",
                "Claude Sonnet 4",
                "High performance model",
                64000,
                3.0,
                15.0,
                true,
            ),
            builtin(
                "sonnet-3.7",
                "claude-sonnet-3.7-20241029",
                "Claude Sonnet 3.7",
                "Model with extended thinking",
                64000,
                3.0,
                15.0,
                true,
            ),
            builtin(
                "haiku-3.5",
                "claude-3-5-haiku-20241022",
                "Claude Haiku 3.5",
                "Fastest model",
                8192,
                1.0,
                5.0,
                false,
            ),
            builtin(
                "haiku-3",
                "claude-3-haiku-20240307",
                "Claude Haiku 3",
                "Fast and compact model",
                4096,
                0.25,
                1.25,
                false,
            ),
        ])
    }
}

impl ModelCatalog {
    fn from_models(models: Vec<ModelConfig>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.key.clone(), m)).collect(),
        }
    }

    /// 从JSON文件读取模型表。文件内容为`ModelConfig`数组。
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error(format!("读取模型文件{}失败。{e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let models: Vec<ModelConfig> =
            serde_json::from_str(text).map_err(|e| Error(format!("模型文件格式错误。{e}")))?;
        if models.is_empty() {
            return Err(Error("模型文件中没有模型".to_string()));
        }
        if let Some(m) = models
            .iter()
            .find(|m| !(m.input_cost >= 0.0 && m.output_cost >= 0.0))
        {
            return Err(Error(format!("模型{}的价格无效", m.key)));
        }
        let count = models.len();
        let catalog = Self::from_models(models);
        if catalog.models.len() != count {
            return Err(Error("模型文件中存在重复的key".to_string()));
        }
        Ok(catalog)
    }

    pub fn get(&self, key: &str) -> Option<&ModelConfig> {
        self.models.get(key)
    }

    /// 根据供应商的模型ID查找
    pub fn find_by_id(&self, model_id: &str) -> Option<&ModelConfig> {
        self.models.values().find(|m| m.id == model_id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }
}
