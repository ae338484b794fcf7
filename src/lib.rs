//! 对话历史记录
//! 将与AI助手的会话及其消息保存到SQLite数据库，支持检索、归档、导出与统计。
pub mod catalog;
pub mod config;
pub mod core;
pub mod provider;
pub mod session;
pub mod storage;

pub use catalog::{ModelCatalog, ModelConfig};
pub use config::{AppConfig, StorageConfig};
pub use session::ChatSession;
pub use storage::ConversationStore;
