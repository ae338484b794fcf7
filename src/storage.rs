//! 会话记录的持久化存储
//! - 两张表：conversations与messages，一对多，删除会话时级联删除消息。
//! - 会话上的计数器（消息数、Token总数、累计费用）与消息在同一事务内更新。
mod agent;
mod model;
mod schema;
mod title;

pub use agent::{ConversationStore, MIGRATIONS};
pub use title::{generate_title, DEFAULT_TITLE_LENGTH, TITLE_PREFIX};

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    NotFound,
    InvalidInput(String),
    Database(String),
    Connection(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "会话不存在"),
            Self::InvalidInput(msg) => write!(f, "参数无效。{msg}"),
            Self::Database(msg) => write!(f, "数据库错误。{msg}"),
            Self::Connection(msg) => write!(f, "数据库连接错误。{msg}"),
            Self::Io(msg) => write!(f, "文件读写错误。{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<diesel::result::Error> for Error {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => Self::NotFound,
            e => Self::Database(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(value: r2d2::Error) -> Self {
        Self::Connection(value.to_string())
    }
}
