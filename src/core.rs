/// 定义了系统运行所需的核心实体类型以及组合模块需要遵循的行为协议
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// 会话中消息发送者的角色
/// `User` 人类用户
/// `Assistant` 智能助手
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = &'static str;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err("Unknown message role"),
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 一条已存储的消息。存储后不再变更。
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Message {
    pub id: i32,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: NaiveDateTime,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
}

impl Message {
    // 本条消息消耗的Token
    pub fn tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// 一段对话的元数据。
/// `total_tokens`、`total_cost`与`message_count`随每条消息增量维护，读取时不重新计算。
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Conversation {
    pub id: i32,
    pub title: String,
    pub model_id: String,
    pub model_name: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub message_count: u32,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub is_archived: bool,
    pub tags: Vec<String>,
}

/// 对话及其全部消息，消息按写入顺序排列
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// 全库统计
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct Statistics {
    pub total_conversations: u64,
    pub total_messages: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// 模型显示名称 -> 会话数量
    pub model_usage: BTreeMap<String, u64>,
}

/// 提供数据存储功能的对象应当具备的行为
pub trait PersistStore: Send + Sync {
    // 新建会话，返回会话ID
    fn create_conversation(
        &self,
        title: &str,
        model_id: &str,
        model_name: &str,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<i32, Box<dyn Error + Send + Sync>>;
    // 将新的消息添加到会话结尾，并同步更新会话计数器
    fn append_message(
        &self,
        conversation_id: i32,
        role: MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
    // 获取会话及其全部消息。会话不存在时返回None。
    fn get_conversation_with_messages(
        &self,
        id: i32,
    ) -> Result<Option<ConversationWithMessages>, Box<dyn Error + Send + Sync>>;
}

/// 发送给AI的一轮对话
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

/// 一次AI请求所需的全部内容
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model_id: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub turns: Vec<ChatTurn>,
}

/// AI的完整回复以及本次消耗
#[derive(Debug, PartialEq, Clone)]
pub struct ChatReply {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// 提供聊天功能的对象应当具备的行为
pub trait Chat {
    // AI供应商应当能够根据会话内容返回消息
    async fn chat(&self, request: &ChatRequest)
        -> Result<ChatReply, Box<dyn Error + Send + Sync>>;
}
