/// ChatSession负责处理与用户的一段会话
/// - 维护当前会话的上下文，并在每一轮对话后写入存储。
/// - 存储出错时只记录日志，不中断对话。
use crate::catalog::{ModelCatalog, ModelConfig};
use crate::core::{Chat, ChatRequest, ChatTurn, MessageRole, PersistStore};
use crate::storage::{generate_title, DEFAULT_TITLE_LENGTH};
use std::fmt;
use std::sync::Arc;

// Custom Error
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    EmptyMessage,
    UnknownModel(String),
    NotFound(i32),
    StorageError(String),
    ProviderError(String),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err = match self {
            Self::EmptyMessage => "消息不能为空".to_string(),
            Self::UnknownModel(key) => format!("未知的模型：{key}"),
            Self::NotFound(id) => format!("会话{id}不存在"),
            Self::StorageError(e) => format!("数据库错误。{e}"),
            Self::ProviderError(e) => format!("供应商错误。{e}"),
        };
        write!(f, "{}", err)
    }
}
impl std::error::Error for Error {}

/// 会话初始化所需要的参数
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

/// 本次运行期间的用量统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub message_count: u32,
}

impl TokenStats {
    pub fn add_usage(&mut self, input_tokens: u32, output_tokens: u32, cost: f64) {
        self.input_tokens += u64::from(input_tokens);
        self.output_tokens += u64::from(output_tokens);
        self.cost += cost;
        self.message_count += 1;
    }
}

/// 助手的回复
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    /// 本轮对话是否已完整写入存储
    pub persisted: bool,
}

// 粗略估计文本的Token数量
fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
}

/// ChatSession根据用户消息生成回复，并记录会话
pub struct ChatSession<P: Chat> {
    provider: P,
    storage: Arc<dyn PersistStore>,
    catalog: Arc<ModelCatalog>,
    model: ModelConfig,
    system_prompt: Option<String>,
    temperature: f64,
    max_tokens: Option<u32>,
    conversation_id: Option<i32>,
    history: Vec<ChatTurn>,
    stats: TokenStats,
}

impl<P: Chat> ChatSession<P> {
    pub fn new(
        config: &Config,
        provider: P,
        storage: Arc<dyn PersistStore>,
        catalog: Arc<ModelCatalog>,
    ) -> Result<Self, Error> {
        let model = catalog
            .get(&config.model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(config.model.clone()))?;
        Ok(Self {
            provider,
            storage,
            catalog,
            model,
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            conversation_id: None,
            history: Vec::new(),
            stats: TokenStats::default(),
        })
    }

    pub fn conversation_id(&self) -> Option<i32> {
        self.conversation_id
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn stats(&self) -> &TokenStats {
        &self.stats
    }

    /// 切换模型。已有的会话记录保持不变。
    pub fn set_model(&mut self, key: &str) -> Result<(), Error> {
        self.model = self
            .catalog
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(key.to_string()))?;
        tracing::info!("已切换模型：{}", self.model.name);
        Ok(())
    }

    // 开始全新会话
    pub fn start_new(&mut self) {
        self.conversation_id = None;
        self.history.clear();
        self.stats = TokenStats::default();
    }

    /// 载入已有的会话，之后的消息会追加到该会话
    pub fn resume(&mut self, id: i32) -> Result<(), Error> {
        let conversation = self
            .storage
            .get_conversation_with_messages(id)
            .map_err(|e| Error::StorageError(format!("获取会话记录失败。{e}")))?
            .ok_or(Error::NotFound(id))?;

        match self.catalog.find_by_id(&conversation.conversation.model_id) {
            Some(model) => self.model = model.clone(),
            None => tracing::warn!(
                "会话{id}使用的模型{}不在模型表中，继续使用{}",
                conversation.conversation.model_id,
                self.model.key
            ),
        }
        self.system_prompt = conversation.conversation.system_prompt.clone();
        self.temperature = conversation.conversation.temperature;
        self.history = conversation
            .messages
            .iter()
            .map(|m| ChatTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        self.conversation_id = Some(id);
        self.stats = TokenStats::default();
        tracing::info!(
            "已载入会话：{}（{}条消息）",
            conversation.conversation.title,
            self.history.len()
        );
        Ok(())
    }

    // 新建会话记录。失败时返回None，对话照常进行。
    fn ensure_conversation(&mut self, first_message: &str) -> Option<i32> {
        if self.conversation_id.is_some() {
            return self.conversation_id;
        }
        let title = generate_title(first_message, DEFAULT_TITLE_LENGTH);
        match self.storage.create_conversation(
            &title,
            &self.model.id,
            &self.model.name,
            self.system_prompt.as_deref(),
            self.temperature,
        ) {
            Ok(id) => {
                tracing::info!("已创建会话记录：{title}");
                self.conversation_id = Some(id);
                Some(id)
            }
            Err(e) => {
                tracing::warn!("创建会话记录失败，本轮对话不会被保存。{e}");
                None
            }
        }
    }

    // 记录一条消息。失败时只记录日志。
    fn record(
        &self,
        conversation_id: Option<i32>,
        role: MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) -> bool {
        let Some(id) = conversation_id else {
            return false;
        };
        match self
            .storage
            .append_message(id, role, content, input_tokens, output_tokens, cost)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("保存{role}消息到会话{id}失败。{e}");
                false
            }
        }
    }

    /// 根据用户消息，返回合适的回复
    pub async fn send(&mut self, message: &str) -> Result<Reply, Error> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }

        // 记录用户消息。请求发出前写入，请求失败时记录仍然保留。
        let conversation_id = self.ensure_conversation(message);
        let user_saved = self.record(
            conversation_id,
            MessageRole::User,
            message,
            estimate_tokens(message),
            0,
            0.0,
        );
        self.history.push(ChatTurn {
            role: MessageRole::User,
            content: message.to_string(),
        });

        // 交由AI处理
        let request = ChatRequest {
            model_id: self.model.id.clone(),
            max_tokens: self.max_tokens.unwrap_or(self.model.max_output_tokens),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            turns: self.history.clone(),
        };
        let ai_reply = self
            .provider
            .chat(&request)
            .await
            .map_err(|e| Error::ProviderError(format!("获取AI回复时发生错误。{e}")))?;
        tracing::debug!("AI replied");

        // 更新AI回复到会话记录
        let cost = self.model.cost(ai_reply.input_tokens, ai_reply.output_tokens);
        let reply_saved = self.record(
            conversation_id,
            MessageRole::Assistant,
            &ai_reply.content,
            0,
            ai_reply.output_tokens,
            cost,
        );
        self.history.push(ChatTurn {
            role: MessageRole::Assistant,
            content: ai_reply.content.clone(),
        });
        self.stats
            .add_usage(ai_reply.input_tokens, ai_reply.output_tokens, cost);

        Ok(Reply {
            content: ai_reply.content,
            input_tokens: ai_reply.input_tokens,
            output_tokens: ai_reply.output_tokens,
            cost,
            persisted: user_saved && reply_saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChatReply, ConversationWithMessages};
    use crate::storage::ConversationStore;
    use std::error::Error as StdError;
    use std::sync::Mutex;

    // 固定回复的供应商，同时记录收到的请求
    struct EchoProvider {
        requests: Mutex<Vec<ChatRequest>>,
        fail: bool,
    }

    impl EchoProvider {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl Chat for EchoProvider {
        async fn chat(
            &self,
            request: &ChatRequest,
        ) -> Result<ChatReply, Box<dyn StdError + Send + Sync>> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err("overloaded".into());
            }
            let last = request.turns.last().map(|t| t.content.as_str()).unwrap_or("");
            Ok(ChatReply {
                content: format!("echo: {last}"),
                input_tokens: 1000,
                output_tokens: 2000,
            })
        }
    }

    // 永远失败的存储
    struct BrokenStore;

    impl PersistStore for BrokenStore {
        fn create_conversation(
            &self,
            _title: &str,
            _model_id: &str,
            _model_name: &str,
            _system_prompt: Option<&str>,
            _temperature: f64,
        ) -> Result<i32, Box<dyn StdError + Send + Sync>> {
            Err("database is down".into())
        }
        fn append_message(
            &self,
            _conversation_id: i32,
            _role: MessageRole,
            _content: &str,
            _input_tokens: u32,
            _output_tokens: u32,
            _cost: f64,
        ) -> Result<(), Box<dyn StdError + Send + Sync>> {
            Err("database is down".into())
        }
        fn get_conversation_with_messages(
            &self,
            _id: i32,
        ) -> Result<Option<ConversationWithMessages>, Box<dyn StdError + Send + Sync>> {
            Err("database is down".into())
        }
    }

    fn config() -> Config {
        Config {
            model: "haiku-3".to_string(),
            system_prompt: Some("Be brief.".to_string()),
            temperature: 0.3,
            max_tokens: None,
        }
    }

    fn memory_store() -> Arc<ConversationStore> {
        Arc::new(ConversationStore::open(":memory:").expect("Database should be initialized"))
    }

    #[test]
    fn test_unknown_model() {
        let result = ChatSession::new(
            &Config {
                model: "gpt-4".to_string(),
                ..config()
            },
            EchoProvider::new(),
            memory_store(),
            Arc::new(ModelCatalog::default()),
        );
        assert!(matches!(result, Err(Error::UnknownModel(_))));
    }

    #[tokio::test]
    async fn test_send_persists_both_turns() {
        let store = memory_store();
        let mut session = ChatSession::new(
            &config(),
            EchoProvider::new(),
            store.clone(),
            Arc::new(ModelCatalog::default()),
        )
        .expect("Session should be created");

        let reply = session
            .send("What is Rust? Tell me everything")
            .await
            .expect("Reply should be returned");
        assert_eq!(reply.content, "echo: What is Rust? Tell me everything");
        assert!(reply.persisted);
        // haiku-3: 1000 * 0.25 + 2000 * 1.25 per million
        assert!((reply.cost - 0.00275).abs() < 1e-12);

        let id = session.conversation_id().expect("Conversation should exist");
        let conv = store.get_conversation_with_messages(id).unwrap().unwrap();
        assert_eq!(conv.conversation.title, "What is Rust?");
        assert_eq!(conv.conversation.model_id, "claude-3-haiku-20240307");
        assert_eq!(conv.conversation.model_name, "Claude Haiku 3");
        assert_eq!(conv.conversation.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(conv.conversation.temperature, 0.3);
        assert_eq!(conv.messages.len(), 2);
        // "What is Rust? Tell me everything" has 32 characters
        assert_eq!(conv.messages[0].input_tokens, 8);
        assert_eq!(conv.messages[1].output_tokens, 2000);
        assert_eq!(conv.conversation.total_tokens, 2008);
        assert!((conv.conversation.total_cost - reply.cost).abs() < 1e-12);

        assert_eq!(session.stats().message_count, 1);
        assert_eq!(session.stats().input_tokens, 1000);
    }

    #[tokio::test]
    async fn test_history_is_sent() {
        let mut session = ChatSession::new(
            &config(),
            EchoProvider::new(),
            memory_store(),
            Arc::new(ModelCatalog::default()),
        )
        .unwrap();
        session.send("first question").await.unwrap();
        session.send("second question").await.unwrap();

        let requests = session.provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].turns.len(), 3);
        assert_eq!(requests[1].turns[1].role, MessageRole::Assistant);
        assert_eq!(requests[1].max_tokens, 4096);
        assert_eq!(requests[1].system_prompt.as_deref(), Some("Be brief."));
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_abort() {
        let mut session = ChatSession::new(
            &config(),
            EchoProvider::new(),
            Arc::new(BrokenStore),
            Arc::new(ModelCatalog::default()),
        )
        .unwrap();
        let reply = session.send("hello there").await.expect("Chat should go on");
        assert!(!reply.persisted);
        assert_eq!(reply.content, "echo: hello there");
        assert!(session.conversation_id().is_none());
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_user_turn() {
        let store = memory_store();
        let mut session = ChatSession::new(
            &config(),
            EchoProvider {
                requests: Mutex::new(Vec::new()),
                fail: true,
            },
            store.clone(),
            Arc::new(ModelCatalog::default()),
        )
        .unwrap();
        let result = session.send("are you there?").await;
        assert!(matches!(result, Err(Error::ProviderError(_))));

        let id = session.conversation_id().unwrap();
        let conv = store.get_conversation_with_messages(id).unwrap().unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut session = ChatSession::new(
            &config(),
            EchoProvider::new(),
            memory_store(),
            Arc::new(ModelCatalog::default()),
        )
        .unwrap();
        assert_eq!(session.send("   ").await, Err(Error::EmptyMessage));
        assert!(session.conversation_id().is_none());
    }

    #[tokio::test]
    async fn test_resume_and_start_new() {
        let store = memory_store();
        let id = store
            .create_conversation(
                "Old chat",
                "claude-sonnet-4-20250514",
                "Claude Sonnet 4",
                None,
                1.0,
            )
            .unwrap();
        store
            .append_message(id, MessageRole::User, "earlier", 2, 0, 0.0)
            .unwrap();
        store
            .append_message(id, MessageRole::Assistant, "answer", 0, 2, 0.0)
            .unwrap();

        let mut session = ChatSession::new(
            &config(),
            EchoProvider::new(),
            store.clone(),
            Arc::new(ModelCatalog::default()),
        )
        .unwrap();
        session.resume(id).expect("Conversation should be resumed");
        assert_eq!(session.model().key, "sonnet-4");
        assert_eq!(session.history().len(), 2);

        session.send("and now?").await.unwrap();
        let conv = store.get_conversation_with_messages(id).unwrap().unwrap();
        assert_eq!(conv.conversation.message_count, 4);
        let requests = session.provider.requests.lock().unwrap();
        assert_eq!(requests[0].temperature, 1.0);
        assert!(requests[0].system_prompt.is_none());
        drop(requests);

        session.start_new();
        assert!(session.conversation_id().is_none());
        assert!(session.history().is_empty());
        assert_eq!(session.stats(), &TokenStats::default());

        assert_eq!(session.resume(id + 1), Err(Error::NotFound(id + 1)));
    }
}
