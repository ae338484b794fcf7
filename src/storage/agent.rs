use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::dsl::{count, sum};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use super::schema::{conversations, messages};
use super::{model, Error};
use crate::config::StorageConfig;
use crate::core;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const MEMORY_DATABASE: &str = ":memory:";

type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

// SQLite自带的lower()与LIKE只处理ASCII字母，搜索时改用按Unicode规则转换的小写
diesel::define_sql_function! {
    fn unicode_lower(text: Text) -> Text;
}

// 会话类型转换：model::Conversation -> core::Conversation
impl TryFrom<model::Conversation> for core::Conversation {
    type Error = Error;
    fn try_from(value: model::Conversation) -> Result<Self, Self::Error> {
        let tags: Vec<String> = serde_json::from_str(&value.tags)
            .map_err(|e| Error::Database(format!("会话{}的标签无法解析。{e}", value.id)))?;
        Ok(Self {
            id: value.id,
            title: value.title,
            model_id: value.model_id,
            model_name: value.model_name,
            created_at: value.created_at,
            updated_at: value.updated_at,
            total_tokens: value.total_tokens.max(0) as u64,
            total_cost: value.total_cost,
            message_count: value.message_count.max(0) as u32,
            system_prompt: value.system_prompt,
            temperature: value.temperature,
            is_archived: value.is_archived,
            tags,
        })
    }
}

// 消息类型转换：model::Message -> core::Message
impl TryFrom<model::Message> for core::Message {
    type Error = Error;
    fn try_from(value: model::Message) -> Result<Self, Self::Error> {
        let role = core::MessageRole::try_from(value.role.as_str())
            .map_err(|e| Error::Database(format!("消息{}的角色无效：{}。{e}", value.id, value.role)))?;
        Ok(Self {
            id: value.id,
            role,
            content: value.content,
            timestamp: value.timestamp,
            input_tokens: value.input_tokens.max(0) as u32,
            output_tokens: value.output_tokens.max(0) as u32,
            cost: value.cost,
        })
    }
}

fn to_conversations(rows: Vec<model::Conversation>) -> Result<Vec<core::Conversation>, Error> {
    rows.into_iter().map(core::Conversation::try_from).collect()
}

// LIKE模式中的通配符需要转义
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn to_db_tokens(value: u32) -> Result<i32, Error> {
    i32::try_from(value).map_err(|_| Error::InvalidInput(format!("Token数量过大：{value}")))
}

fn validate_title(title: &str) -> Result<&str, Error> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput("会话标题不能为空".to_string()));
    }
    Ok(title)
}

// 确保数据库文件所在目录存在。SQLite会在首次连接时创建数据库文件。
fn ensure_database(path: &str) -> Result<(), Error> {
    let path = Path::new(path);
    if path.exists() {
        tracing::info!("数据库已存在：{}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Connection(format!("创建数据库目录失败。{e}")))?;
    }
    tracing::info!("数据库不存在，将创建：{}", path.display());
    Ok(())
}

// 每个连接在取出时都需要打开外键约束（级联删除依赖于此），并设置锁等待时间。
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)?;
        unicode_lower_utils::register_impl(conn, |text: String| text.to_lowercase())
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// 会话存储。
/// 每个操作在自身执行期间从连接池取出一个连接，操作结束即归还。
/// 写操作均在事务内完成，失败时整体回滚。
pub struct ConversationStore {
    connections: Pool<ConnectionManager<SqliteConnection>>,
}

impl ConversationStore {
    /// 初始化数据库。数据库不可用时直接返回错误，不做重试。
    pub fn new(config: &StorageConfig) -> Result<Self, Error> {
        let in_memory = config.path == MEMORY_DATABASE;
        if !in_memory {
            ensure_database(&config.path)?;
        }

        // Init a db pool
        let manager = ConnectionManager::<SqliteConnection>::new(&config.path);
        let builder = Pool::builder()
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: config.busy_timeout_ms,
            }));
        // 内存数据库随连接关闭而消失：只能有一个连接，且该连接永不回收
        let builder = if in_memory {
            builder
                .max_size(1)
                .min_idle(Some(1))
                .max_lifetime(None)
                .idle_timeout(None)
        } else {
            builder.max_size(config.pool_size.max(1))
        };
        let connections = builder.build(manager)?;

        // 初始化数据库结构
        {
            let conn = &mut connections.get()?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| Error::Database(format!("初始化数据表失败。{e}")))?;
        }
        tracing::info!("数据库已连接：{}", config.path);

        Ok(Self { connections })
    }

    /// 使用默认配置打开指定路径的数据库
    pub fn open(path: &str) -> Result<Self, Error> {
        Self::new(&StorageConfig::with_path(path))
    }

    // 取出连接并执行操作。失败在此记录日志。
    fn with_connection<T, F>(&self, operation: &str, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, Error>,
    {
        let result = self
            .connections
            .get()
            .map_err(Error::from)
            .and_then(|mut conn: DbConnection| f(&mut conn));
        match &result {
            Err(Error::NotFound) => tracing::warn!("{operation}失败。会话不存在"),
            Err(e) => tracing::error!("{operation}失败。{e}"),
            Ok(_) => {}
        }
        result
    }

    /// 新建会话，返回会话ID。`updated_at`与`created_at`相同。
    pub fn create_conversation(
        &self,
        title: &str,
        model_id: &str,
        model_name: &str,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<i32, Error> {
        self.with_connection("创建会话", |conn| {
            let title = validate_title(title)?;
            if model_id.trim().is_empty() {
                return Err(Error::InvalidInput("模型ID不能为空".to_string()));
            }
            if !temperature.is_finite() {
                return Err(Error::InvalidInput(format!("temperature无效：{temperature}")));
            }
            let timestamp = Utc::now().naive_utc();
            let new_conv = model::NewConversation {
                title,
                model_id,
                model_name,
                created_at: timestamp,
                updated_at: timestamp,
                total_tokens: 0,
                total_cost: 0.0,
                message_count: 0,
                system_prompt,
                temperature,
                is_archived: false,
                tags: "[]",
            };
            let id: i32 = diesel::insert_into(conversations::table)
                .values(&new_conv)
                .returning(conversations::id)
                .get_result(conn)?;
            tracing::info!("已创建会话：{title}（ID：{id}）");
            Ok(id)
        })
    }

    /// 将新的消息添加到会话结尾。
    /// 消息写入与会话计数器的更新在同一个写事务内完成，二者要么都生效，要么都不生效。
    pub fn append_message(
        &self,
        conversation_id: i32,
        role: core::MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) -> Result<(), Error> {
        self.with_connection("追加消息", |conn| {
            if !cost.is_finite() || cost < 0.0 {
                return Err(Error::InvalidInput(format!("费用无效：{cost}")));
            }
            let turn_tokens = i64::from(input_tokens) + i64::from(output_tokens);
            let input_tokens = to_db_tokens(input_tokens)?;
            let output_tokens = to_db_tokens(output_tokens)?;
            let timestamp = Utc::now().naive_utc();

            // IMMEDIATE事务在开始时即获得写锁，计数器的增量基于事务内读取的当前值
            conn.immediate_transaction::<_, Error, _>(|conn| {
                let updated = diesel::update(conversations::table.find(conversation_id))
                    .set((
                        conversations::message_count.eq(conversations::message_count + 1),
                        conversations::total_tokens.eq(conversations::total_tokens + turn_tokens),
                        conversations::total_cost.eq(conversations::total_cost + cost),
                        conversations::updated_at.eq(timestamp),
                    ))
                    .execute(conn)?;
                if updated == 0 {
                    return Err(Error::NotFound);
                }

                let new_msg = model::NewMessage {
                    conversation_id,
                    role: role.as_str(),
                    content,
                    timestamp,
                    input_tokens,
                    output_tokens,
                    cost,
                };
                diesel::insert_into(messages::table)
                    .values(&new_msg)
                    .execute(conn)?;
                Ok(())
            })?;
            tracing::debug!("Message appended to conversation {conversation_id}");
            Ok(())
        })
    }

    /// 获取会话列表，最近更新的在前。默认不包含已归档的会话。
    pub fn list_conversations(
        &self,
        include_archived: bool,
    ) -> Result<Vec<core::Conversation>, Error> {
        self.with_connection("获取会话列表", |conn| {
            let mut query = conversations::table.into_boxed();
            if !include_archived {
                query = query.filter(conversations::is_archived.eq(false));
            }
            let rows = query
                .order((conversations::updated_at.desc(), conversations::id.desc()))
                .select(model::Conversation::as_select())
                .load::<model::Conversation>(conn)?;
            to_conversations(rows)
        })
    }

    /// 获取会话及其全部消息，消息按写入顺序排列。会话不存在时返回`Ok(None)`。
    pub fn get_conversation_with_messages(
        &self,
        id: i32,
    ) -> Result<Option<core::ConversationWithMessages>, Error> {
        self.with_connection("获取会话", |conn| {
            conn.transaction::<_, Error, _>(|conn| {
                let Some(db_conv) = conversations::table
                    .find(id)
                    .select(model::Conversation::as_select())
                    .first::<model::Conversation>(conn)
                    .optional()?
                else {
                    return Ok(None);
                };

                // Find all the messages belonging to this conversation
                let db_msgs: Vec<model::Message> = model::Message::belonging_to(&db_conv)
                    .select(model::Message::as_select())
                    .order(messages::id.asc())
                    .load(conn)?;
                let messages = db_msgs
                    .into_iter()
                    .map(core::Message::try_from)
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Some(core::ConversationWithMessages {
                    conversation: db_conv.try_into()?,
                    messages,
                }))
            })
        })
    }

    /// 修改会话标题
    pub fn update_title(&self, id: i32, new_title: &str) -> Result<(), Error> {
        self.with_connection("修改会话标题", |conn| {
            let new_title = validate_title(new_title)?;
            let updated = diesel::update(conversations::table.find(id))
                .set((
                    conversations::title.eq(new_title),
                    conversations::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            if updated == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    /// 归档会话。归档不可撤销。
    pub fn archive_conversation(&self, id: i32) -> Result<(), Error> {
        self.with_connection("归档会话", |conn| {
            let updated = diesel::update(conversations::table.find(id))
                .set((
                    conversations::is_archived.eq(true),
                    conversations::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            if updated == 0 {
                return Err(Error::NotFound);
            }
            tracing::info!("已归档会话：{id}");
            Ok(())
        })
    }

    /// 替换会话的标签列表
    pub fn set_tags(&self, id: i32, tags: &[String]) -> Result<(), Error> {
        self.with_connection("更新会话标签", |conn| {
            let encoded = serde_json::to_string(tags)
                .map_err(|e| Error::InvalidInput(format!("标签无法编码。{e}")))?;
            let updated = diesel::update(conversations::table.find(id))
                .set((
                    conversations::tags.eq(encoded),
                    conversations::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            if updated == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    /// 删除会话，其全部消息随之级联删除。
    /// 本操作会永久删除数据，谨慎操作！
    pub fn delete_conversation(&self, id: i32) -> Result<(), Error> {
        self.with_connection("删除会话", |conn| {
            let deleted = conn.transaction::<_, Error, _>(|conn| {
                Ok(diesel::delete(conversations::table.find(id)).execute(conn)?)
            })?;
            if deleted == 0 {
                return Err(Error::NotFound);
            }
            tracing::info!("已删除会话：{id}");
            Ok(())
        })
    }

    /// 按标题或消息内容搜索会话（不区分大小写的子串匹配，大小写按Unicode规则转换）。
    /// 单条查询完成，每个会话至多出现一次。
    pub fn search_conversations(&self, text: &str) -> Result<Vec<core::Conversation>, Error> {
        self.with_connection("搜索会话", |conn| {
            let pattern = like_pattern(&text.to_lowercase());
            let matching_messages = messages::table
                .filter(
                    unicode_lower(messages::content)
                        .like(pattern.clone())
                        .escape('\\'),
                )
                .select(messages::conversation_id);
            let rows = conversations::table
                .filter(
                    unicode_lower(conversations::title)
                        .like(pattern)
                        .escape('\\')
                        .or(conversations::id.eq_any(matching_messages)),
                )
                .order((conversations::updated_at.desc(), conversations::id.desc()))
                .select(model::Conversation::as_select())
                .load::<model::Conversation>(conn)?;
            to_conversations(rows)
        })
    }

    /// 全库统计
    pub fn get_statistics(&self) -> Result<core::Statistics, Error> {
        self.with_connection("获取统计信息", |conn| {
            conn.transaction::<_, Error, _>(|conn| {
                let total_conversations: i64 = conversations::table.count().get_result(conn)?;
                let total_messages: i64 = messages::table.count().get_result(conn)?;
                let total_tokens: Option<i64> = messages::table
                    .select(sum(messages::input_tokens + messages::output_tokens))
                    .get_result(conn)?;
                let total_cost: Option<f64> = conversations::table
                    .select(sum(conversations::total_cost))
                    .get_result(conn)?;
                let usage: Vec<(String, i64)> = conversations::table
                    .group_by(conversations::model_name)
                    .select((conversations::model_name, count(conversations::id)))
                    .load(conn)?;

                Ok(core::Statistics {
                    total_conversations: total_conversations.max(0) as u64,
                    total_messages: total_messages.max(0) as u64,
                    total_tokens: total_tokens.unwrap_or(0).max(0) as u64,
                    total_cost: total_cost.unwrap_or(0.0),
                    model_usage: usage
                        .into_iter()
                        .map(|(name, n)| (name, n.max(0) as u64))
                        .collect::<BTreeMap<_, _>>(),
                })
            })
        })
    }

    /// 将会话导出为JSON文件。目标文件已存在时直接覆盖。
    pub fn export_conversation_to_file(&self, id: i32, path: &Path) -> Result<(), Error> {
        let Some(conversation) = self.get_conversation_with_messages(id)? else {
            tracing::warn!("导出失败。会话{id}不存在");
            return Err(Error::NotFound);
        };
        let document = serde_json::to_string_pretty(&conversation)
            .map_err(|e| Error::Io(format!("会话序列化失败。{e}")))?;
        fs::write(path, document).map_err(|e| {
            tracing::error!("导出会话{id}失败。{e}");
            Error::Io(format!("写入{}失败。{e}", path.display()))
        })?;
        tracing::info!("已导出会话{id}至{}", path.display());
        Ok(())
    }
}

// 实现存储特性
impl core::PersistStore for ConversationStore {
    fn create_conversation(
        &self,
        title: &str,
        model_id: &str,
        model_name: &str,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
        Ok(ConversationStore::create_conversation(
            self,
            title,
            model_id,
            model_name,
            system_prompt,
            temperature,
        )?)
    }

    fn append_message(
        &self,
        conversation_id: i32,
        role: core::MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(ConversationStore::append_message(
            self,
            conversation_id,
            role,
            content,
            input_tokens,
            output_tokens,
            cost,
        )?)
    }

    fn get_conversation_with_messages(
        &self,
        id: i32,
    ) -> Result<Option<core::ConversationWithMessages>, Box<dyn std::error::Error + Send + Sync>>
    {
        Ok(ConversationStore::get_conversation_with_messages(self, id)?)
    }
}
