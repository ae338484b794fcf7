use super::schema;
use chrono::NaiveDateTime;
use diesel::prelude::*;

// 会话记录
#[derive(Queryable, Selectable, Identifiable, PartialEq, Debug, Clone)]
#[diesel(table_name = schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    pub id: i32,
    pub title: String,
    pub model_id: String,
    pub model_name: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub message_count: i32,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub is_archived: bool,
    pub tags: String, // JSON数组
}

// 用于插入表的新会话。计数器从零开始。
#[derive(Insertable)]
#[diesel(table_name = schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewConversation<'a> {
    pub title: &'a str,
    pub model_id: &'a str,
    pub model_name: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub message_count: i32,
    pub system_prompt: Option<&'a str>,
    pub temperature: f64,
    pub is_archived: bool,
    pub tags: &'a str,
}

// 单条会话消息
#[derive(Queryable, Selectable, Identifiable, Associations, PartialEq, Debug, Clone)]
#[diesel(table_name = schema::messages)]
#[diesel(belongs_to(Conversation))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    pub id: i32,
    pub conversation_id: i32,
    pub role: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost: f64,
}

// 用于插入表的新消息
#[derive(Insertable)]
#[diesel(table_name = schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewMessage<'a> {
    pub conversation_id: i32,
    pub role: &'a str,
    pub content: &'a str,
    pub timestamp: NaiveDateTime,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost: f64,
}
