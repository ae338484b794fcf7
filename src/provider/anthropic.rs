//! Anthropic作为API供应商
use crate::core;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::fmt;

// Custom Error
#[derive(Debug, Clone, PartialEq)]
pub struct Error(String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for Error {}

pub const API_VERSION: &str = "2023-06-01";

// 会话记录中的每一条消息
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl From<&core::ChatTurn> for Message {
    fn from(value: &core::ChatTurn) -> Self {
        Self {
            role: value.role.to_string(),
            content: value.content.clone(),
        }
    }
}

// 发送给Anthropic的请求需要满足本格式要求
// {
//     "model": "claude-sonnet-4-20250514",
//     "max_tokens": 1024,
//     "system": "You are a helpful assistant.",
//     "temperature": 0.7,
//     "messages": [
//         {"role": "user", "content": "Hello, Claude"}
//     ]
// }
#[derive(Serialize, Debug, Clone)]
pub struct Request {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub temperature: f64,
    pub messages: Vec<Message>, // 注意名字要与Json格式匹配
}

impl From<&core::ChatRequest> for Request {
    fn from(value: &core::ChatRequest) -> Self {
        Self {
            model: value.model_id.clone(),
            max_tokens: value.max_tokens,
            system: value.system_prompt.clone(),
            temperature: value.temperature,
            messages: value.turns.iter().map(Message::from).collect(),
        }
    }
}

// 请求返回结果
// 示例
// {
//     "id": "msg_013Zva2CMHLNnXjNJJKqJ2EF",
//     "type": "message",
//     "role": "assistant",
//     "model": "claude-sonnet-4-20250514",
//     "content": [
//         {"type": "text", "text": "Hi! My name is Claude."}
//     ],
//     "stop_reason": "end_turn",
//     "usage": {"input_tokens": 2095, "output_tokens": 503}
// }
#[derive(Deserialize, Debug)]
pub struct Response {
    #[allow(dead_code)]
    id: String,
    #[allow(dead_code)]
    model: String,
    pub content: Vec<ContentBlock>,
    #[allow(dead_code)]
    stop_reason: Option<String>,
    pub usage: Usage,
}

impl Response {
    /// 全部文本块拼接而成的回复。非文本块（如thinking）被忽略。
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect()
    }
}

#[derive(Deserialize, Debug)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// 出错时的返回
// {"type": "error", "error": {"type": "invalid_request_error", "message": "..."}}
#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

// AI供应商服务所需要的参数
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct Agent {
    config: Config,
    client: reqwest::Client,
}

impl Agent {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| Error(format!("API key无效。{e}")))?,
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(API_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    // 根据会话内容，返回最新消息。
    pub async fn process(&self, request: &Request) -> Result<Response, Error> {
        // 交由AI处理
        tracing::debug!("Ask AI for response..");
        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| Error(format!("发送AI请求失败。{e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(e) => format!("{}: {}", e.error.kind, e.error.message),
                Err(_) => body,
            };
            return Err(Error(format!("AI返回错误{status}。{detail}")));
        }

        response
            .json::<Response>()
            .await
            .map_err(|e| Error(format!("接收AI返回失败。{e}")))
    }
}

impl core::Chat for Agent {
    async fn chat(
        &self,
        request: &core::ChatRequest,
    ) -> Result<core::ChatReply, Box<dyn std::error::Error + Send + Sync>> {
        let response = self.process(&Request::from(request)).await?;
        tracing::debug!(
            "AI replied with {} input tokens and {} output tokens",
            response.usage.input_tokens,
            response.usage.output_tokens
        );
        Ok(core::ChatReply {
            content: response.text(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChatRequest, ChatTurn, MessageRole};

    #[test]
    fn test_request_body() {
        let request = ChatRequest {
            model_id: "claude-3-haiku-20240307".to_string(),
            max_tokens: 4096,
            system_prompt: Some("Be brief.".to_string()),
            temperature: 0.5,
            turns: vec![
                ChatTurn {
                    role: MessageRole::User,
                    content: "Hello".to_string(),
                },
                ChatTurn {
                    role: MessageRole::Assistant,
                    content: "Hi!".to_string(),
                },
            ],
        };
        let body = serde_json::to_value(Request::from(&request)).unwrap();
        assert_eq!(body["model"], "claude-3-haiku-20240307");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_request_without_system_prompt() {
        let request = ChatRequest {
            model_id: "m".to_string(),
            max_tokens: 1,
            system_prompt: None,
            temperature: 1.0,
            turns: vec![],
        };
        let body = serde_json::to_value(Request::from(&request)).unwrap();
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "id": "msg_013Zva2CMHLNnXjNJJKqJ2EF",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "Let me think", "signature": "abc"},
                {"type": "text", "text": "Hi! "},
                {"type": "text", "text": "My name is Claude."}
            ],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 2095, "output_tokens": 503}
        }"#;
        let response: Response = serde_json::from_str(json).expect("Response should be parsed");
        assert_eq!(response.text(), "Hi! My name is Claude.");
        assert_eq!(response.usage.input_tokens, 2095);
        assert_eq!(response.usage.output_tokens, 503);
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let response: ErrorResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.error.kind, "overloaded_error");
        assert_eq!(response.error.message, "Overloaded");
    }
}
