//! Provider trait and the HTTP chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{LlmError, LlmResult, PromptSpec, TaskClass};

/// One language model backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Tag used in logs and routing tables.
    fn name(&self) -> &str;

    /// Task classes this provider is registered to serve.
    fn supports(&self, class: TaskClass) -> bool;

    /// Run one completion within `deadline` and return the parsed JSON body
    /// of the model's reply.
    async fn complete(&self, spec: &PromptSpec, deadline: Duration) -> LlmResult<Value>;
}

/// Chat-completions style HTTP provider. The API key is read from the
/// environment at construction so secrets never live in configuration files.
pub struct HttpCompletionClient {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    classes: Vec<TaskClass>,
    client: Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

impl HttpCompletionClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key_env: &str,
        classes: Vec<TaskClass>,
    ) -> LlmResult<Self> {
        let name = name.into();
        let api_key = std::env::var(api_key_env).map_err(|_| LlmError::Configuration {
            provider: name.clone(),
            detail: format!("environment variable '{api_key_env}' is not set"),
        })?;
        let client = Client::builder()
            .build()
            .map_err(|err| LlmError::Transport {
                provider: name.clone(),
                detail: err.to_string(),
            })?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            classes,
            client,
        })
    }

    fn transport(&self, err: impl std::fmt::Display) -> LlmError {
        LlmError::Transport {
            provider: self.name.clone(),
            detail: err.to_string(),
        }
    }
}

/// Extract the JSON object from a model reply, tolerating markdown fences.
pub(crate) fn parse_json_reply(provider: &str, content: &str) -> LlmResult<Value> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_start())
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|err| LlmError::Malformed {
        provider: provider.to_string(),
        detail: format!("reply is not valid JSON: {err}"),
    })
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, class: TaskClass) -> bool {
        self.classes.contains(&class)
    }

    async fn complete(&self, spec: &PromptSpec, deadline: Duration) -> LlmResult<Value> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": spec.system },
                { "role": "user", "content": spec.render_user_message() },
            ],
            "temperature": 0.3,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(deadline)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        if response.status().as_u16() == 429 {
            return Err(LlmError::Quota {
                provider: self.name.clone(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|err| self.transport(err))?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Malformed {
                provider: self.name.clone(),
                detail: err.to_string(),
            })?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::Refusal {
                provider: self.name.clone(),
            });
        }
        parse_json_reply(&self.name, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_markdown_fences() {
        let value =
            parse_json_reply("test", "```json\n{\"action\": \"buy\"}\n```").unwrap();
        assert_eq!(value["action"], "buy");
    }

    #[test]
    fn parse_accepts_bare_json() {
        let value = parse_json_reply("test", "{\"intent\": \"chat\"}").unwrap();
        assert_eq!(value["intent"], "chat");
    }

    #[test]
    fn parse_rejects_prose() {
        assert!(matches!(
            parse_json_reply("test", "I think you should buy."),
            Err(LlmError::Malformed { .. })
        ));
    }
}
