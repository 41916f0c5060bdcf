//! Code-generation helper: ask a chat-completions model for Python source to test.

use crate::config::OpenAiConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const TEMPERATURE: f32 = 0.6;
const MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CodeKind {
    Function,
    Class,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Function => "function",
            CodeKind::Class => "class",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Prompt is required")]
    EmptyPrompt,
    #[error("OPENAI_API_KEY not configured. Set it in the environment.")]
    MissingKey,
    #[error("Invalid OpenAI API key. Please check OPENAI_API_KEY.")]
    InvalidKey,
    #[error("{0}")]
    Quota(String),
    #[error("Model not found: {0}. Please check your OPENAI_MODEL setting.")]
    ModelNotFound(String),
    #[error("Cannot connect to OpenAI API. Please check your internet connection.")]
    Unreachable(#[source] reqwest::Error),
    #[error("Failed to generate code: {0}")]
    Api(String),
    #[error("Failed to generate code: unexpected response body")]
    Decode(#[source] reqwest::Error),
    #[error("No code generated in response")]
    EmptyResponse,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ProviderError {
    error: ProviderErrorBody,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    message: Option<String>,
}

pub struct CodegenClient {
    http: reqwest::Client,
    cfg: OpenAiConfig,
}

impl CodegenClient {
    pub fn new(cfg: OpenAiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("veritas-pytest/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http, cfg })
    }

    /// Generate Python source for `prompt`, with any markdown fence removed.
    pub async fn generate(&self, prompt: &str, kind: CodeKind) -> Result<String, CodegenError> {
        if prompt.trim().is_empty() {
            return Err(CodegenError::EmptyPrompt);
        }
        let key = self
            .cfg
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(CodegenError::MissingKey)?;

        let system = format!(
            "You are an expert Python developer. Generate clean, well-documented Python {} code \
             based on user descriptions. Return ONLY the code, no explanations or markdown formatting.",
            kind.as_str()
        );
        let body = ChatRequest {
            model: &self.cfg.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        tracing::info!(model = %self.cfg.model, kind = kind.as_str(), prompt_len = prompt.len(), "requesting code");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(CodegenError::Unreachable)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .ok()
                .and_then(|b| serde_json::from_str::<ProviderError>(&b).ok())
                .and_then(|e| e.error.message);
            tracing::warn!(status = status.as_u16(), "code generation failed");
            return Err(match status.as_u16() {
                401 => CodegenError::InvalidKey,
                429 => CodegenError::Quota(message.unwrap_or_else(|| {
                    "OpenAI API quota exceeded. Please check your plan and billing details.".into()
                })),
                404 => CodegenError::ModelNotFound(self.cfg.model.clone()),
                _ => CodegenError::Api(message.unwrap_or_else(|| status.to_string())),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(CodegenError::Decode)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let code = unwrap_code_fence(&content);
        if code.trim().is_empty() {
            return Err(CodegenError::EmptyResponse);
        }
        Ok(code)
    }
}

/// Strip a surrounding markdown code fence, with or without a language tag.
pub fn unwrap_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => "",
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim_matches('\n').to_string()
}
