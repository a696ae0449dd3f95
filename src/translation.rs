//! Client for the OpenAI-compatible chat completions endpoint used to
//! translate batches of source texts.

use crate::retry::RetryAction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub api_key: Option<String>,
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub api_url: String,
    pub model: String,
    pub request_timeout: Duration,
    /// Language the source texts are written in
    pub site_language: String,
    pub max_completion_tokens: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(60),
            site_language: "en".to_string(),
            max_completion_tokens: 4000,
        }
    }
}

/// Failure of one translation call. The variant decides retry behavior.
#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("rate limited by translation API")]
    RateLimited { retry_after: Option<Duration> },
    #[error("translation endpoint {url} not found; check OPENAI_API_URL")]
    NotFound { url: String },
    #[error("translation API error ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("network error calling translation API: {0}")]
    Network(String),
    #[error("invalid translation response: {0}")]
    Validation(String),
}

impl TranslatorError {
    pub fn retry_action(&self) -> RetryAction {
        match self {
            TranslatorError::RateLimited { retry_after } => RetryAction::Wait(*retry_after),
            TranslatorError::NotFound { .. } => RetryAction::Abort,
            TranslatorError::Http { .. }
            | TranslatorError::Network(_)
            | TranslatorError::Validation(_) => RetryAction::Retry,
        }
    }
}

/// OpenAI Chat Completion request for translation
#[derive(Debug, Serialize)]
struct TranslationRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

/// Check if a model is a reasoning model that doesn't support temperature
fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

fn build_system_prompt(source_language: &str, target_langs: &[String]) -> String {
    format!(
        r#"You are a professional translator for course content. Translate each input text from language "{}" into every one of these language codes: {}.

## Rules
- Preserve HTML tags, attributes, entities and placeholders such as {{$a}} exactly.
- Keep URLs, code and proper names unchanged.
- Translate meaning, not word by word; keep the tone of the original.
- Never merge, split, reorder or skip texts.

## Output
Respond with JSON only: an array with exactly one object per input text, in input order. Each object has one string property per language code."#,
        source_language,
        target_langs.join(", ")
    )
}

fn build_user_prompt(texts: &[String], target_langs: &[String]) -> String {
    let keys = target_langs
        .iter()
        .map(|l| format!("\"{}\": \"...\"", l))
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        "Translate these {} texts. Each text is a JSON string.\n\n",
        texts.len()
    );
    for (i, text) in texts.iter().enumerate() {
        let encoded = serde_json::to_string(text).unwrap_or_else(|_| format!("{:?}", text));
        prompt.push_str(&format!("{}. {}\n", i + 1, encoded));
    }
    prompt.push_str(&format!(
        "\nReturn a JSON array of exactly {} objects shaped like {{{}}}.",
        texts.len(),
        keys
    ));
    prompt
}

/// Strip a ```json ... ``` fence if the model added one.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return trimmed,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse the model output into one language map per input text.
///
/// Anything but an array of exactly `expected` objects holding a string for
/// every target language is rejected as a whole.
pub(crate) fn parse_batch_response(
    content: &str,
    expected: usize,
    target_langs: &[String],
) -> Result<Vec<HashMap<String, String>>, TranslatorError> {
    let json = strip_code_fence(content);
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| TranslatorError::Validation(format!("response is not JSON: {}", e)))?;

    let items = value
        .as_array()
        .ok_or_else(|| TranslatorError::Validation("response is not a JSON array".to_string()))?;
    if items.len() != expected {
        return Err(TranslatorError::Validation(format!(
            "expected {} translations, got {}",
            expected,
            items.len()
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| -> Result<HashMap<String, String>, TranslatorError> {
            let object = item.as_object().ok_or_else(|| {
                TranslatorError::Validation(format!("item {} is not an object", i + 1))
            })?;
            target_langs
                .iter()
                .map(|lang| match object.get(lang).and_then(|v| v.as_str()) {
                    Some(text) => Ok((lang.clone(), text.to_string())),
                    None => Err(TranslatorError::Validation(format!(
                        "item {} has no \"{}\" translation",
                        i + 1,
                        lang
                    ))),
                })
                .collect()
        })
        .collect()
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Clone)]
pub struct Translator {
    client: reqwest::Client,
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        let base = self.config.api_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }

    /// Check everything a call needs before any batch work starts.
    pub fn preflight(&self, target_langs: &[String]) -> Result<(), String> {
        if self.config.api_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err("No translation API key configured; set OPENAI_API_KEY".to_string());
        }
        let url = self.config.api_url.trim();
        if url.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!(
                "Translation endpoint {:?} is not an http(s) URL; set OPENAI_API_URL",
                self.config.api_url
            ));
        }
        if self.config.model.trim().is_empty() {
            return Err("No translation model configured; set OPENAI_MODEL".to_string());
        }
        if target_langs.is_empty() {
            return Err("No target languages selected; set TARGET_LANGUAGES".to_string());
        }
        Ok(())
    }

    /// Translate `texts` into every language of `target_langs` with one call.
    ///
    /// The result has one map per input text, in input order.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        target_langs: &[String],
    ) -> Result<Vec<HashMap<String, String>>, TranslatorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Reasoning models need higher token limits and don't support temperature
        let is_reasoning = is_reasoning_model(&self.config.model);
        let request = TranslationRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: build_system_prompt(&self.config.site_language, target_langs),
                },
                Message {
                    role: "user".to_string(),
                    content: build_user_prompt(texts, target_langs),
                },
            ],
            max_completion_tokens: if is_reasoning {
                16000
            } else {
                self.config.max_completion_tokens
            },
            temperature: if is_reasoning { None } else { Some(0.2) },
            reasoning_effort: if is_reasoning {
                Some("low".to_string())
            } else {
                None
            },
        };

        let url = self.endpoint();
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.as_deref().unwrap_or_default()),
            )
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| TranslatorError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TranslatorError::RateLimited {
                retry_after: parse_retry_after(&response),
            });
        }
        if status.as_u16() == 404 {
            return Err(TranslatorError::NotFound { url });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(TranslatorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslatorError::Validation(format!("unreadable response body: {}", e)))?;
        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| TranslatorError::Validation("response contained no choices".to_string()))?;

        debug!(
            "Translation API answered {} texts x {} languages ({} chars)",
            texts.len(),
            target_langs.len(),
            content.len()
        );
        parse_batch_response(content, texts.len(), target_langs)
    }
}
