//! OpenAI-compatible chat-completions client (OpenRouter by default).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use ideaforge_shared::{GeneratorConfig, IdeaForgeError, Result};

use crate::http::{build_client, decode_json, endpoint, transport_error};
use crate::{Generation, GenerationProvider, GenerationRequest, TokenUsage};

/// Long-context generator speaking the chat-completions protocol.
pub struct OpenRouterGenerator {
    client: Client,
    name: String,
    url: String,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            client: build_client(&name, timeout_secs)?,
            url: endpoint(base_url, "chat/completions"),
            name,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                IdeaForgeError::config(format!(
                    "generator API key not found. Set the {} environment variable.",
                    config.api_key_env
                ))
            })?;
        Self::new(
            config.provider.clone(),
            &config.base_url,
            api_key,
            config.model.clone(),
            config.timeout_secs,
        )
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl GenerationProvider for OpenRouterGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(provider = %self.name, model = %self.model, prompt_chars = request.prompt.len()))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, &self.url, e))?;

        let parsed: ChatResponse = decode_json(&self.name, &self.url, response).await?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                IdeaForgeError::malformed(format!("{} returned no completion text", self.name))
            })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            "generation complete"
        );

        Ok(Generation {
            text,
            usage,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: "You are a research assistant.".into(),
            prompt: "[P1] Paper".into(),
            max_output_tokens: 100,
            temperature: 0.2,
        }
    }

    async fn generator(server: &MockServer) -> OpenRouterGenerator {
        OpenRouterGenerator::new("openrouter", &server.uri(), "sk-test", "test/model", 5).unwrap()
    }

    #[tokio::test]
    async fn returns_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test/model",
                "choices": [{"message": {"role": "assistant", "content": "[]"}}],
                "usage": {"prompt_tokens": 1200, "completion_tokens": 40}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generation = generator(&server).await.generate(&request()).await.unwrap();
        assert_eq!(generation.text, "[]");
        assert_eq!(generation.usage.input_tokens, 1200);
        assert_eq!(generation.usage.output_tokens, 40);
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = generator(&server).await.generate(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = generator(&server).await.generate(&request()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::PermanentProvider { .. }));
    }

    #[tokio::test]
    async fn empty_choices_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = generator(&server).await.generate(&request()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::MalformedOutput { .. }));
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let config = GeneratorConfig {
            api_key_env: "IF_TEST_MISSING_GENERATOR_KEY".into(),
            ..GeneratorConfig::default()
        };
        let err = OpenRouterGenerator::from_config(&config).err().unwrap();
        assert!(matches!(err, IdeaForgeError::Config { .. }));
    }
}
