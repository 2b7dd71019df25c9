//! HTTP client for the external novelty-check service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use ideaforge_shared::{IdeaForgeError, NoveltyConfig, Result};

use crate::http::{build_client, decode_json, endpoint, transport_error};
use crate::{NoveltyAssessment, NoveltyProvider, RelatedWorkSummary};

/// Posts `{"query": ...}` to `/v1/novelty` and `/v1/related-work`.
pub struct HttpNoveltyProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
}

impl HttpNoveltyProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            client: build_client(&name, timeout_secs)?,
            name,
            base_url: base_url.into(),
            api_key,
        })
    }

    /// Build from config. The API key is optional for self-hosted services.
    pub fn from_config(config: &NoveltyConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(
            config.provider.clone(),
            config.base_url.clone(),
            api_key,
            config.timeout_secs,
        )
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, query: &str) -> Result<T> {
        let url = endpoint(&self.base_url, path);
        let mut request = self.client.post(&url).json(&QueryBody { query });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, &url, e))?;
        decode_json(&self.name, &url, response).await
    }
}

#[async_trait]
impl NoveltyProvider for HttpNoveltyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    async fn check_novelty(&self, query: &str) -> Result<NoveltyAssessment> {
        let assessment: NoveltyAssessment = self.post("v1/novelty", query).await?;
        if !(0.0..=1.0).contains(&assessment.confidence) {
            return Err(IdeaForgeError::malformed(format!(
                "{} returned confidence {} outside [0, 1]",
                self.name, assessment.confidence
            )));
        }
        debug!(verdict = assessment.verdict.as_str(), confidence = assessment.confidence, "novelty verdict");
        Ok(assessment)
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    async fn summarize_related_work(&self, query: &str) -> Result<RelatedWorkSummary> {
        self.post("v1/related-work", query).await
    }
}
