//! HTTP client for the lightweight literature-search service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use ideaforge_shared::{LiteratureConfig, Result};

use crate::LiteratureSearch;
use crate::http::{build_client, decode_json, endpoint, transport_error};

const PROVIDER: &str = "literature";

/// Queries `GET /v1/search?q=<title>` and reads the `total` field.
pub struct HttpLiteratureSearch {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    total: usize,
}

impl HttpLiteratureSearch {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, timeout_secs)?,
            url: endpoint(base_url, "v1/search"),
        })
    }

    pub fn from_config(config: &LiteratureConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout_secs)
    }
}

#[async_trait]
impl LiteratureSearch for HttpLiteratureSearch {
    #[instrument(skip_all)]
    async fn count_matches(&self, title: &str) -> Result<usize> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("q", title)])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &self.url, e))?;
        let parsed: SearchResponse = decode_json(PROVIDER, &self.url, response).await?;
        Ok(parsed.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn counts_matches_for_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "Graph forecasting"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"total": 7})))
            .mount(&server)
            .await;

        let search = HttpLiteratureSearch::new(&server.uri(), 5).unwrap();
        assert_eq!(search.count_matches("Graph forecasting").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn garbage_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let search = HttpLiteratureSearch::new(&server.uri(), 5).unwrap();
        assert!(search.count_matches("x").await.is_err());
    }
}
