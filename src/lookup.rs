use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::LookupError;
use crate::handle::ProfileHandle;

/// Finds a social profile URL for a free-text query.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn search(&self, query: &str) -> Result<Option<String>, LookupError>;
}

/// Serper-style web search client. Returns the first organic result that is
/// a profile page.
pub struct SerperLookup {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Deserialize)]
struct OrganicResult {
    link: String,
}

impl SerperLookup {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Lookup for SerperLookup {
    async fn search(&self, query: &str) -> Result<Option<String>, LookupError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&serde_json::json!({ "q": query }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LookupError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await?;
        let parsed: SearchResponse = serde_json::from_str(&body)?;
        let hit = first_profile_link(parsed.organic.iter().map(|r| r.link.as_str()));
        debug!(query, hit = hit.as_deref().unwrap_or("-"), "lookup finished");
        Ok(hit)
    }
}

fn first_profile_link<'a>(links: impl Iterator<Item = &'a str>) -> Option<String> {
    links
        .filter(|l| l.contains("://"))
        .find(|l| ProfileHandle::parse(l).is_ok())
        .map(String::from)
}
