//! Generic JSON-over-HTTP provider.
//!
//! Bridges the four-operation contract to a remote HTTP endpoint speaking
//! a plain JSON protocol: `GET {base}/zones/{zone}/records` and `POST
//! {base}/zones/{zone}/records/{append|set|delete}` with the record list
//! as the body. Useful for custom southbound shims; real cloud adapters
//! register their own factories.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use stratus_common::types::ProviderRecord;
use stratus_common::{Error, Result};

use super::Provider;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    /// Base URL, e.g. `https://dns-bridge.internal/api`.
    base_url: String,

    /// Bearer token, sent as `Authorization: Bearer <token>` when set.
    #[serde(default)]
    token: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    25
}

pub(super) fn factory(config: &str) -> Result<Arc<dyn Provider>> {
    let cfg: Config = serde_json::from_str(config)
        .map_err(|e| Error::user(format!("parsing httpjson provider config: {e}")))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_seconds))
        .build()
        .map_err(|e| Error::provider(format!("building http client: {e}")))?;
    Ok(Arc::new(HttpJsonProvider {
        base_url: cfg.base_url.trim_end_matches('/').to_string(),
        token: cfg.token,
        client,
    }))
}

pub struct HttpJsonProvider {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpJsonProvider {
    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        req
    }

    async fn records_response(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<Vec<ProviderRecord>> {
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("{what}: zone unknown at provider")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::provider(format!("{what}: http {status}: {body}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::provider(format!("{what}: decoding response: {e}")))
    }

    async fn post_records(
        &self,
        zone: &str,
        op: &str,
        records: &[ProviderRecord],
    ) -> Result<Vec<ProviderRecord>> {
        let url = format!(
            "{}/zones/{}/records/{op}",
            self.base_url,
            zone.trim_end_matches('.')
        );
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(records)
            .send()
            .await
            .map_err(|e| Error::provider(format!("{op} records: {e}")))?;
        Self::records_response(resp, op).await
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    async fn get_records(&self, zone: &str) -> Result<Vec<ProviderRecord>> {
        let url = format!(
            "{}/zones/{}/records",
            self.base_url,
            zone.trim_end_matches('.')
        );
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| Error::provider(format!("get records: {e}")))?;
        Self::records_response(resp, "get").await
    }

    async fn append_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        self.post_records(zone, "append", &records).await
    }

    async fn set_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        self.post_records(zone, "set", &records).await
    }

    async fn delete_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        self.post_records(zone, "delete", &records).await
    }
}
