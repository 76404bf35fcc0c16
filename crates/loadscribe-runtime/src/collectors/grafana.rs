//! Grafana: data-source proxy for metrics, and the panel renderer.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use loadscribe_core::config::{AuthMethod, DatasourceRef, GrafanaConfig, GrafanaProxyConfig};
use loadscribe_core::QueryResponse;

use super::{range_params, CollectorError, MetricsSource};
use crate::cache::DatasourceCache;
use crate::http;
use crate::providers::{ApiCredential, CredentialSource};

/// How requests to Grafana authenticate.
#[derive(Debug)]
pub enum GrafanaCredentials {
    Basic {
        username: String,
        password: ApiCredential,
    },
    Bearer(ApiCredential),
    Anonymous,
}

impl GrafanaCredentials {
    /// Credentials for the renderer: the API key when set, else basic auth.
    pub fn from_grafana_config(config: &GrafanaConfig) -> Self {
        match config.api_key.as_ref().filter(|k| !k.expose_secret().is_empty()) {
            Some(key) => GrafanaCredentials::Bearer(ApiCredential::from_config_secret(
                key,
                "Grafana API key",
            )),
            None if !config.username.is_empty() => GrafanaCredentials::Basic {
                username: config.username.clone(),
                password: ApiCredential::from_config_secret(&config.password, "Grafana password"),
            },
            None => GrafanaCredentials::Anonymous,
        }
    }

    /// Credentials for the data-source proxy, per `auth.method`.
    pub fn from_proxy_config(config: &GrafanaProxyConfig) -> Self {
        let auth = &config.auth;
        match auth.method {
            AuthMethod::Bearer => GrafanaCredentials::Bearer(ApiCredential::new(
                auth.token.expose_secret(),
                CredentialSource::Config,
                "Grafana token",
            )),
            AuthMethod::Basic if auth.username.is_empty() => GrafanaCredentials::Anonymous,
            AuthMethod::Basic => GrafanaCredentials::Basic {
                username: auth.username.clone(),
                password: ApiCredential::from_config_secret(&auth.password, "Grafana password"),
            },
        }
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            GrafanaCredentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose()))
            }
            GrafanaCredentials::Bearer(token) => request.bearer_auth(token.expose()),
            GrafanaCredentials::Anonymous => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatasourceInfo {
    id: u64,
}

/// Prometheus queries forwarded through `/api/datasources/proxy/{id}`.
#[derive(Debug)]
pub struct GrafanaProxySource {
    base_url: String,
    credentials: GrafanaCredentials,
    datasource: DatasourceRef,
    client: reqwest::Client,
    cache: DatasourceCache,
}

impl GrafanaProxySource {
    pub fn from_config(
        config: &GrafanaProxyConfig,
        client: reqwest::Client,
        cache: DatasourceCache,
    ) -> Result<Self, CollectorError> {
        if config.base_url.is_empty() {
            return Err(CollectorError::NotConfigured(
                "metrics_source.grafana.base_url is empty".to_string(),
            ));
        }
        if config.datasource.is_empty() {
            return Err(CollectorError::NotConfigured(
                "metrics_source.grafana.datasource needs an id, uid or name".to_string(),
            ));
        }

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: GrafanaCredentials::from_proxy_config(config),
            datasource: config.datasource.clone(),
            client,
            cache,
        })
    }

    /// Resolve the data-source id: explicit id, else by uid, else by name.
    pub async fn datasource_id(&self) -> Result<u64, CollectorError> {
        if let Some(id) = self.datasource.id {
            return Ok(id);
        }
        self.cache
            .get_or_resolve(&self.base_url, &self.datasource, self.lookup_datasource())
            .await
    }

    async fn lookup_datasource(&self) -> Result<u64, CollectorError> {
        let lookup = match (&self.datasource.uid, &self.datasource.name) {
            (Some(uid), _) if !uid.is_empty() => format!("uid/{}", uid),
            (_, Some(name)) if !name.is_empty() => format!("name/{}", name),
            _ => return Err(CollectorError::DatasourceNotFound("no id, uid or name".to_string())),
        };

        let url = format!("{}/api/datasources/{}", self.base_url, lookup);
        let response = self
            .credentials
            .apply(self.client.get(&url))
            .send()
            .await
            .map_err(|e| CollectorError::http("grafana", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CollectorError::DatasourceNotFound(lookup));
        }
        let response = http::check_status(response, "grafana").await?;
        let info: DatasourceInfo = response
            .json()
            .await
            .map_err(|e| CollectorError::invalid("grafana", e))?;

        info!(datasource = %lookup, id = info.id, "Resolved Grafana data source");
        Ok(info.id)
    }
}

#[async_trait]
impl MetricsSource for GrafanaProxySource {
    async fn query_range(
        &self,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step: Duration,
    ) -> Result<QueryResponse, CollectorError> {
        let id = self.datasource_id().await?;
        let url = format!(
            "{}/api/datasources/proxy/{}/api/v1/query_range",
            self.base_url, id
        );
        debug!(query, datasource_id = id, "Grafana proxy query_range");

        let response = self
            .credentials
            .apply(self.client.get(&url))
            .query(&range_params(query, start_ms, end_ms, step))
            .send()
            .await
            .map_err(|e| CollectorError::http("grafana proxy", e))?;
        let response = http::check_status(response, "grafana proxy").await?;

        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::http("grafana proxy", e))?;
        QueryResponse::from_json(&body).map_err(|e| CollectorError::invalid("grafana proxy", e))
    }

    fn name(&self) -> &str {
        "grafana_proxy"
    }
}

/// Downloads rendered panel images.
#[derive(Debug)]
pub struct GrafanaRenderer {
    base_url: String,
    credentials: GrafanaCredentials,
    client: reqwest::Client,
}

impl GrafanaRenderer {
    pub fn new(base_url: &str, credentials: GrafanaCredentials, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            client,
        }
    }

    pub fn from_config(config: &GrafanaConfig, client: reqwest::Client) -> Self {
        Self::new(
            &config.base_url,
            GrafanaCredentials::from_grafana_config(config),
            client,
        )
    }

    /// Full render URL for a panel path and time range.
    pub fn render_url(&self, path: &str, start_ms: i64, end_ms: i64) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}from={}&to={}",
            self.base_url, path, separator, start_ms, end_ms
        )
    }

    /// Download the rendered image of one panel.
    pub async fn render_panel(
        &self,
        path: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<u8>, CollectorError> {
        let url = self.render_url(path, start_ms, end_ms);
        debug!(%url, "Rendering Grafana panel");

        let response = self
            .credentials
            .apply(self.client.get(&url))
            .send()
            .await
            .map_err(|e| CollectorError::http("grafana renderer", e))?;
        let response = http::check_status(response, "grafana renderer").await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CollectorError::http("grafana renderer", e))?;
        Ok(bytes.to_vec())
    }
}
