use color_eyre::{eyre::eyre, Result};
use tracing::debug;
use url::Url;

use crate::backend::api_types::{decode_rows, ID_COLUMN};
use crate::backend::registry::ResourceRegistry;
use crate::backend::types::{FetchRequest, Record, ResourceType};
use crate::config::{BackendConfig, Config};

/// REST client for the hosted backend (PostgREST-style table endpoints).
#[derive(Clone)]
pub struct BackendClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  schema: Option<String>,
}

impl BackendClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_key(&config.backend, api_key)
  }

  pub fn with_key(backend: &BackendConfig, api_key: String) -> Result<Self> {
    // Url::join drops the last path segment unless it ends with '/'
    let mut raw = backend.url.trim().to_string();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    let base =
      Url::parse(&raw).map_err(|e| eyre!("Invalid backend url {}: {}", backend.url, e))?;

    let http = reqwest::Client::builder()
      .user_agent(concat!("campus-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      schema: backend.schema.clone(),
    })
  }

  /// Build the table URL for a request.
  pub fn request_url(&self, request: &FetchRequest) -> Result<Url> {
    let mut url = self
      .base
      .join(&format!("rest/v1/{}", request.resource.as_str()))
      .map_err(|e| eyre!("Failed to build url for {}: {}", request.resource, e))?;

    {
      let mut query = url.query_pairs_mut();
      query.append_pair("select", "*");
      if let Some(ids) = &request.ids {
        query.append_pair(ID_COLUMN, &in_filter(ids));
      }
      if let Some(limit) = request.limit {
        query.append_pair("limit", &limit.to_string());
      }
    }

    Ok(url)
  }

  /// Fetch rows for one resource type.
  pub async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>> {
    if matches!(&request.ids, Some(ids) if ids.is_empty()) {
      return Ok(Vec::new());
    }

    let url = self.request_url(&request)?;
    debug!(resource = %request.resource, %url, "fetching rows");

    let mut builder = self
      .http
      .get(url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
      .header("Accept", "application/json");
    if let Some(schema) = &self.schema {
      builder = builder.header("Accept-Profile", schema);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.resource, e))?
      .error_for_status()
      .map_err(|e| eyre!("Backend rejected fetch of {}: {}", request.resource, e))?;

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read {} response: {}", request.resource, e))?;

    decode_rows(&body).map_err(|e| eyre!("Malformed {} response: {}", request.resource, e))
  }

  /// A registry with every whitelisted resource type served by this client.
  pub fn registry(&self) -> ResourceRegistry {
    let mut registry = ResourceRegistry::new();
    for resource in ResourceType::ALL {
      let client = self.clone();
      registry.register(*resource, move |request| {
        let client = client.clone();
        async move { client.fetch(request).await }
      });
    }
    registry
  }
}

/// PostgREST `in.(...)` filter with each value double-quoted.
fn in_filter(ids: &[String]) -> String {
  let quoted: Vec<String> = ids
    .iter()
    .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
    .collect();
  format!("in.({})", quoted.join(","))
}
