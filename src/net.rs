//! HTTP transport shared by cache population and queue replay.
//!
//! The two traits are the seams the rest of the layer depends on; tests
//! substitute scripted implementations. An `Err` from either trait means the
//! network itself was unreachable. A completed exchange always comes back
//! `Ok`, carrying whatever status the backend chose.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{multipart, Client, Method, RequestBuilder};
use tracing::warn;
use url::Url;

use crate::cache::ResponseSnapshot;
use crate::config::BackendConfig;
use crate::queue::{FormField, MutationBody, QueuedMutation};

/// Read-path transport: populates the snapshot cache.
#[async_trait]
pub trait FetchTransport: Send + Sync {
  async fn fetch(
    &self,
    method: &Method,
    url: &str,
    headers: &[(String, String)],
    body: Option<&MutationBody>,
  ) -> Result<ResponseSnapshot>;
}

/// Replay-path transport: delivers queued mutations.
#[async_trait]
pub trait ReplayTransport: Send + Sync {
  async fn replay(&self, mutation: &QueuedMutation) -> Result<u16>;
}

/// Transport backed by a shared reqwest client.
///
/// No per-request timeout is imposed beyond the client defaults; a hung
/// replay runs to the transport's own limit.
#[derive(Clone)]
pub struct HttpClient {
  client: Client,
  base_url: Url,
}

impl HttpClient {
  pub fn new(config: &BackendConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid backend URL {}: {}", config.url, e))?;

    let client = Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  /// Resolve a possibly-relative URL against the backend base.
  fn resolve(&self, url: &str) -> Result<Url> {
    let resolved = if url.contains("://") {
      Url::parse(url)
    } else {
      self.base_url.join(url)
    };

    resolved.map_err(|e| eyre!("Invalid request URL {}: {}", url, e))
  }

  fn build_request(
    &self,
    method: &Method,
    url: &str,
    headers: &[(String, String)],
    body: Option<&MutationBody>,
  ) -> Result<RequestBuilder> {
    let url = self.resolve(url)?;
    let is_form = matches!(body, Some(MutationBody::Form { .. }));

    let mut request = self
      .client
      .request(method.clone(), url)
      .headers(header_map(headers, is_form));

    request = match body {
      None => request,
      Some(MutationBody::Json { text }) | Some(MutationBody::Text { text }) => {
        request.body(text.clone())
      }
      Some(MutationBody::Form { fields }) => request.multipart(build_form(fields)),
    };

    Ok(request)
  }
}

#[async_trait]
impl FetchTransport for HttpClient {
  async fn fetch(
    &self,
    method: &Method,
    url: &str,
    headers: &[(String, String)],
    body: Option<&MutationBody>,
  ) -> Result<ResponseSnapshot> {
    let response = self
      .build_request(method, url, headers, body)?
      .send()
      .await
      .map_err(|e| eyre!("Network unreachable for {} {}: {}", method, url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body for {}: {}", url, e))?
      .to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}

#[async_trait]
impl ReplayTransport for HttpClient {
  async fn replay(&self, mutation: &QueuedMutation) -> Result<u16> {
    let method: Method = mutation
      .method
      .parse()
      .map_err(|_| eyre!("Invalid method in queue entry {}: {}", mutation.id, mutation.method))?;

    let response = self
      .build_request(&method, &mutation.url, &mutation.headers, mutation.body.as_ref())?
      .send()
      .await
      .map_err(|e| eyre!("Replay of {} {} failed: {}", mutation.method, mutation.url, e))?;

    Ok(response.status().as_u16())
  }
}

/// Convert captured headers back into a header map.
///
/// For multipart bodies the original content headers are dropped: the
/// reconstructed form carries a fresh boundary and length.
fn header_map(headers: &[(String, String)], skip_content_headers: bool) -> HeaderMap {
  let mut map = HeaderMap::new();

  for (name, value) in headers {
    let name = match name.parse::<HeaderName>() {
      Ok(name) => name,
      Err(_) => {
        warn!(%name, "skipping invalid header name");
        continue;
      }
    };
    if skip_content_headers && (name == CONTENT_TYPE || name == CONTENT_LENGTH) {
      continue;
    }
    match HeaderValue::from_str(value) {
      Ok(value) => {
        map.append(name, value);
      }
      Err(_) => warn!(%name, "skipping invalid header value"),
    }
  }

  map
}

/// Rebuild a multipart form from stored field descriptors, in submission
/// order.
fn build_form(fields: &[FormField]) -> multipart::Form {
  let mut form = multipart::Form::new();

  for field in fields {
    form = match field {
      FormField::Value { name, value } => form.text(name.clone(), value.clone()),
      FormField::File {
        name,
        file_name,
        content,
        ..
      } => form.part(
        name.clone(),
        multipart::Part::bytes(content.clone()).file_name(file_name.clone()),
      ),
    };
  }

  form
}
