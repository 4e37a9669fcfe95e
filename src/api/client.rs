use futures::FutureExt;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::api_types::{Method, RequestDescriptor};
use crate::config::ApiConfig;
use crate::error::{CacheError, Result};

/// A boxed future that resolves to a transport outcome
pub type BoxFuture<T> = futures::future::BoxFuture<'static, Result<T>>;

/// Performs the network calls described by operation definitions.
///
/// The returned future must be `'static`: it runs on a spawned task while the
/// cache keeps serving reads.
pub trait Transport: Send + Sync {
  fn execute(&self, request: RequestDescriptor) -> BoxFuture<Value>;
}

/// REST transport over reqwest
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let mut base = config.base_url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url = Url::parse(&base)
      .map_err(|e| CacheError::Config(format!("invalid base_url {}: {}", config.base_url, e)))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("restq/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token: config.api_token(),
    })
  }

  /// Absolute URL for a request, including its query string.
  pub fn url_for(&self, request: &RequestDescriptor) -> Result<Url> {
    let mut url = self
      .base_url
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| CacheError::Config(format!("invalid path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
  }
}

fn reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

impl Transport for HttpTransport {
  fn execute(&self, request: RequestDescriptor) -> BoxFuture<Value> {
    let url = match self.url_for(&request) {
      Ok(url) => url,
      Err(e) => return futures::future::ready(Err(e)).boxed(),
    };
    debug!(method = %request.method, url = %url, "sending request");

    let mut builder = self.client.request(reqwest_method(request.method), url);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    async move {
      let response = builder
        .send()
        .await
        .map_err(|e| CacheError::network(e.to_string()))?;

      let status = response.status();
      let bytes = response
        .bytes()
        .await
        .map_err(|e| CacheError::network(format!("failed to read response body: {}", e)))?;
      decode_response(status, &bytes)
    }
    .boxed()
  }
}

/// Turn a status and body into the outcome a query or mutation sees.
///
/// Non-2xx statuses fail with the body as message; an empty body is `Null`.
fn decode_response(status: StatusCode, body: &[u8]) -> Result<Value> {
  if !status.is_success() {
    return Err(CacheError::Network {
      status: Some(status.as_u16()),
      message: String::from_utf8_lossy(body).trim().to_string(),
    });
  }

  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(Value::Null);
  }
  Ok(serde_json::from_slice(body)?)
}
