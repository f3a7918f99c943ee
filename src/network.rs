//! Network collaborator: whatever actually performs HTTP requests.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::{Error, NetworkError, Result};
use crate::http::{Headers, Method, Request, Response};

/// Performs a request against the network.
///
/// Any response that arrives, whatever its status, is `Ok`. Only transport
/// failures (including timeouts) are `Err`.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: Request) -> std::result::Result<Response, NetworkError>;
}

/// Network backed by `reqwest`; relative URLs resolve against the origin.
#[derive(Clone)]
pub struct ReqwestNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl ReqwestNetwork {
  pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
    let origin = Url::parse(origin)
      .map_err(|e| Error::Config(format!("Invalid origin '{}': {}", origin, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client, origin })
  }

  fn resolve(&self, url: &str) -> std::result::Result<Url, NetworkError> {
    self
      .origin
      .join(url)
      .map_err(|e| NetworkError::new(format!("Invalid request URL '{}': {}", url, e)))
  }
}

fn to_reqwest_method(method: &Method) -> std::result::Result<reqwest::Method, NetworkError> {
  reqwest::Method::from_bytes(method.as_str().as_bytes())
    .map_err(|e| NetworkError::new(format!("Invalid method {}: {}", method, e)))
}

fn network_error(e: reqwest::Error) -> NetworkError {
  if e.is_timeout() {
    NetworkError::timeout(e.to_string())
  } else {
    NetworkError::new(e.to_string())
  }
}

#[async_trait]
impl Network for ReqwestNetwork {
  async fn fetch(&self, request: Request) -> std::result::Result<Response, NetworkError> {
    let url = self.resolve(&request.url)?;
    let mut builder = self
      .client
      .request(to_reqwest_method(&request.method)?, url);

    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body);
    }

    let response = builder.send().await.map_err(network_error)?;
    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      // Non-ASCII values can't be represented; skip them
      if let Ok(value) = value.to_str() {
        headers.append(name.as_str(), value);
      }
    }
    let body = response.bytes().await.map_err(network_error)?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
