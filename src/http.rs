//! Explicit HTTP request/response model handled by the agent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Base used to resolve relative request URLs when only a path is known.
const RELATIVE_BASE: &str = "http://localhost/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
  Other(String),
}

impl Method {
  pub fn parse(s: &str) -> Self {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Method::Get,
      "HEAD" => Method::Head,
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "PATCH" => Method::Patch,
      "DELETE" => Method::Delete,
      "OPTIONS" => Method::Options,
      other => Method::Other(other.to_string()),
    }
  }

  /// Methods whose failed requests are queued for replay.
  pub fn is_mutating(&self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Patch | Method::Delete)
  }

  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
      Method::Other(s) => s,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace any existing value for `name`.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }

  /// Add a value, keeping any existing ones (`Set-Cookie`, `Vary`, ...).
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  /// Every value of `name`, in insertion order.
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .0
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (k, v) in iter {
      headers.append(k, v);
    }
    headers
  }
}

/// An intercepted outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  /// Absolute URL or origin-relative path (query string included).
  pub url: String,
  pub headers: Headers,
  pub body: Bytes,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Headers::new(),
      body: Bytes::new(),
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
    Self {
      body: body.into(),
      ..Self::new(Method::Post, url)
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.set(name, value);
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  fn parsed_url(&self) -> Option<Url> {
    Url::parse(&self.url).ok().or_else(|| {
      Url::parse(RELATIVE_BASE)
        .ok()
        .and_then(|base| base.join(&self.url).ok())
    })
  }

  /// URL path without query string, e.g. `/api/weather`.
  pub fn path(&self) -> String {
    self
      .parsed_url()
      .map(|u| u.path().to_string())
      .unwrap_or_else(|| self.url.clone())
  }

  /// Path with query string, fragment dropped.
  pub fn path_and_query(&self) -> String {
    match self.parsed_url() {
      Some(u) => match u.query() {
        Some(q) => format!("{}?{}", u.path(), q),
        None => u.path().to_string(),
      },
      None => self.url.clone(),
    }
  }

  /// Whether the requester declares it accepts `mime` (e.g. `text/html`).
  pub fn accepts(&self, mime: &str) -> bool {
    self
      .headers
      .get("accept")
      .map(|accept| {
        accept
          .split(',')
          .map(|part| part.split(';').next().unwrap_or("").trim())
          .any(|part| part.eq_ignore_ascii_case(mime))
      })
      .unwrap_or(false)
  }
}

/// A captured or synthesized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.set(name, value);
    self
  }

  /// Only a plain 200 counts as cacheable success; redirects and error
  /// pages never enter the cache.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}
