//! Fallback responses for when neither the network nor the cache can answer.

use bytes::Bytes;

use crate::config::RoutesConfig;
use crate::http::{Request, Response};

/// Marks a response as produced by the agent rather than the origin.
pub const OFFLINE_HEADER: &str = "X-Paceline-Offline";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline - Stride Training</title>
<style>
  body { font-family: system-ui, sans-serif; background: #0f172a; color: #e2e8f0;
         display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }
  main { text-align: center; max-width: 28rem; padding: 2rem; }
  h1 { font-size: 1.5rem; margin-bottom: 0.5rem; }
  p { color: #94a3b8; }
  button { margin-top: 1.5rem; padding: 0.75rem 1.5rem; border: 0; border-radius: 0.5rem;
           background: #38bdf8; color: #0f172a; font-weight: 600; cursor: pointer; }
</style>
</head>
<body>
<main>
  <h1>You're offline</h1>
  <p>Your training data will be back as soon as the connection returns.
     Workouts you log now are saved and will sync automatically.</p>
  <button type="button" onclick="window.location.reload()">Try again</button>
</main>
<script>
  window.addEventListener('online', function () { window.location.reload(); });
</script>
</body>
</html>
"#;

const OFFLINE_JSON: &str = r#"{"error":"offline","message":"Network unavailable. Data will refresh when the connection returns.","offline":true}"#;

/// Synthesizes the last-resort response. Never fails.
#[derive(Debug, Clone)]
pub struct OfflineResponder {
  api_prefixes: Vec<String>,
}

impl OfflineResponder {
  pub fn new(routes: &RoutesConfig) -> Self {
    Self {
      api_prefixes: routes.api_prefixes.clone(),
    }
  }

  fn is_api(&self, request: &Request) -> bool {
    let path = request.path();
    self.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
  }

  /// HTML requesters get a 200 offline page so navigation never errors;
  /// API callers get a 503 JSON body flagged `offline: true`; anything
  /// else gets a bare 503.
  pub fn synthesize(&self, request: &Request) -> Response {
    if request.accepts("text/html") {
      Response::new(200, Bytes::from_static(OFFLINE_PAGE.as_bytes()))
        .with_header("Content-Type", "text/html; charset=utf-8")
        .with_header(OFFLINE_HEADER, "1")
    } else if self.is_api(request) {
      Response::new(503, Bytes::from_static(OFFLINE_JSON.as_bytes()))
        .with_header("Content-Type", "application/json")
        .with_header(OFFLINE_HEADER, "1")
    } else {
      Response::new(503, Bytes::from_static(b"Offline"))
        .with_header("Content-Type", "text/plain")
        .with_header(OFFLINE_HEADER, "1")
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn responder() -> OfflineResponder {
    OfflineResponder::new(&RoutesConfig::default())
  }

  #[test]
  fn test_html_gets_200_page_with_reconnect_reload() {
    let request = Request::get("/statistics").with_header("Accept", "text/html");
    let response = responder().synthesize(&request);
    assert_eq!(response.status, 200);
    assert!(!response.body.is_empty());
    let page = std::str::from_utf8(&response.body).unwrap();
    assert!(page.contains("addEventListener('online'"));
    assert_eq!(response.headers.get("content-type"), Some("text/html; charset=utf-8"));
  }

  #[test]
  fn test_html_wins_even_on_api_path() {
    let request = Request::get("/api/rankings").with_header("Accept", "text/html");
    let response = responder().synthesize(&request);
    assert_eq!(response.status, 200);
  }

  #[test]
  fn test_api_gets_json_offline_flag() {
    let response = responder().synthesize(&Request::get("/api/progress-chart"));
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], serde_json::Value::Bool(true));
    assert_eq!(body["error"], "offline");
    assert!(body["message"].is_string());
  }

  #[test]
  fn test_other_requests_get_bare_503() {
    let response = responder().synthesize(&Request::get("/favicon.ico"));
    assert_eq!(response.status, 503);
    assert_eq!(response.headers.get(OFFLINE_HEADER), Some("1"));
  }
}
