//! Policy router: picks a caching strategy for each GET request.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::RoutesConfig;
use crate::http::Request;

/// Caching strategy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// URL predicate of a routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
  /// Path is one of the listed paths exactly
  ExactPaths(BTreeSet<String>),
  /// Path starts with any of the prefixes
  PathPrefix(Vec<String>),
  /// Path equals the given path
  Path(String),
  /// Request declares it accepts HTML
  Navigation,
  Any,
}

impl Matcher {
  pub fn matches(&self, request: &Request) -> bool {
    let path = request.path();
    match self {
      Matcher::ExactPaths(paths) => paths.contains(&path),
      Matcher::PathPrefix(prefixes) => prefixes.iter().any(|p| path.starts_with(p.as_str())),
      Matcher::Path(p) => &path == p,
      Matcher::Navigation => request.accepts("text/html"),
      Matcher::Any => true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
  pub name: &'static str,
  pub matcher: Matcher,
  pub strategy: Strategy,
}

impl RoutingRule {
  pub fn new(name: &'static str, matcher: Matcher, strategy: Strategy) -> Self {
    Self {
      name,
      matcher,
      strategy,
    }
  }
}

/// Ordered rule list; the first matching rule wins.
///
/// The list is fixed once built and always ends in a catch-all rule.
#[derive(Debug, Clone)]
pub struct PolicyRouter {
  rules: Vec<RoutingRule>,
  fallback: RoutingRule,
}

impl PolicyRouter {
  pub fn new(rules: Vec<RoutingRule>) -> Self {
    Self {
      rules,
      fallback: RoutingRule::new("default", Matcher::Any, Strategy::NetworkFirst),
    }
  }

  /// Build the app's rule table.
  ///
  /// The weather path is checked before everything else: it is served
  /// stale-while-revalidate even though it also sits under an API prefix.
  pub fn from_config(routes: &RoutesConfig) -> Self {
    Self::new(vec![
      RoutingRule::new(
        "weather",
        Matcher::Path(routes.weather_path.clone()),
        Strategy::StaleWhileRevalidate,
      ),
      RoutingRule::new(
        "static-asset",
        Matcher::ExactPaths(routes.static_assets.iter().cloned().collect()),
        Strategy::CacheFirst,
      ),
      RoutingRule::new(
        "api",
        Matcher::PathPrefix(routes.api_prefixes.clone()),
        Strategy::NetworkFirst,
      ),
      RoutingRule::new("navigation", Matcher::Navigation, Strategy::NetworkFirst),
    ])
  }

  /// Classify a GET request. Pure; non-GET requests never reach the router.
  pub fn classify(&self, request: &Request) -> &RoutingRule {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(request))
      .unwrap_or(&self.fallback)
  }
}
