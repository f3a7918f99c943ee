//! Install / activate lifecycle and client control.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::cache::{CacheNamespace, CacheStore, Generation, RequestKey};
use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::http::Request;
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for older clients to go away
  Installed,
  Activating,
  Activated,
}

/// An open page the agent may or may not control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: String,
  pub url: String,
  /// Cache generation version controlling this client
  pub controller: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<CacheNamespace>,
  pub claimed: usize,
}

pub struct LifecycleController {
  generation: Generation,
  state: RwLock<LifecycleState>,
  clients: RwLock<HashMap<String, Client>>,
  skip_waiting: AtomicBool,
  claim_clients: bool,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
  lock
    .read()
    .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
  lock
    .write()
    .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
}

impl LifecycleController {
  pub fn new(generation: Generation, config: &LifecycleConfig) -> Self {
    Self {
      generation,
      state: RwLock::new(LifecycleState::Installing),
      clients: RwLock::new(HashMap::new()),
      skip_waiting: AtomicBool::new(config.skip_waiting),
      claim_clients: config.claim_clients,
    }
  }

  pub fn state(&self) -> Result<LifecycleState> {
    Ok(*read(&self.state)?)
  }

  fn set_state(&self, state: LifecycleState) -> Result<()> {
    let mut guard = write(&self.state)?;
    debug!(from = ?*guard, to = ?state, "lifecycle transition");
    *guard = state;
    Ok(())
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// Pre-cache every static asset into the static namespace.
  ///
  /// All assets are fetched first, then written in a single batch. If any
  /// fetch fails, returns a non-200 status, or the batch write fails,
  /// nothing is stored and the state stays `Installing`.
  pub async fn install<S, N>(&self, storage: &S, network: &N, assets: &[String]) -> Result<usize>
  where
    S: CacheStore + ?Sized,
    N: Network + ?Sized,
  {
    let state = self.state()?;
    if state != LifecycleState::Installing {
      return Err(Error::Lifecycle(format!(
        "install requested in state {:?}",
        state
      )));
    }

    let requests: Vec<Request> = assets.iter().map(Request::get).collect();
    let responses = join_all(requests.iter().map(|r| network.fetch(r.clone()))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      match response {
        Ok(response) if response.is_cacheable() => {
          fetched.push((RequestKey::from_request(request), response))
        }
        Ok(response) => {
          return Err(Error::Lifecycle(format!(
            "precache of {} returned {}",
            request.url, response.status
          )))
        }
        Err(e) => {
          return Err(Error::Lifecycle(format!(
            "precache of {} failed: {}",
            request.url, e
          )))
        }
      }
    }

    storage.put_all(&self.generation.static_ns, &fetched)?;

    self.set_state(LifecycleState::Installed)?;
    info!(assets = fetched.len(), generation = self.generation.version, "installed");
    Ok(fetched.len())
  }

  /// Pick up a generation installed by an earlier process.
  ///
  /// Install writes the static namespace atomically and activation removes
  /// every other version, so the store alone tells how far the earlier
  /// process got. With no superseded namespace left the state jumps to
  /// `Activated`; otherwise it resumes at `Installed` and `activate` still
  /// has to collect them. Returns whether the generation is active.
  pub fn resume<S: CacheStore + ?Sized>(&self, storage: &S) -> Result<bool> {
    let state = self.state()?;
    if state != LifecycleState::Installing {
      return Ok(state == LifecycleState::Activated);
    }

    let namespaces = storage.list_namespaces()?;
    if !namespaces.contains(&self.generation.static_ns) {
      return Ok(false);
    }

    let superseded = namespaces
      .iter()
      .filter(|ns| ns.version != self.generation.version)
      .count();
    if superseded > 0 {
      self.set_state(LifecycleState::Installed)?;
      info!(
        generation = self.generation.version,
        superseded, "resumed installed generation, activation pending"
      );
      return Ok(false);
    }

    self.set_state(LifecycleState::Activated)?;
    info!(generation = self.generation.version, "resumed active generation");
    Ok(true)
  }

  /// Activate without waiting for older clients to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Clients still controlled by a superseded generation.
  fn blocking_clients(&self) -> Result<usize> {
    Ok(
      read(&self.clients)?
        .values()
        .filter(|c| matches!(c.controller, Some(v) if v != self.generation.version))
        .count(),
    )
  }

  pub fn ready_to_activate(&self) -> Result<bool> {
    Ok(
      self.state()? == LifecycleState::Installed
        && (self.skip_waiting.load(Ordering::SeqCst) || self.blocking_clients()? == 0),
    )
  }

  /// Delete every namespace from another generation, then claim clients
  /// if configured to.
  pub fn activate<S: CacheStore + ?Sized>(&self, storage: &S) -> Result<ActivationReport> {
    let state = self.state()?;
    if state != LifecycleState::Installed {
      return Err(Error::Lifecycle(format!(
        "activate requested in state {:?}",
        state
      )));
    }
    if !self.ready_to_activate()? {
      return Err(Error::Lifecycle(format!(
        "waiting on {} client(s) of an older generation",
        self.blocking_clients()?
      )));
    }

    self.set_state(LifecycleState::Activating)?;

    let mut report = ActivationReport::default();
    let collected = storage.list_namespaces().and_then(|namespaces| {
      for ns in namespaces {
        if ns.version != self.generation.version {
          storage.delete_namespace(&ns)?;
          info!(namespace = %ns, "deleted superseded cache");
          report.deleted.push(ns);
        }
      }
      Ok(())
    });

    if let Err(e) = collected {
      self.set_state(LifecycleState::Installed)?;
      return Err(e);
    }

    self.set_state(LifecycleState::Activated)?;
    if self.claim_clients {
      report.claimed = self.claim()?;
    }
    info!(generation = self.generation.version, claimed = report.claimed, "activated");
    Ok(report)
  }

  /// Take control of every open client. Returns how many changed hands.
  pub fn claim(&self) -> Result<usize> {
    let version = self.generation.version;
    let mut clients = write(&self.clients)?;
    let mut claimed = 0;
    for client in clients.values_mut() {
      if client.controller != Some(version) {
        client.controller = Some(version);
        claimed += 1;
      }
    }
    Ok(claimed)
  }

  /// A newly opened page. Controlled right away once activated.
  pub fn open_client(&self, id: &str, url: &str) -> Result<bool> {
    let controller =
      (self.state()? == LifecycleState::Activated).then_some(self.generation.version);
    self.insert_client(id, url, controller)?;
    Ok(controller.is_some())
  }

  /// A page that was already running under some generation.
  pub fn adopt_client(&self, id: &str, url: &str, version: u32) -> Result<()> {
    self.insert_client(id, url, Some(version))
  }

  fn insert_client(&self, id: &str, url: &str, controller: Option<u32>) -> Result<()> {
    write(&self.clients)?.insert(
      id.to_string(),
      Client {
        id: id.to_string(),
        url: url.to_string(),
        controller,
      },
    );
    Ok(())
  }

  pub fn close_client(&self, id: &str) -> Result<bool> {
    Ok(write(&self.clients)?.remove(id).is_some())
  }

  pub fn navigate_client(&self, id: &str, url: &str) -> Result<()> {
    if let Some(client) = write(&self.clients)?.get_mut(id) {
      client.url = url.to_string();
    }
    Ok(())
  }

  /// Whether requests from `id` go through the current generation.
  pub fn is_controlled(&self, id: &str) -> Result<bool> {
    Ok(
      read(&self.clients)?
        .get(id)
        .map(|c| c.controller == Some(self.generation.version))
        .unwrap_or(false),
    )
  }

  pub fn find_client_by_url(&self, url: &str) -> Result<Option<String>> {
    Ok(
      read(&self.clients)?
        .values()
        .find(|c| c.url == url)
        .map(|c| c.id.clone()),
    )
  }

  pub fn clients(&self) -> Result<Vec<Client>> {
    let mut clients: Vec<Client> = read(&self.clients)?.values().cloned().collect();
    clients.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(clients)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheRole, SqliteStorage};
  use crate::http::Response;
  use crate::testing::MockNetwork;

  fn assets() -> Vec<String> {
    vec!["/".to_string(), "/static/js/app.js".to_string()]
  }

  fn controller(version: u32, skip_waiting: bool) -> LifecycleController {
    LifecycleController::new(
      Generation::new("stride", version),
      &LifecycleConfig {
        skip_waiting,
        claim_clients: true,
      },
    )
  }

  fn serving_network() -> std::sync::Arc<MockNetwork> {
    let network = MockNetwork::new();
    network.respond("/", Response::new(200, "<html>shell</html>"));
    network.respond("/static/js/app.js", Response::new(200, "js"));
    network
  }

  #[tokio::test]
  async fn test_install_precaches_assets() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let lifecycle = controller(2, true);

    let count = lifecycle.install(&storage, network.as_ref(), &assets()).await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Installed);
    let key = RequestKey::from_request(&Request::get("/static/js/app.js"));
    assert!(storage.get(&lifecycle.generation().static_ns, &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    network.respond("/static/js/app.js", Response::new(404, "missing"));
    let lifecycle = controller(2, true);

    assert!(lifecycle.install(&storage, network.as_ref(), &assets()).await.is_err());
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Installing);
    assert!(storage.list_namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_deletes_only_other_versions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let key = RequestKey::from_request(&Request::get("/"));
    let old_static = CacheNamespace::new("stride", CacheRole::Static, 1);
    let old_dynamic = CacheNamespace::new("stride", CacheRole::Dynamic, 1);
    storage.put(&old_static, &key, &Response::new(200, "v1")).unwrap();
    storage.put(&old_dynamic, &key, &Response::new(200, "v1")).unwrap();

    let lifecycle = controller(2, true);
    storage
      .put(&lifecycle.generation().dynamic_ns, &key, &Response::new(200, "v2"))
      .unwrap();
    lifecycle.install(&storage, network.as_ref(), &assets()).await.unwrap();

    let report = lifecycle.activate(&storage).unwrap();

    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Activated);
    assert_eq!(report.deleted.len(), 2);
    let remaining = storage.list_namespaces().unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|ns| ns.version == 2));
    assert!(storage.get(&lifecycle.generation().dynamic_ns, &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_waiting_until_old_clients_close() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let lifecycle = controller(2, false);
    lifecycle.adopt_client("tab-1", "/", 1).unwrap();
    lifecycle.install(&storage, network.as_ref(), &assets()).await.unwrap();

    assert!(!lifecycle.ready_to_activate().unwrap());
    assert!(lifecycle.activate(&storage).is_err());
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Installed);

    lifecycle.close_client("tab-1").unwrap();
    assert!(lifecycle.ready_to_activate().unwrap());
    lifecycle.activate(&storage).unwrap();
  }

  #[tokio::test]
  async fn test_skip_waiting_and_claim_take_over_open_clients() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let lifecycle = controller(2, false);
    lifecycle.adopt_client("tab-1", "/", 1).unwrap();
    assert!(!lifecycle.open_client("tab-2", "/statistics").unwrap());
    lifecycle.install(&storage, network.as_ref(), &assets()).await.unwrap();

    lifecycle.skip_waiting();
    let report = lifecycle.activate(&storage).unwrap();

    assert_eq!(report.claimed, 2);
    assert!(lifecycle.is_controlled("tab-1").unwrap());
    assert!(lifecycle.is_controlled("tab-2").unwrap());
    assert!(lifecycle.open_client("tab-3", "/").unwrap());
  }

  #[tokio::test]
  async fn test_resume_after_restart() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let first = controller(2, true);
    first.install(&storage, network.as_ref(), &assets()).await.unwrap();
    first.activate(&storage).unwrap();

    let restarted = controller(2, true);
    assert!(restarted.resume(&storage).unwrap());
    assert_eq!(restarted.state().unwrap(), LifecycleState::Activated);

    let upgraded = controller(3, true);
    assert!(!upgraded.resume(&storage).unwrap());
    assert_eq!(upgraded.state().unwrap(), LifecycleState::Installing);
  }

  #[tokio::test]
  async fn test_restart_while_waiting_still_collects_old_versions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = serving_network();
    let key = RequestKey::from_request(&Request::get("/"));
    let old_static = CacheNamespace::new("stride", CacheRole::Static, 1);
    storage.put(&old_static, &key, &Response::new(200, "v1")).unwrap();

    let waiting = controller(2, false);
    waiting.adopt_client("tab-1", "/", 1).unwrap();
    waiting.install(&storage, network.as_ref(), &assets()).await.unwrap();
    assert_eq!(waiting.state().unwrap(), LifecycleState::Installed);

    // New process: the old tab is gone, the v1 cache is not
    let restarted = controller(2, false);
    assert!(!restarted.resume(&storage).unwrap());
    assert_eq!(restarted.state().unwrap(), LifecycleState::Installed);
    assert!(restarted.ready_to_activate().unwrap());

    let report = restarted.activate(&storage).unwrap();
    assert_eq!(report.deleted, vec![old_static]);
    assert!(storage.list_namespaces().unwrap().iter().all(|ns| ns.version == 2));
  }

  #[tokio::test]
  async fn test_failed_precache_write_leaves_nothing_behind() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.reject_writes_of("GET /static/js/app.js");
    let network = serving_network();
    let lifecycle = controller(2, true);

    let err = lifecycle.install(&storage, network.as_ref(), &assets()).await.unwrap_err();

    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Installing);
    assert!(storage.list_namespaces().unwrap().is_empty());
    let shell = RequestKey::from_request(&Request::get("/"));
    assert!(storage.get(&lifecycle.generation().static_ns, &shell).unwrap().is_none());
  }

  #[test]
  fn test_poisoned_lock_is_a_storage_error() {
    let lifecycle = std::sync::Arc::new(controller(1, true));
    let poisoner = std::sync::Arc::clone(&lifecycle);
    let _ = std::thread::spawn(move || {
      let _guard = poisoner.clients.write().unwrap();
      panic!("client registry update failed");
    })
    .join();

    let err = lifecycle.open_client("tab-1", "/").unwrap_err();
    assert!(matches!(err, Error::Storage(ref msg) if msg.starts_with("Lock poisoned")));
  }

  #[test]
  fn test_activate_before_install_is_rejected() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let err = controller(1, true).activate(&storage).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
  }

  #[test]
  fn test_find_client_by_url() {
    let lifecycle = controller(1, true);
    lifecycle.adopt_client("tab-1", "/statistics", 1).unwrap();
    lifecycle.navigate_client("tab-1", "/training_log").unwrap();
    assert_eq!(
      lifecycle.find_client_by_url("/training_log").unwrap(),
      Some("tab-1".to_string())
    );
    assert_eq!(lifecycle.find_client_by_url("/statistics").unwrap(), None);
  }
}
