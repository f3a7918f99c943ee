//! Scripted network used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::error::NetworkError;
use crate::http::{Request, Response};
use crate::network::Network;

/// Responds from a table keyed by path and query. Unknown paths get a 404.
pub struct MockNetwork {
  responses: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  online: AtomicBool,
  calls: Mutex<Vec<Request>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      responses: Mutex::new(HashMap::new()),
      failing: Mutex::new(HashSet::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    })
  }

  pub fn respond(&self, path: &str, response: Response) {
    self.responses.lock().unwrap().insert(path.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Make requests to one path fail at the transport level.
  pub fn fail_path(&self, path: &str) {
    self.failing.lock().unwrap().insert(path.to_string());
  }

  pub fn heal_path(&self, path: &str) {
    self.failing.lock().unwrap().remove(path);
  }

  /// Hold every fetch until `release` is called.
  pub fn hold(&self) {
    *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release(&self) {
    if let Some(gate) = self.gate.lock().unwrap().take() {
      gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.path_and_query() == path)
      .count()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    self.calls.lock().unwrap().push(request.clone());

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }

    let path = request.path_and_query();
    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::new("offline"));
    }
    if self.failing.lock().unwrap().contains(&path) {
      return Err(NetworkError::timeout(format!("timed out fetching {}", path)));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
