//! The agent: one entry point per host event.
//!
//! GET requests from controlled clients are classified by the router and
//! served through the cache layer. GETs from clients the agent does not
//! control skip the cache. Either way the offline responder answers when
//! nothing else can. Other methods go straight to the network; when a
//! mutation fails it is persisted to the retry queue before the failure is
//! reported, whatever the lifecycle state.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::lifecycle::{ActivationReport, LifecycleController, LifecycleState};
use crate::network::Network;
use crate::notify::{ClientAction, Notification, PushPayload, DISMISS_ACTION, VIEW_ACTION};
use crate::offline::OfflineResponder;
use crate::queue::{DrainReport, MutationStore, RetryQueue};
use crate::router::PolicyRouter;

pub struct Agent<S: CacheStore, Q: MutationStore, N: Network> {
  layer: CacheLayer<S, N>,
  router: PolicyRouter,
  offline: OfflineResponder,
  queue: RetryQueue<Q>,
  lifecycle: LifecycleController,
  static_assets: Vec<String>,
  sync_endpoint: String,
}

impl<S, Q, N> Agent<S, Q, N>
where
  S: CacheStore + 'static,
  Q: MutationStore,
  N: Network,
{
  pub fn new(config: &Config, storage: Arc<S>, queue: Q, network: Arc<N>) -> Self {
    let generation = config.generation();
    Self {
      layer: CacheLayer::new(storage, network, generation.clone()),
      router: PolicyRouter::from_config(&config.routes),
      offline: OfflineResponder::new(&config.routes),
      queue: RetryQueue::new(queue),
      lifecycle: LifecycleController::new(generation, &config.lifecycle),
      static_assets: config.routes.static_assets.clone(),
      sync_endpoint: config.sync_endpoint.clone(),
    }
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn queue(&self) -> &RetryQueue<Q> {
    &self.queue
  }

  pub fn layer(&self) -> &CacheLayer<S, N> {
    &self.layer
  }

  /// Startup: resume the current generation if an earlier run installed it.
  ///
  /// A generation left waiting on old clients is activated now, since a
  /// fresh process has none. Returns whether the generation is active.
  pub fn on_startup(&self) -> Result<bool> {
    if self.lifecycle.resume(self.layer.storage().as_ref())? {
      return Ok(true);
    }
    if self.lifecycle.ready_to_activate()? {
      self.on_activate()?;
      return Ok(true);
    }
    Ok(false)
  }

  /// Install event: pre-cache the static assets.
  pub async fn on_install(&self) -> Result<usize> {
    self
      .lifecycle
      .install(
        self.layer.storage().as_ref(),
        self.layer.network().as_ref(),
        &self.static_assets,
      )
      .await
  }

  /// Activate event: drop superseded caches and claim clients.
  pub fn on_activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate(self.layer.storage().as_ref())
  }

  /// Requests without a client id count as controlled once activated.
  fn is_controlled(&self, client_id: Option<&str>) -> Result<bool> {
    match client_id {
      Some(id) => self.lifecycle.is_controlled(id),
      None => Ok(self.lifecycle.state()? == LifecycleState::Activated),
    }
  }

  /// Fetch event.
  pub async fn on_fetch(
    &self,
    client_id: Option<&str>,
    request: Request,
  ) -> Result<CacheResult<Response>> {
    if !request.is_get() {
      return self.send_mutation(request).await;
    }

    if !self.is_controlled(client_id)? {
      debug!(url = %request.url, "uncontrolled client, bypassing cache");
      return match self.layer.network().fetch(request.clone()).await {
        Ok(response) => Ok(CacheResult::from_network(response)),
        Err(e) => {
          debug!(url = %request.url, error = %e, "no network for uncontrolled client");
          Ok(CacheResult::synthesized(self.offline.synthesize(&request)))
        }
      };
    }

    let rule = self.router.classify(&request);
    debug!(url = %request.url, rule = rule.name, strategy = %rule.strategy, "routing request");

    match self.layer.execute(rule.strategy, &request).await {
      Ok(result) => Ok(result),
      Err(e) => {
        match &e {
          Error::Network(_) => debug!(url = %request.url, error = %e, "no network and no cache"),
          _ => warn!(url = %request.url, error = %e, "strategy failed"),
        }
        Ok(CacheResult::synthesized(self.offline.synthesize(&request)))
      }
    }
  }

  async fn send_mutation(&self, request: Request) -> Result<CacheResult<Response>> {
    match self.layer.network().fetch(request.clone()).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(source) if request.method.is_mutating() => {
        let id = self.queue.enqueue(&request)?;
        Err(Error::MutationQueued { id, source })
      }
      Err(source) => Err(source.into()),
    }
  }

  /// Submit a workout log to the sync endpoint as JSON.
  pub async fn submit_workout(
    &self,
    client_id: Option<&str>,
    workout: &serde_json::Value,
  ) -> Result<CacheResult<Response>> {
    let request = Request::post(self.sync_endpoint.clone(), serde_json::to_vec(workout)?)
      .with_header("Content-Type", "application/json");
    self.on_fetch(client_id, request).await
  }

  /// Reconnect signal: replay the retry queue.
  pub async fn on_reconnect(&self) -> Result<DrainReport> {
    info!("connectivity restored, draining retry queue");
    self.queue.drain(self.layer.network().as_ref()).await
  }

  /// Push event: build the notification to show.
  pub fn on_push(&self, data: Option<&[u8]>) -> Notification {
    Notification::from_payload(PushPayload::parse(data))
  }

  /// Notification click: focus a client already at the URL, else open one.
  pub fn on_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> Result<ClientAction> {
    let action = match action {
      Some(DISMISS_ACTION) => ClientAction::None,
      Some(VIEW_ACTION) | None => match self.lifecycle.find_client_by_url(&notification.url)? {
        Some(client_id) => ClientAction::Focus { client_id },
        None => ClientAction::Open {
          url: notification.url.clone(),
        },
      },
      Some(other) => {
        debug!(action = other, "ignoring unknown notification action");
        ClientAction::None
      }
    };
    Ok(action)
  }

  /// Wait for background revalidations to finish.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }
}
