//! Host event signals and their dispatch onto the agent.
//!
//! Every event is handled on its own task, so a slow network fetch never
//! holds up other requests. Replies travel back over oneshot channels.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::agent::Agent;
use crate::cache::{CacheResult, CacheStore};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::lifecycle::ActivationReport;
use crate::network::Network;
use crate::notify::{ClientAction, Notification};
use crate::queue::{DrainReport, MutationStore};

/// Events delivered by the host runtime
#[derive(Debug)]
pub enum Event {
  Install {
    reply: oneshot::Sender<Result<usize>>,
  },
  Activate {
    reply: oneshot::Sender<Result<ActivationReport>>,
  },
  Fetch {
    client_id: Option<String>,
    request: Request,
    reply: oneshot::Sender<Result<CacheResult<Response>>>,
  },
  /// Connectivity restored (background sync)
  Reconnect {
    reply: oneshot::Sender<Result<DrainReport>>,
  },
  Push {
    data: Option<Vec<u8>>,
    reply: oneshot::Sender<Notification>,
  },
  NotificationClick {
    notification: Notification,
    action: Option<String>,
    reply: oneshot::Sender<Result<ClientAction>>,
  },
}

/// Receiving end of the event channel
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a handler and the sender the host uses to raise events
  pub fn new() -> (EventSender, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Dispatch events until every sender is dropped.
  pub async fn run<S, Q, N>(mut self, agent: Arc<Agent<S, Q, N>>)
  where
    S: CacheStore + 'static,
    Q: MutationStore + 'static,
    N: Network,
  {
    while let Some(event) = self.next().await {
      let agent = Arc::clone(&agent);
      tokio::spawn(async move { dispatch(&agent, event).await });
    }
    debug!("event channel closed");
  }
}

async fn dispatch<S, Q, N>(agent: &Agent<S, Q, N>, event: Event)
where
  S: CacheStore + 'static,
  Q: MutationStore,
  N: Network,
{
  // A dropped receiver just means the host stopped waiting
  match event {
    Event::Install { reply } => {
      let _ = reply.send(agent.on_install().await);
    }
    Event::Activate { reply } => {
      let _ = reply.send(agent.on_activate());
    }
    Event::Fetch {
      client_id,
      request,
      reply,
    } => {
      let _ = reply.send(agent.on_fetch(client_id.as_deref(), request).await);
    }
    Event::Reconnect { reply } => {
      let _ = reply.send(agent.on_reconnect().await);
    }
    Event::Push { data, reply } => {
      let _ = reply.send(agent.on_push(data.as_deref()));
    }
    Event::NotificationClick {
      notification,
      action,
      reply,
    } => {
      let _ = reply.send(agent.on_notification_click(&notification, action.as_deref()));
    }
  }
}

/// Host-side handle for raising events and awaiting their outcome.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
  async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(build(reply)).map_err(|_| Error::Stopped)?;
    rx.await.map_err(|_| Error::Stopped)
  }

  pub async fn install(&self) -> Result<usize> {
    self.request(|reply| Event::Install { reply }).await?
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.request(|reply| Event::Activate { reply }).await?
  }

  pub async fn fetch(
    &self,
    client_id: Option<&str>,
    request: Request,
  ) -> Result<CacheResult<Response>> {
    let client_id = client_id.map(String::from);
    self
      .request(|reply| Event::Fetch {
        client_id,
        request,
        reply,
      })
      .await?
  }

  pub async fn reconnect(&self) -> Result<DrainReport> {
    self.request(|reply| Event::Reconnect { reply }).await?
  }

  pub async fn push(&self, data: Option<Vec<u8>>) -> Result<Notification> {
    self.request(|reply| Event::Push { data, reply }).await
  }

  pub async fn notification_click(
    &self,
    notification: Notification,
    action: Option<&str>,
  ) -> Result<ClientAction> {
    let action = action.map(String::from);
    self
      .request(|reply| Event::NotificationClick {
        notification,
        action,
        reply,
      })
      .await?
  }
}
