use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use paceline::cache::{CacheResult, CacheStore, SqliteStorage};
use paceline::event::{EventHandler, EventSender};
use paceline::network::ReqwestNetwork;
use paceline::queue::{ReplayOutcome, SqliteQueue};
use paceline::{Agent, Config, Error, Method, Request, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "paceline")]
#[command(about = "Offline cache and replay agent for the Stride training tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/paceline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache static assets for the configured cache version
  Install,
  /// Delete caches from other versions and take control
  Activate,
  /// Send a request through the agent
  Fetch {
    /// HTTP method
    method: String,
    /// Absolute URL or path relative to the origin
    url: String,
    /// Request body
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Accept header, e.g. text/html for navigations
    #[arg(long)]
    accept: Option<String>,
  },
  /// Log a workout (JSON) to the sync endpoint
  Workout { json: String },
  /// Replay queued mutations
  Drain,
  /// Inspect or clear the retry queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// List cache namespaces
  Namespaces,
  /// Render a push payload as a notification
  Push { json: Option<String> },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Clear,
}

type CliAgent = Agent<SqliteStorage, SqliteQueue, ReqwestNetwork>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_logging(&data_dir.join("logs"), args.verbose)?;

  let agent = Arc::new(build_agent(&config, &data_dir)?);
  agent.on_startup()?;

  let (events, handler) = EventHandler::new();
  tokio::spawn(handler.run(Arc::clone(&agent)));

  let outcome = run(&args.command, &agent, &events).await;

  // Let background revalidations land before exiting
  agent.settle().await;
  outcome
}

fn init_logging(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    log_dir,
    "paceline.log",
  ));

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paceline=info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}

fn build_agent(config: &Config, data_dir: &Path) -> Result<CliAgent> {
  let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
  let queue = SqliteQueue::open(&data_dir.join("queue.db"))?;
  let network = ReqwestNetwork::new(&config.origin, config.network.timeout())?;

  info!(origin = %config.origin, data_dir = %data_dir.display(), "agent ready");
  Ok(Agent::new(config, Arc::new(storage), queue, Arc::new(network)))
}

async fn run(command: &Command, agent: &CliAgent, events: &EventSender) -> Result<()> {
  match command {
    Command::Install => {
      let count = events.install().await?;
      println!("precached {} assets", count);
      if agent.lifecycle().ready_to_activate()? {
        let report = events.activate().await?;
        println!(
          "activated, deleted {} old namespace(s)",
          report.deleted.len()
        );
      }
    }
    Command::Activate => {
      let report = events.activate().await?;
      for ns in &report.deleted {
        println!("deleted {}", ns);
      }
      println!("activated");
    }
    Command::Fetch {
      method,
      url,
      body,
      headers,
      accept,
    } => {
      let mut request = Request::new(Method::parse(method), url.clone());
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header must be NAME:VALUE, got '{}'", header))?;
        request.headers.set(name.trim(), value.trim());
      }
      if let Some(accept) = accept {
        request.headers.set("Accept", accept.clone());
      }
      if let Some(body) = body {
        request.body = body.clone().into();
      }
      print_fetch(events.fetch(None, request).await)?;
    }
    Command::Workout { json } => {
      let workout: serde_json::Value =
        serde_json::from_str(json).map_err(|e| eyre!("Workout is not valid JSON: {}", e))?;
      print_fetch(agent.submit_workout(None, &workout).await)?;
    }
    Command::Drain => {
      let report = events.reconnect().await?;
      for outcome in &report.outcomes {
        match outcome {
          ReplayOutcome::Delivered { id, status } => println!("#{} delivered ({})", id, status),
          ReplayOutcome::Failed { id, reason } => println!("#{} failed: {}", id, reason),
          ReplayOutcome::Deferred { id } => println!("#{} deferred", id),
        }
      }
      if let Some(failure) = report.failure() {
        return Err(failure.into());
      }
    }
    Command::Queue { action } => match action {
      QueueAction::List => {
        for mutation in agent.queue().pending()? {
          println!(
            "#{} {} {} {} bytes queued {}",
            mutation.id,
            mutation.method,
            mutation.target_url,
            mutation.body.len(),
            mutation.enqueued_at
          );
        }
      }
      QueueAction::Clear => {
        println!("removed {} queued mutation(s)", agent.queue().clear()?);
      }
    },
    Command::Namespaces => {
      let generation = agent.lifecycle().generation();
      for ns in agent.layer().storage().list_namespaces()? {
        let marker = if generation.contains(&ns) { "*" } else { " " };
        println!("{} {}", marker, ns);
      }
    }
    Command::Push { json } => {
      let notification = events.push(json.as_ref().map(|j| j.clone().into_bytes())).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
  }

  Ok(())
}

fn print_fetch(result: paceline::Result<CacheResult<Response>>) -> Result<()> {
  match result {
    Ok(result) => {
      println!("{} ({:?})", result.data.status, result.source);
      println!("{}", String::from_utf8_lossy(&result.data.body));
      Ok(())
    }
    Err(Error::MutationQueued { id, source }) => {
      println!("offline, queued as #{} ({})", id, source);
      Ok(())
    }
    Err(e) => Err(e.into()),
  }
}
