use clap::Parser;
use forumcache::cache::CacheMode;
use forumcache::db::{ForumStore, PostgresStore, SqliteStore};
use forumcache::engine::LikePersistence;
use forumcache::mq::MqMode;
use forumcache::server::{BackendType, Daemon, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "forumd", about = "Forum engagement cache daemon", version)]
struct Args {
  #[arg(long, env = "FORUMCACHE_PG_URL")]
  pg_url: Option<String>,
  #[arg(long, env = "FORUMCACHE_SQLITE_PATH")]
  sqlite: Option<String>,
  /// builtin | proxy
  #[arg(long)]
  cache_mode: Option<CacheMode>,
  #[arg(long, env = "FORUMCACHE_REDIS_HOST")]
  redis_host: Option<String>,
  /// memory | redis
  #[arg(long)]
  mq_mode: Option<MqMode>,
  /// direct | queue
  #[arg(long)]
  like_persistence: Option<LikePersistence>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ServerConfig::from_file(path)?
  } else {
    ServerConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(url) = args.pg_url {
    config.store.postgres.url = url;
    config.store.backend = BackendType::Postgres;
  }
  if let Some(path) = args.sqlite {
    config.store.sqlite.path = path;
    config.store.backend = BackendType::Sqlite;
  }
  if let Some(mode) = args.cache_mode {
    config.cache.mode = mode;
  }
  if let Some(host) = args.redis_host {
    config.cache.proxy.host = host;
  }
  if let Some(mode) = args.mq_mode {
    config.mq.mode = mode;
  }
  if let Some(persistence) = args.like_persistence {
    config.likes.persistence = persistence;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let store: Arc<dyn ForumStore> = match config.store.backend {
    BackendType::Postgres => Arc::new(PostgresStore::new(
      &config.store.postgres.url,
      config.store.postgres.max_connections,
    )?),
    BackendType::Sqlite => Arc::new(SqliteStore::new(&config.store.sqlite.path).await?),
  };

  let daemon = Arc::new(Daemon::new(config, store).await?);
  let daemon_clone = daemon.clone();

  // Handle shutdown signals (SIGINT, SIGTERM)
  tokio::spawn(async move {
    shutdown_signal().await;
    daemon_clone.shutdown();
  });

  daemon.run().await
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to listen for Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!("Failed to install SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
