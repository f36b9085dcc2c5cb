use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ServerConfig;
use crate::cache::{self, InMemoryCacheStore};
use crate::db::ForumStore;
use crate::engine::ForumEngine;
use crate::mq::{self, EventConsumer, ViewBuffer};

pub struct Daemon {
  config: ServerConfig,
  store: Arc<dyn ForumStore>,
  engine: Arc<ForumEngine>,
  consumer: Arc<EventConsumer>,
  builtin_cache: Option<Arc<InMemoryCacheStore>>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  /// Connect the cache and broker and assemble the engine around `store`.
  pub async fn new(config: ServerConfig, store: Arc<dyn ForumStore>) -> Result<Self, anyhow::Error> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let (cache, builtin_cache) = cache::connect(&config.cache).await?;
    info!(
      mode = %config.cache.mode,
      max_memory = %config.cache.max_memory,
      "Cache ready"
    );

    let broker = mq::connect(&config.mq, &config.cache.proxy).await?;
    info!(mode = ?config.mq.mode, "Broker ready");

    let engine = Arc::new(ForumEngine::new(
      store.clone(),
      cache,
      broker.clone(),
      config.engine_config(),
    ));
    let consumer = Arc::new(EventConsumer::new(
      broker,
      store.clone(),
      Arc::new(ViewBuffer::new(config.views.batch_size)),
      config.consumer_config(),
    ));

    Ok(Self {
      config,
      store,
      engine,
      consumer,
      builtin_cache,
      shutdown_tx,
    })
  }

  pub fn engine(&self) -> &Arc<ForumEngine> {
    &self.engine
  }

  pub fn consumer(&self) -> &Arc<EventConsumer> {
    &self.consumer
  }

  /// Trigger graceful shutdown
  pub fn shutdown(&self) {
    info!("Initiating graceful shutdown...");
    let _ = self.shutdown_tx.send(());
  }

  /// Run until [`Daemon::shutdown`] is called, then drain everything.
  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let mut stop = self.shutdown_tx.subscribe();

    info!("Initializing database schema...");
    self.store.init_schema().await?;
    info!("Database schema initialized");

    let mut handles = self.consumer.spawn(&self.shutdown_tx);

    if let Some(builtin) = self.builtin_cache.clone() {
      let period = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
      let mut sweep_stop = self.shutdown_tx.subscribe();
      handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
          tokio::select! {
            _ = interval.tick() => {
              let removed = builtin.evict_expired();
              if removed > 0 {
                debug!(removed, "Expired cache entries swept");
              }
            }
            _ = sweep_stop.recv() => break,
          }
        }
      }));
    }

    info!(
      persistence = ?self.config.likes.persistence,
      store_workers = self.config.workers.store_workers,
      cache_workers = self.config.workers.cache_workers,
      "forumd running"
    );

    let _ = stop.recv().await;

    for handle in handles {
      let _ = handle.await;
    }
    let report = self.consumer.flush_views().await;
    info!(
      articles = report.articles,
      views = report.views,
      failed = report.failed,
      "Final view flush"
    );
    self.engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
  }
}
