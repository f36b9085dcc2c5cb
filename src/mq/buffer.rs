//! Buffered view counting
//!
//! Views are appended under one lock. A flush swaps the whole generation out
//! under that lock and writes to the store after releasing it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::db::ForumStore;
use crate::types::ViewEvent;

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// Articles whose counter was updated
  pub articles: usize,
  /// Views written
  pub views: u64,
  /// Articles whose update failed
  pub failed: usize,
}

pub struct ViewBuffer {
  events: Mutex<Vec<ViewEvent>>,
  threshold: usize,
}

impl ViewBuffer {
  pub fn new(threshold: usize) -> Self {
    let threshold = threshold.max(1);
    Self {
      events: Mutex::new(Vec::with_capacity(threshold)),
      threshold,
    }
  }

  pub fn threshold(&self) -> usize {
    self.threshold
  }

  /// Append a view. Returns the full generation when this append reached the
  /// threshold; the caller owns flushing it.
  pub fn push(&self, event: ViewEvent) -> Option<Vec<ViewEvent>> {
    let mut events = self.events.lock();
    events.push(event);
    if events.len() >= self.threshold {
      Some(std::mem::replace(
        &mut *events,
        Vec::with_capacity(self.threshold),
      ))
    } else {
      None
    }
  }

  /// Take everything buffered so far.
  pub fn drain(&self) -> Vec<ViewEvent> {
    std::mem::take(&mut *self.events.lock())
  }

  pub fn len(&self) -> usize {
    self.events.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Count views per article, ordered by article id.
pub fn group_by_article(events: &[ViewEvent]) -> BTreeMap<i64, i64> {
  let mut counts = BTreeMap::new();
  for event in events {
    *counts.entry(event.article_id).or_insert(0) += 1;
  }
  counts
}

/// Apply one `+N` update per article. A failing article is logged and the
/// rest of the batch still goes through.
pub async fn flush_views(store: &Arc<dyn ForumStore>, events: Vec<ViewEvent>) -> FlushReport {
  if events.is_empty() {
    return FlushReport::default();
  }

  let grouped = group_by_article(&events);
  let updates = grouped.into_iter().map(|(article_id, count)| {
    let store = store.clone();
    async move {
      let result = store.adjust_article_view_count(article_id, count).await;
      (article_id, count, result)
    }
  });

  let mut report = FlushReport::default();
  for (article_id, count, result) in futures_util::future::join_all(updates).await {
    match result {
      Ok(true) => {
        report.articles += 1;
        report.views += count as u64;
      }
      Ok(false) => {
        debug!(article_id, count, "View flush skipped missing article");
      }
      Err(e) => {
        report.failed += 1;
        error!(article_id, count, error = %e, "Failed to flush view count");
      }
    }
  }

  debug!(
    articles = report.articles,
    views = report.views,
    failed = report.failed,
    "View buffer flushed"
  );
  report
}
