//! Like toggle benchmarks.
//!
//! Run with: cargo bench --bench counter

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use forumcache::cache::{CacheStore, EvictionPolicy, InMemoryCacheStore, MembershipOp};
use forumcache::db::{ForumStore, SqliteStore};
use forumcache::engine::{EngineConfig, ForumEngine};
use forumcache::keys;
use forumcache::mq::MemoryBroker;
use forumcache::types::{NewArticle, Target};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(2)
    .enable_all()
    .build()
    .unwrap()
}

fn bench_toggle_script(c: &mut Criterion) {
  let rt = create_runtime();
  let cache = InMemoryCacheStore::new(256 * 1024 * 1024, EvictionPolicy::Lru);
  let target = Target::article(1);
  let set_key = keys::like_set(&target);
  let count_key = keys::like_count(&target);

  let mut group = c.benchmark_group("toggle_script");
  group.throughput(Throughput::Elements(2));

  group.bench_function("like_unlike", |b| {
    b.iter(|| {
      rt.block_on(async {
        black_box(
          cache
            .toggle_membership(&set_key, &count_key, "42", MembershipOp::Add)
            .await
            .unwrap(),
        );
        black_box(
          cache
            .toggle_membership(&set_key, &count_key, "42", MembershipOp::Remove)
            .await
            .unwrap(),
        );
      });
    });
  });

  group.finish();
}

fn bench_engine_like(c: &mut Criterion) {
  let rt = create_runtime();

  let mut group = c.benchmark_group("engine_like");
  group.throughput(Throughput::Elements(1));

  for likers in [10_i64, 1_000].iter() {
    let (engine, target) = rt.block_on(async {
      let store = SqliteStore::in_memory().await.unwrap();
      store.init_schema().await.unwrap();
      let article = store
        .insert_article(&NewArticle {
          board_id: 1,
          user_id: 1,
          title: "bench".into(),
          content: "bench".into(),
        })
        .await
        .unwrap();
      let target = Target::article(article.id);
      let engine = ForumEngine::new(
        Arc::new(store),
        Arc::new(InMemoryCacheStore::new(256 * 1024 * 1024, EvictionPolicy::Lru)),
        Arc::new(MemoryBroker::default()),
        EngineConfig::default(),
      );
      for user in 1..=*likers {
        engine.like(user, target).await.unwrap();
      }
      engine.wait_idle().await;
      (engine, target)
    });

    let user = likers + 1;
    group.bench_with_input(BenchmarkId::from_parameter(likers), likers, |b, _| {
      b.iter(|| {
        rt.block_on(async {
          black_box(engine.like(user, target).await.unwrap());
          black_box(engine.unlike(user, target).await.unwrap());
        });
      });
    });

    rt.block_on(engine.shutdown());
  }

  group.finish();
}

criterion_group!(benches, bench_toggle_script, bench_engine_like);

criterion_main!(benches);
