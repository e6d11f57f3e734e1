use control_plane::balancer::{Algorithm, BalancerConfig, WorkerPool, WorkerSpec};
use control_plane::cache::{CacheConfig, CacheEngine, CacheStrategy};
use control_plane::config::ControlPlaneConfig;
use control_plane::rate_limit::{static_limit, EndpointType, Environment};
use control_plane::store::MemoryStore;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn pool_with_nodes(rt: &Runtime, algorithm: Algorithm, count: usize) -> WorkerPool {
    let pool = WorkerPool::new(BalancerConfig {
        algorithm,
        ..Default::default()
    })
    .expect("Failed to create pool");

    rt.block_on(async {
        for i in 0..count {
            pool.register(WorkerSpec {
                id: format!("worker-{}", i),
                host: "127.0.0.1".to_string(),
                port: 9100 + i as u16,
                max_jobs: 10,
                capabilities: vec!["automation".to_string()],
                weight: (i % 3 + 1) as u32,
                managed: false,
            })
            .await
            .expect("Failed to register worker");
        }
    });
    pool
}

fn benchmark_node_selection(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create runtime");
    let mut group = c.benchmark_group("node_selection");

    for algorithm in [
        Algorithm::RoundRobin,
        Algorithm::LeastConnections,
        Algorithm::WeightedRoundRobin,
        Algorithm::Hash,
    ] {
        let pool = pool_with_nodes(&rt, algorithm, 16);
        group.bench_with_input(
            BenchmarkId::from_parameter(algorithm),
            &pool,
            |b, pool| {
                b.to_async(&rt).iter(|| async {
                    black_box(pool.select_node(Some("automation"), Some("strategy-42")).await)
                })
            },
        );
    }
    group.finish();
}

fn benchmark_pool_scale(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create runtime");
    let mut group = c.benchmark_group("least_connections_pool_size");

    for count in [4, 32, 128] {
        let pool = pool_with_nodes(&rt, Algorithm::LeastConnections, count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &pool, |b, pool| {
            b.to_async(&rt)
                .iter(|| async { black_box(pool.select_node(None, None).await) })
        });
    }
    group.finish();
}

fn benchmark_cache_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create runtime");
    let engine = CacheEngine::new(Arc::new(MemoryStore::new()), CacheConfig::default());
    let limit = static_limit(Environment::Production, EndpointType::Trading);

    c.bench_function("cache_set_get", |b| {
        b.to_async(&rt).iter(|| async {
            engine.set(CacheStrategy::RateLimit, "config:production:trading", &limit).await;
            black_box(
                engine
                    .get::<control_plane::rate_limit::ResolvedRateLimit>(
                        CacheStrategy::RateLimit,
                        "config:production:trading",
                    )
                    .await,
            )
        })
    });
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
server:
  port: 8080

rate_limit:
  environment: production

balancer:
  algorithm: least_connections
  workers:
    - id: "worker-1"
      host: "10.0.0.11"
      port: 9100
      capabilities: ["orders", "backtest"]
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(ControlPlaneConfig::from_yaml(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_node_selection,
    benchmark_pool_scale,
    benchmark_cache_round_trip,
    benchmark_config_parsing
);
criterion_main!(benches);
