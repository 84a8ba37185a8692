//! Hot-path benchmarks for the LRU and layered stores.
//!
//! Benchmarks:
//! - Scalar set and get
//! - Counter increments
//! - List push and paged reads
//!
//! Run with:
//! ```bash
//! cargo bench --bench store_ops
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use unistore::sql::SqliteBackend;
use unistore::store::{LayeredOptions, LayeredStore};
use unistore::{Store, Value};

fn stores(rt: &Runtime) -> Vec<(&'static str, Store)> {
    let layered = rt.block_on(async {
        let db = Arc::new(SqliteBackend::memory().expect("in-memory sqlite"));
        let options = LayeredOptions {
            persist_interval: Duration::from_millis(200),
            ..LayeredOptions::default()
        };
        LayeredStore::open(db, options).await.expect("layered store")
    });
    vec![("lru", Store::memory(10_240)), ("xun", Store::custom(layered))]
}

fn store_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let stores = stores(&rt);

    let mut group = c.benchmark_group("store_ops");
    group.measurement_time(Duration::from_secs(5));

    for (name, store) in &stores {
        group.throughput(Throughput::Elements(1));

        rt.block_on(store.set("hot", "value", None)).expect("seed");
        group.bench_with_input(BenchmarkId::new("get_hit", name), store, |b, store| {
            b.iter(|| rt.block_on(store.get(black_box("hot"))));
        });

        let mut i = 0u64;
        group.bench_with_input(BenchmarkId::new("set", name), store, |b, store| {
            b.iter(|| {
                i += 1;
                let key = format!("key:{}", i % 4_096);
                rt.block_on(store.set(&key, Value::Int(i as i64), None))
            });
        });

        group.bench_with_input(BenchmarkId::new("incr", name), store, |b, store| {
            b.iter(|| rt.block_on(store.incr(black_box("counter"), 1)));
        });
    }

    for (name, store) in &stores {
        let items: Vec<Value> = (0..1_000).map(Value::Int).collect();
        rt.block_on(store.push("list", items)).expect("seed list");

        group.throughput(Throughput::Elements(20));
        group.bench_with_input(BenchmarkId::new("array_page", name), store, |b, store| {
            b.iter(|| rt.block_on(store.array_page(black_box("list"), 25, 20)));
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("push_pop", name), store, |b, store| {
            b.iter(|| {
                rt.block_on(async {
                    store.push("queue", vec![Value::Int(1)]).await?;
                    store.pop("queue", -1).await
                })
            });
        });
    }

    group.finish();

    for (_, store) in stores {
        let _ = rt.block_on(store.close());
    }
}

criterion_group!(benches, store_benchmarks);
criterion_main!(benches);
