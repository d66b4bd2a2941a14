//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relwire_client::{Attachment, BatchOptions, ConnectionConfig, Port, Value};
use relwire_engine::MemoryEngine;
use relwire_server::{Config, Server, UserSecret};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    _rt: Runtime,
    server: Arc<Server>,
    port: Arc<Port>,
    attachment: Attachment,
}

impl Drop for TestSetup {
    fn drop(&mut self) {
        let _ = self.port.close();
        self.server.shutdown();
    }
}

fn setup_server_and_client(lazy: bool) -> TestSetup {
    let rt = Runtime::new().unwrap();

    let mut config = Config::default();
    config.metrics.enabled = false;
    config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
        .auth
        .users
        .insert("bench".to_string(), UserSecret::from_password("bench", "bench"));
    let engine = MemoryEngine::new().with_database("bench");
    let server = Arc::new(Server::new(config, Arc::new(engine)));

    let listener = rt.block_on(server.bind()).unwrap();
    let addr = listener.local_addr().unwrap();
    let server_clone = server.clone();
    rt.spawn(async move {
        let _ = server_clone.serve(listener).await;
    });

    let port = relwire_client::connect(
        ConnectionConfig::new(addr)
            .with_credentials("bench", "bench")
            .with_lazy(lazy),
    )
    .unwrap();
    let attachment = Attachment::attach(&port, "bench").unwrap();

    let mut txn = attachment.start_transaction().unwrap();
    attachment
        .execute_immediate(
            Some(&txn),
            "CREATE TABLE rows (id INTEGER PRIMARY KEY, label VARCHAR(32))",
        )
        .unwrap();
    let insert = attachment
        .prepare(Some(&txn), "INSERT INTO rows VALUES (?, ?)")
        .unwrap();
    let mut batch = insert.create_batch(BatchOptions::default()).unwrap();
    for id in 0..1000 {
        batch
            .add(&[Value::Integer(id), Value::Text(format!("row {}", id))])
            .unwrap();
    }
    batch.execute(&txn).unwrap();
    txn.commit().unwrap();

    TestSetup {
        _rt: rt,
        server,
        port,
        attachment,
    }
}

fn bench_ping_latency(c: &mut Criterion) {
    let setup = setup_server_and_client(false);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));
    group.bench_function("ping", |b| {
        b.iter(|| black_box(setup.port.ping().unwrap()));
    });
    group.finish();
}

fn bench_prepare_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("e2e_prepare_free");

    for lazy in [false, true] {
        let setup = setup_server_and_client(lazy);
        let txn = setup.attachment.start_transaction().unwrap();
        let name = if lazy { "lazy" } else { "sync" };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut stmt = setup
                    .attachment
                    .prepare(Some(&txn), "SELECT * FROM rows WHERE id = 7")
                    .unwrap();
                stmt.free().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_fetch_all(c: &mut Criterion) {
    let setup = setup_server_and_client(true);
    let txn = setup.attachment.start_transaction().unwrap();
    let select = setup
        .attachment
        .prepare(Some(&txn), "SELECT * FROM rows")
        .unwrap();

    let mut group = c.benchmark_group("e2e_fetch");
    group.throughput(Throughput::Elements(1000));
    for max_batch in [1u32, 16, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_batch),
            &max_batch,
            |b, &max_batch| {
                b.iter(|| {
                    let mut cursor = select
                        .open_cursor(&txn, &[], false)
                        .unwrap()
                        .with_max_batch(max_batch);
                    let rows = cursor.collect_rows().unwrap();
                    cursor.close().unwrap();
                    black_box(rows)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_ping_latency, bench_prepare_free, bench_fetch_all);
criterion_main!(benches);
