//! Pool acquire/release throughput.
//!
//!     cargo bench -p cqnet-module --bench pools

use cqnet_core::completion::CompletionQueue;
use cqnet_core::id::ConnId;
use cqnet_module::{ConnectionPool, EpollQueue, IoBufferPool};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn io_pool(c: &mut Criterion) {
    let pool = IoBufferPool::new(1000);
    c.bench_function("io_pool acquire+release", |b| {
        b.iter(|| {
            let op = pool.acquire();
            pool.release(black_box(op));
        })
    });

    c.bench_function("io_pool prepare_send 1KiB", |b| {
        let payload = [0x5au8; 1024];
        b.iter(|| {
            let mut op = pool.acquire();
            op.prepare_send(ConnId::new(3, 1), black_box(&payload)).ok();
            pool.release(op);
        })
    });
}

fn conn_pool(c: &mut Criterion) {
    let io = Arc::new(IoBufferPool::new(1000));
    let queue: Arc<dyn CompletionQueue> = match EpollQueue::new() {
        Ok(q) => Arc::new(q),
        Err(e) => {
            eprintln!("skipping conn_pool bench: {}", e);
            return;
        }
    };
    let pool = ConnectionPool::new(2000, io, queue);
    c.bench_function("conn_pool acquire+release", |b| {
        b.iter(|| {
            let conn = pool.acquire();
            pool.release(black_box(conn));
        })
    });
}

criterion_group!(benches, io_pool, conn_pool);
criterion_main!(benches);
