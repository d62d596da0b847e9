use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use bytes::Bytes;
use relaymq::core::address::{matches, Address};
use relaymq::core::distributor::DistributionPolicy;
use relaymq::core::executor::DirectExecutor;
use relaymq::core::message::ServerMessage;
use relaymq::core::postoffice::{PostOffice, Router};
use relaymq::core::settings::{AddressSettings, AddressSettingsRepository};
use relaymq::journal::{Journal, JournalConfig, SyncSequentialFileFactory};
use relaymq::persistence::NullStorageManager;
use tracing::Span;

fn post_office(queues: usize) -> Arc<PostOffice> {
    let post_office = PostOffice::new(
        "1",
        Arc::new(NullStorageManager::new()),
        Arc::new(AddressSettingsRepository::new(AddressSettings::default())),
        Arc::new(DirectExecutor),
        DistributionPolicy::RoundRobin,
        &Span::none(),
    );
    for i in 0..queues {
        // A quarter of the bindings are wildcards.
        let address = if i % 4 == 0 {
            format!("region{}.#", i % 16)
        } else {
            format!("region{}.store{}", i % 16, i)
        };
        post_office
            .create_queue(&format!("q{i}"), &address, None, false, false)
            .unwrap();
    }
    post_office
}

fn bench_address_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_matching");
    let cases = [
        ("exact", "a.b.c.d", "a.b.c.d"),
        ("single", "a.*.c.*", "a.b.c.d"),
        ("multi_tail", "a.#", "a.b.c.d.e.f"),
        ("multi_inner", "a.#.f", "a.b.c.d.e.f"),
    ];
    for (name, pattern, candidate) in cases {
        let pattern = Address::new(pattern);
        let candidate = Address::new(candidate);
        group.bench_function(name, |b| {
            b.iter(|| black_box(pattern.matches(black_box(&candidate))));
        });
    }
    group.bench_function("parse_and_match", |b| {
        b.iter(|| black_box(matches(black_box("orders.#.paris"), black_box("orders.eu.fr.paris"))));
    });
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));
    for &queues in [16usize, 256, 1024].iter() {
        let post_office = post_office(queues);
        group.bench_with_input(BenchmarkId::new("route", queues), &queues, |b, _| {
            let mut id = 0u64;
            b.iter(|| {
                id += 1;
                let message = ServerMessage::new(id, "region3.store3", Bytes::from_static(b"payload"));
                let routed = post_office.route(message, None).unwrap();
                black_box(routed.len());
            });
            for queue in post_office.queues() {
                queue.delete_all_references().unwrap();
            }
        });
    }
    group.finish();
}

fn bench_journal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_append");
    for &size in [64usize, 1024, 8 * 1024].iter() {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("add", size), &size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let journal = Journal::new(
                JournalConfig {
                    file_size: 4 * 1024 * 1024,
                    ..JournalConfig::new("bench", "rmq")
                },
                Arc::new(SyncSequentialFileFactory::new(dir.path())),
                &Span::none(),
            )
            .unwrap();
            journal.start().unwrap();
            journal.load().unwrap();
            let data = Bytes::from(vec![0x5a; size]);
            let mut id = 0u64;
            b.iter(|| {
                id += 1;
                journal.append_add_record(id, 1, data.clone(), false).unwrap();
            });
            journal.stop().unwrap();
        });
    }
    group.finish();
}

criterion_group!(benches, bench_address_matching, bench_routing, bench_journal_append);
criterion_main!(benches);
