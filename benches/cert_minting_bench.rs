use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hyper::header::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use transparent_proxy::forwarder::HeaderFilter;
use transparent_proxy::log_writer::{LogRecord, LogWriter};
use transparent_proxy::{CacheSettings, DomainCertCache, RootCertificateAuthority};

fn root() -> Arc<RootCertificateAuthority> {
    Arc::new(
        RootCertificateAuthority::create("Bench Root", Duration::from_secs(24 * 60 * 60), 2048)
            .unwrap(),
    )
}

/// Leaf minting cost per key size; this is what a cache miss pays during a handshake
fn bench_mint_leaf(c: &mut Criterion) {
    let root = root();
    let mut group = c.benchmark_group("mint_leaf");
    group.sample_size(10);

    for key_size in [2048u32, 3072] {
        group.bench_with_input(BenchmarkId::from_parameter(key_size), &key_size, |b, &key_size| {
            b.iter(|| {
                root.generate_domain_certificate(
                    black_box("bench.example.test"),
                    Duration::from_secs(20 * 60),
                    key_size,
                )
                .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache = DomainCertCache::new(root(), CacheSettings::default());
    cache.get_certificate(Some("bench.example.test")).unwrap();

    c.bench_function("cache_hit", |b| {
        b.iter(|| cache.get_certificate(black_box(Some("Bench.Example.Test."))).unwrap())
    });
}

fn bench_header_filter(c: &mut Criterion) {
    let filter = HeaderFilter::default_request();
    let mut headers = HeaderMap::new();
    for (name, value) in [
        ("host", "api.example.test"),
        ("accept", "application/json"),
        ("accept-encoding", "gzip, br"),
        ("user-agent", "bench/1.0"),
        ("authorization", "Bearer token"),
        ("content-type", "application/json"),
    ] {
        headers.insert(name, HeaderValue::from_static(value));
    }

    c.bench_function("header_filter", |b| b.iter(|| filter.apply(black_box(&headers))));
}

fn bench_log_write(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let writer = LogWriter::new(temp_dir.path().to_path_buf()).unwrap();

    c.bench_function("log_write_sync", |b| {
        b.iter(|| {
            let record = LogRecord::new("bench-session", "INFO", "Forwarding completed");
            writer.write_sync(black_box(&record)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_mint_leaf,
    bench_cache_hit,
    bench_header_filter,
    bench_log_write
);
criterion_main!(benches);
