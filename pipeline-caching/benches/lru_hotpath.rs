use criterion::{criterion_group, criterion_main, Criterion};
use pipeline_caching::{LruConfig, LruLoadingCache, LruPutCache, PutCache};
use pipeline_core::CacheError;
use std::hint::black_box;

fn bench_put_cache(c: &mut Criterion) {
    let cache: LruPutCache<u64, u64> =
        LruPutCache::new(&LruConfig::new(1_000).with_concurrency(8)).expect("build cache");
    for key in 0..1_000 {
        cache.put(key, key);
    }

    c.bench_function("lru/get_hit", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 7) % 1_000;
            black_box(cache.get(black_box(&key)));
        });
    });

    c.bench_function("lru/put_evicting", |b| {
        let mut key = 1_000u64;
        b.iter(|| {
            key += 1;
            cache.put(black_box(key), key);
        });
    });
}

fn bench_loading_cache(c: &mut Criterion) {
    let cache: LruLoadingCache<u64, u64, _> = LruLoadingCache::new(
        &LruConfig::new(100).with_concurrency(4),
        |k: &u64| -> Result<u64, CacheError> { Ok(k.wrapping_mul(31)) },
    )
    .expect("build cache");

    c.bench_function("lru/get_or_load_mixed", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 13) % 200;
            black_box(pipeline_caching::LoadingCache::get_or_load(&cache, black_box(&key)).ok());
        });
    });
}

criterion_group!(benches, bench_put_cache, bench_loading_cache);
criterion_main!(benches);
