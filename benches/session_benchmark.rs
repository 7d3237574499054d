use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rail_reservation_worker::models::{Account, ProviderKind};
use rail_reservation_worker::provider::{ProviderRegistry, ScriptedProvider};
use rail_reservation_worker::SessionCache;
use rand::{seq::SliceRandom, thread_rng};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn accounts(count: usize) -> Vec<Account> {
    (0..count)
        .map(|i| Account {
            id: i as i64 + 1,
            kind: if i % 2 == 0 { ProviderKind::Ktx } else { ProviderKind::Srt },
            username: format!("user{i}"),
            secret: "pw".to_string(),
        })
        .collect()
}

fn warm_cache(rt: &Runtime, accounts: &[Account]) -> Arc<SessionCache> {
    let provider = ScriptedProvider::new();
    let registry = ProviderRegistry::new()
        .with(ProviderKind::Ktx, provider.clone())
        .with(ProviderKind::Srt, provider);
    let cache = Arc::new(SessionCache::new(registry));

    rt.block_on(async {
        for account in accounts {
            cache.acquire(account).await.expect("scripted login succeeds");
        }
    });
    cache
}

// Steady state: every acquire hits an already logged-in session.
pub fn session_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("session_cache_acquire");

    for account_count in [1usize, 16, 256] {
        let accounts = accounts(account_count);
        let cache = warm_cache(&rt, &accounts);

        group.bench_with_input(
            BenchmarkId::new("warm", account_count),
            &account_count,
            |b, _| {
                let mut rng = thread_rng();
                b.iter(|| {
                    let account = accounts.choose(&mut rng).expect("non-empty");
                    rt.block_on(async { black_box(cache.acquire(account).await.is_ok()) })
                });
            },
        );

        // Many tasks sharing few accounts at once.
        group.bench_with_input(
            BenchmarkId::new("concurrent_64", account_count),
            &account_count,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut rng = thread_rng();
                        let picks: Vec<Account> = (0..64)
                            .map(|_| accounts.choose(&mut rng).expect("non-empty").clone())
                            .collect();
                        let handles: Vec<_> = picks
                            .into_iter()
                            .map(|account| {
                                let cache = Arc::clone(&cache);
                                tokio::spawn(async move { cache.acquire(&account).await.is_ok() })
                            })
                            .collect();
                        for handle in handles {
                            black_box(handle.await.expect("acquire task"));
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, session_benchmark);
criterion_main!(benches);
