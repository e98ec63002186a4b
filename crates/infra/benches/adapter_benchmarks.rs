use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use relay_core::{JobId, JobStatus, NewJob, NewJobLog};
use relay_infra::{InMemoryJobRepository, InMemoryLockStore, JobRepository, LockStore};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Acquire + release of one job lock (the uncontended claim path).
fn bench_lock_cycle(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryLockStore::new();
    let ttl = Duration::from_secs(600);

    c.bench_function("lock_store/acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let key = JobId::new(42).unwrap().lock_key();
                assert!(store.set_if_absent(&key, "bench", ttl).await.unwrap());
                store.delete(&key).await.unwrap();
            })
        })
    });

    c.bench_function("lock_store/contended_acquire", |b| {
        rt.block_on(store.set_if_absent("job:lock:7", "holder", ttl)).unwrap();
        b.iter(|| {
            rt.block_on(async {
                black_box(store.set_if_absent("job:lock:7", "bench", ttl).await.unwrap())
            })
        })
    });
}

/// Claim, complete and log a job, as one successful attempt does.
fn bench_attempt_writes(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("repository/successful_attempt");

    for jobs in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            b.iter(|| {
                rt.block_on(async {
                    let repo = InMemoryJobRepository::new();
                    for n in 0..jobs {
                        let job = repo
                            .create_job(NewJob::new(format!("job-{n}"), json!({ "sleep": 0 })))
                            .await
                            .unwrap();
                        repo.create_job_log(NewJobLog::info(job.id, "processing job"))
                            .await
                            .unwrap();
                        repo.update_job_status(job.id, JobStatus::InProgress, 0)
                            .await
                            .unwrap();
                        repo.update_job_status(job.id, JobStatus::Completed, 0)
                            .await
                            .unwrap();
                    }
                    black_box(repo.writes())
                })
            })
        });
    }
    group.finish();
}

fn bench_pending_scan(c: &mut Criterion) {
    let rt = runtime();
    let repo = InMemoryJobRepository::new();
    rt.block_on(async {
        for n in 0..5_000 {
            let job = repo
                .create_job(NewJob::new(format!("job-{n}"), json!({})))
                .await
                .unwrap();
            if n % 2 == 0 {
                repo.update_job_status(job.id, JobStatus::Completed, 0)
                    .await
                    .unwrap();
            }
        }
    });

    c.bench_function("repository/list_pending_5000", |b| {
        b.iter(|| rt.block_on(async { black_box(repo.list_pending_jobs().await.unwrap().len()) }))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let payloads: Vec<Vec<u8>> = (1..=1_000i64)
        .map(|n| JobId::new(n).unwrap().to_bytes())
        .collect();

    c.bench_function("job_id/decode_1000", |b| {
        b.iter(|| {
            for p in &payloads {
                black_box(JobId::from_bytes(p).unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_lock_cycle,
    bench_attempt_writes,
    bench_pending_scan,
    bench_message_decode
);
criterion_main!(benches);
