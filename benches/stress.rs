use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use numpool::archive::MemoryArchive;
use numpool::auth::Identity;
use numpool::config::NotifyConfig;
use numpool::engine::Engine;
use numpool::notify::{MemorySink, Notifier};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn open_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join("numpool_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.wal", Ulid::new()));
    let notifier = Notifier::new(
        Arc::new(MemorySink::default()),
        &NotifyConfig {
            channel: "bench".into(),
            max_retries: 1,
            retry_delay: Duration::ZERO,
        },
    );
    Arc::new(Engine::new(&path, notifier, Arc::new(MemoryArchive::default()), 50).unwrap())
}

async fn setup(engine: &Engine, count: u64) {
    engine
        .add_category(1, "standard".into(), 259_200_000)
        .await
        .unwrap();
    engine.add_provider(1, "vina".into()).await.unwrap();
    for i in 0..count {
        engine
            .add_number(i + 1, &format!("09{i:08}"), 1, 1, 100.0, 10.0, 0.0)
            .await
            .unwrap();
    }
    println!("  registered {count} numbers");
}

async fn phase1_sequential(engine: &Engine, n: usize) {
    let requester = Identity::standard("bench");
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .reserve_by_ids(&[i as u64 + 1], &requester)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} reservations in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_concurrent_batches(engine: &Arc<Engine>, offset: u64) {
    let n_tasks = 10usize;
    let per_batch = 20u64;

    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks as u64 {
        let engine = engine.clone();
        let base = offset + t * per_batch;
        let ids: Vec<u64> = (base + 1..=base + per_batch).collect();
        handles.push(tokio::spawn(async move {
            let requester = Identity::standard(format!("task-{t}"));
            engine.reserve_by_ids(&ids, &requester).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * per_batch;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {per_batch} ids = {total} bookings in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended_random_picks(engine: &Arc<Engine>) {
    let n_tasks = 20usize;
    let per_pick = 10usize;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let requester = Identity::standard(format!("picker-{t}"));
            let mut latencies = Vec::new();
            let mut booked = 0usize;
            loop {
                let t0 = Instant::now();
                let keys = engine.reserve_random(1, 1, per_pick, &requester).await.unwrap();
                latencies.push(t0.elapsed());
                if keys.is_empty() {
                    break;
                }
                booked += keys.len();
            }
            (latencies, booked)
        }));
    }

    let mut all_latencies = Vec::new();
    let mut total_booked = 0usize;
    for h in handles {
        let (latencies, booked) = h.await.unwrap();
        all_latencies.extend(latencies);
        total_booked += booked;
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} pickers drained {total_booked} numbers in {:.2}s",
        elapsed.as_secs_f64()
    );
    print_latency("pick latency", &mut all_latencies);
}

async fn phase4_query_under_load(engine: &Arc<Engine>) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // Background churn: book and release continuously
    let churn = {
        let engine = engine.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let requester = Identity::standard("churn");
            let releaser = Identity::elevated("ops");
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let keys = engine.reserve_random(1, 1, 5, &requester).await.unwrap();
                if keys.is_empty() {
                    break;
                }
                let pairs: Vec<(String, String)> =
                    keys.into_iter().map(|k| (k, "B-1".to_string())).collect();
                let _ = engine.release(&pairs, &releaser).await;
            }
        })
    };

    let n_reads = 2000usize;
    let mut latencies = Vec::with_capacity(n_reads);
    for _ in 0..n_reads {
        let t = Instant::now();
        let _ = engine.list_available(Some(1), Some(1), 50, 0).await;
        latencies.push(t.elapsed());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = churn.await;

    print_latency("list_available under churn", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== numpool stress benchmark ===\n");

    println!("[phase 1] sequential reservation throughput");
    let engine = open_engine();
    setup(&engine, 2_000).await;
    phase1_sequential(&engine, 1_000).await;

    println!("\n[phase 2] concurrent disjoint batches");
    phase2_concurrent_batches(&engine, 1_000).await;

    println!("\n[phase 3] contended random picks");
    let engine = open_engine();
    setup(&engine, 2_000).await;
    phase3_contended_random_picks(&engine).await;

    println!("\n[phase 4] reads under churn");
    let engine = open_engine();
    setup(&engine, 500).await;
    phase4_query_under_load(&engine).await;

    println!("\n=== benchmark complete ===");
}
