use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rust_decimal_macros::dec;
use ulid::Ulid;

use fleetbook::engine::{Engine, EngineError, EngineOptions};
use fleetbook::model::{Ms, NewBooking, Window};
use fleetbook::tenant::TenantManager;

const HOUR: Ms = 3_600_000; // 1 hour in ms
const BASE: Ms = 1_893_456_000_000; // 2030-01-01T00:00:00Z

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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

fn slot(i: i64) -> Window {
    let start = BASE + i * 2 * HOUR;
    Window::new(start, start + HOUR).unwrap()
}

/// A tenant with `vehicles` vehicles and one customer.
async fn setup(tm: &TenantManager, vehicles: usize) -> (Arc<Engine>, Vec<Ulid>, Ulid) {
    let engine = tm.get_or_create(&format!("bench_{}", Ulid::new())).unwrap();
    let mut ids = Vec::with_capacity(vehicles);
    for i in 0..vehicles {
        let id = Ulid::new();
        engine.register_vehicle(id, Some(format!("V{i}"))).await.unwrap();
        ids.push(id);
    }
    let customer = Ulid::new();
    engine
        .register_customer(customer, "Bench".into(), None)
        .await
        .unwrap();
    (engine, ids, customer)
}

fn rental(customer: Ulid, vehicle: Ulid, window: Window) -> NewBooking {
    NewBooking {
        total_amount: dec!(120),
        ..NewBooking::new(customer, vehicle, window)
    }
}

async fn phase1_sequential(tm: &TenantManager) {
    let (engine, vehicles, customer) = setup(tm, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        engine
            .create_booking(rental(customer, vehicles[0], slot(i as i64)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(tm: &TenantManager) {
    let n_tasks = 10;
    let n_per_task = 200;
    let (engine, vehicles, customer) = setup(tm, n_tasks).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    for vehicle in vehicles {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                engine
                    .create_booking(rental(customer, vehicle, slot(j)))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} vehicles x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    let balance = engine.recompute_balance(customer).await.unwrap();
    println!("  customer balance after run: {balance}");
}

async fn phase3_contention(tm: &TenantManager) {
    let (engine, vehicles, customer) = setup(tm, 1).await;
    let rounds = 50;
    let contenders = 20;

    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for round in 0..rounds {
        let mut handles = Vec::new();
        for _ in 0..contenders {
            let engine = engine.clone();
            let conflicts = conflicts.clone();
            let req = rental(customer, vehicles[0], slot(round));
            handles.push(tokio::spawn(async move {
                match engine.create_booking(req).await {
                    Ok(_) => 1usize,
                    Err(EngineError::Conflict(_)) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                        0
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }));
        }
        let mut winners = 0;
        for h in handles {
            winners += h.await.unwrap();
        }
        assert_eq!(winners, 1, "round {round} double-booked");
    }

    println!(
        "  {rounds} rounds x {contenders} contenders: {} conflicts, 0 double bookings, {:.2}s",
        conflicts.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

async fn phase4_read_under_load(tm: &TenantManager) {
    let (engine, vehicles, customer) = setup(tm, 6).await;
    for i in 0..200 {
        engine
            .create_booking(rental(customer, vehicles[0], slot(i)))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for &vehicle in &vehicles[1..] {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.create_booking(rental(customer, vehicle, slot(i))).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        let vehicle = vehicles[0];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let probe = slot(((r * reads_per_reader + i) % 400) as i64);
                let t = Instant::now();
                engine.find_conflicts(vehicle, probe, None).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("conflict query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("fleetbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = TenantManager::new(dir.clone(), 100_000, EngineOptions::default());

    println!("=== fleetbook stress benchmark ===");
    println!("data dir: {}\n", dir.display());

    // Each phase uses its own tenant to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&tm).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&tm).await;

    println!("\n[phase 3] same-window contention");
    phase3_contention(&tm).await;

    println!("\n[phase 4] conflict query latency under write load");
    phase4_read_under_load(&tm).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\n=== benchmark complete ===");
}
