use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const T0: i64 = 1_767_225_600_000;

struct Target {
    host: String,
    port: u16,
    password: String,
    admin: String,
}

async fn connect(target: &Target, tenant: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(tenant)
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new()).to_lowercase()
}

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

async fn create_resource(client: &tokio_postgres::Client, kind: &str, capacity: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, kind, capacity) VALUES ('{rid}', '{kind}', {capacity})"
        ))
        .await
        .unwrap();
    rid
}

fn interval_sql(rid: Ulid, slot: i64) -> String {
    let s = T0 + slot * HOUR;
    let e = s + HOUR;
    format!(
        r#"INSERT INTO allocations (id, resource_id, start, "end") VALUES ('{}', '{rid}', {s}, {e})"#,
        Ulid::new()
    )
}

async fn phase1_sequential(target: &Target) {
    let tenant = fresh_tenant();
    let admin = connect(target, &tenant, &target.admin).await;
    let rid = create_resource(&admin, "concurrent", 10).await;
    let client = connect(target, &tenant, "bench").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&interval_sql(rid, i as i64)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for one unit pool; grants must stop exactly at capacity.
async fn phase2_contention(target: &Target) {
    let tenant = fresh_tenant();
    let admin = connect(target, &tenant, &target.admin).await;
    let capacity = 500u32;
    let pool = create_resource(&admin, "units", capacity).await;

    let n_tasks = 20;
    let n_per_task = 50;
    let granted = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let client = connect(target, &tenant, &format!("student{t}")).await;
        let granted = granted.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..n_per_task {
                let sql = format!(
                    "INSERT INTO allocations (id, resource_id, quantity) VALUES ('{}', '{pool}', 1)",
                    Ulid::new()
                );
                match client.batch_execute(&sql).await {
                    Ok(()) => granted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => refused.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ok = granted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {n_per_task} = {total} requests in {:.2}s: {ok} granted, {} refused (capacity {capacity})",
        elapsed.as_secs_f64(),
        refused.load(Ordering::Relaxed),
    );
    assert!(ok <= capacity as usize, "pool oversold: {ok} > {capacity}");
}

async fn phase3_read_under_load(target: &Target) {
    let tenant = fresh_tenant();
    let admin = connect(target, &tenant, &target.admin).await;
    let rid = create_resource(&admin, "concurrent", 4).await;
    for i in 0..200 {
        admin.batch_execute(&interval_sql(rid, i)).await.unwrap();
    }

    // Writers keep reserving on their own resources in the same tenant
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let wrid = create_resource(&admin, "concurrent", 10).await;
        let client = connect(target, &tenant, &format!("writer{w}")).await;
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&interval_sql(wrid, i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let client = connect(target, &tenant, &format!("reader{r}")).await;
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM availability WHERE resource_id = '{rid}' AND start >= {T0} AND "end" <= {}"#,
                        T0 + 300 * HOUR
                    ))
                    .await
                    .unwrap();
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

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_checkout(target: &Target) {
    let tenant = fresh_tenant();
    let admin = connect(target, &tenant, &target.admin).await;
    let room = create_resource(&admin, "exclusive", 1).await;
    let tickets = create_resource(&admin, "units", 1_000).await;
    let client = connect(target, &tenant, "bench").await;

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n as i64 {
        let s = T0 + i * HOUR;
        let items = format!(
            r#"[{{"resource_id": "{tickets}", "quantity": 1}}, {{"resource_id": "{room}", "start": {s}, "end": {}}}]"#,
            s + HOUR
        );
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO orders (id, items) VALUES ('{}', '{items}')",
                Ulid::new()
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} two-item checkouts in {:.2}s = {:.0} orders/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("checkout latency", &mut latencies);
}

async fn phase5_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_conns {
        let tenant = fresh_tenant();
        let admin = connect(target, &tenant, &target.admin).await;
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let rid = create_resource(&admin, "concurrent", 10).await;
            for i in 0..ops_per_conn {
                admin.batch_execute(&interval_sql(rid, i)).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} tenants, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let env = |var: &str, default: &str| std::env::var(var).unwrap_or_else(|_| default.into());
    let target = Target {
        host: env("RESERVOIR_HOST", "127.0.0.1"),
        port: env("RESERVOIR_PORT", "5433").parse().expect("invalid RESERVOIR_PORT"),
        password: env("RESERVOIR_PASSWORD", "reservoir"),
        // Must be listed in the server's RESERVOIR_ADMIN_USERS
        admin: env("RESERVOIR_BENCH_ADMIN", "facilities"),
    };

    println!("=== reservoir stress benchmark ===");
    println!("target: {}:{} (admin user {})\n", target.host, target.port, target.admin);

    // Each phase uses its own tenant to avoid interference

    println!("[phase 1] sequential reservations");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contended unit pool");
    phase2_contention(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] composite checkout");
    phase4_checkout(&target).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
