use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, user: &str, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("tourdesk")
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn date_ahead(days: u64) -> NaiveDate {
    Utc::now().date_naive().checked_add_days(Days::new(days)).unwrap()
}

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

impl Target {
    async fn as_user(&self, user: &str) -> Client {
        connect(&self.host, self.port, user, &self.password).await
    }

    async fn tourist(&self) -> Client {
        self.as_user(&format!("tourist_{}", Ulid::new())).await
    }
}

/// Propose and approve a tour with `capacity` seats per date and
/// `guides` co-guides. Returns the tour id.
async fn publish_tour(target: &Target, name: &str, capacity: u32, guides: usize) -> Ulid {
    let admin = target.as_user(&format!("admin_{}", Ulid::new())).await;
    let author = Ulid::new();
    let guide = target.as_user(&format!("guide_{author}")).await;

    let mut entries = vec![format!(r#"{{"guide_id": "{author}", "is_main": true}}"#)];
    entries.extend((1..guides).map(|_| format!(r#"{{"guide_id": "{}"}}"#, Ulid::new())));
    let body = format!(
        r#"{{"name": "{name}", "duration_minutes": 120, "price": 2000, "max_guests": {capacity},
            "max_days_advance": 3000, "guides": [{}]}}"#,
        entries.join(",")
    );

    let proposal = Ulid::new();
    guide
        .batch_execute(&format!("INSERT INTO proposals (id, body) VALUES ('{proposal}', '{body}')"))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO proposal_reviews (proposal_id, decision) VALUES ('{proposal}', 'approve')"
        ))
        .await
        .unwrap();

    let rows = admin.query("SELECT * FROM tours", &[]).await.unwrap();
    let row = rows
        .iter()
        .find(|r| r.get::<_, String>("name") == name)
        .expect("published tour missing");
    Ulid::from_string(&row.get::<_, String>("id")).unwrap()
}

async fn book(client: &Client, tour_id: Ulid, date: NaiveDate, adults: u32) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, tour_id, start_date, adults, full_name, email, phone) \
             VALUES ('{}', '{tour_id}', '{date}', {adults}, 'Bench Guest', 'bench@example.com', '+1 555 0100')",
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(target: &Target) {
    let tour_id = publish_tour(target, &format!("Sequential {}", Ulid::new()), 1000, 1).await;
    let client = target.tourist().await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = date_ahead(1 + (i % 2500) as u64);
        let t = Instant::now();
        book(&client, tour_id, date, 1).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("admission latency", &mut latencies);
}

/// Many tourists race for one departure; exactly `capacity` seats go.
async fn phase2_contended_departure(target: &Target) {
    let capacity = 50;
    let tour_id = publish_tour(target, &format!("Contended {}", Ulid::new()), capacity, 3).await;
    let date = date_ahead(30);

    let n_tasks = 20;
    let n_per_task = 10;
    let admitted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let target = target.clone();
        let admitted = admitted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = target.tourist().await;
            for _ in 0..n_per_task {
                match book(&client, tour_id, date, 1).await {
                    Ok(()) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let admitted = admitted.load(Ordering::Relaxed);
    println!(
        "  {} requests for {capacity} seats in {:.2}s: {admitted} admitted, {} rejected",
        n_tasks * n_per_task,
        elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed)
    );
    assert_eq!(admitted, capacity as usize, "capacity must never be exceeded");
}

async fn phase3_read_under_load(target: &Target) {
    let tour_id = publish_tour(target, &format!("Reads {}", Ulid::new()), 1000, 2).await;
    let date = date_ahead(45);

    let writer_target = target.clone();
    let writer = tokio::spawn(async move {
        let client = writer_target.tourist().await;
        for i in 0..1000u64 {
            let _ = book(&client, tour_id, date_ahead(1 + i % 300), 1).await;
        }
    });

    let reader = target.tourist().await;
    let mut latencies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !writer.is_finished() {
        let t = Instant::now();
        reader
            .query(
                "SELECT * FROM capacity WHERE tour_id = $1 AND date = $2",
                &[&tour_id.to_string(), &date.to_string()],
            )
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();
    print_latency("capacity read latency", &mut latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let tour_id = publish_tour(target, &format!("Storm {}", Ulid::new()), 1000, 4).await;
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for c in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = target.tourist().await;
            for i in 0..ops_per_conn {
                book(&client, tour_id, date_ahead(1 + (c * ops_per_conn + i) as u64), 1)
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TOURDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TOURDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid TOURDESK_PORT");
    let password = std::env::var("TOURDESK_PASSWORD").unwrap_or_else(|_| "tourdesk".into());
    let target = Target { host, port, password };

    println!("=== tourdesk stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential admissions");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contended departure");
    phase2_contended_departure(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
