use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roomd::engine::{Engine, EngineOptions};
use roomd::model::format_time_of_day;
use roomd::wire;

const PASSWORD: &str = "roomd";
const SLOT_SECS: u32 = 1800;
const SLOTS_PER_DAY: usize = 48;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let dir = std::env::temp_dir().join(format!("roomd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create data dir");
    let engine = Arc::new(Engine::new(dir.join("roomd.wal"), EngineOptions::default()).expect("open engine"));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.into(), "whsec_bench".into(), None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roomd")
        .user(user)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// First column of the first row.
async fn scalar(client: &Client, sql: &str) -> String {
    client
        .simple_query(sql)
        .await
        .expect("query failed")
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => r.get(0).map(str::to_string),
            _ => None,
        })
        .expect("no row returned")
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

/// The `n`th half-hour slot counting from tomorrow.
fn slot(n: usize) -> (NaiveDate, String, String) {
    let day = Utc::now().date_naive() + Days::new(1 + (n / SLOTS_PER_DAY) as u64);
    let start = (n % SLOTS_PER_DAY) as u32 * SLOT_SECS;
    (day, format_time_of_day(start), format_time_of_day(start + SLOT_SECS))
}

fn booking_sql(room_id: &str, n: usize) -> String {
    let (date, start, end) = slot(n);
    format!(
        "INSERT INTO bookings (room_id, booking_date, start_time, end_time, purpose) \
         VALUES ({room_id}, '{date}', '{start}', '{end}', 'bench')"
    )
}

struct Fixture {
    admin: String,
    rooms: Vec<String>,
}

async fn setup(addr: SocketAddr) -> Fixture {
    let anonymous = connect(addr, "anonymous").await;
    let admin_id = scalar(
        &anonymous,
        "INSERT INTO admins (username, email, password_hash, first_name, last_name) \
         VALUES ('bench', 'bench@campus.test', 'x', 'Bench', 'Admin') RETURNING id",
    )
    .await;
    let admin = format!("admin:{admin_id}");
    let client = connect(addr, &admin).await;

    let mut rooms = Vec::new();
    for i in 0..10 {
        let id = scalar(
            &client,
            &format!(
                "INSERT INTO rooms (room_number, room_name, capacity, hourly_rate, requires_approval) \
                 VALUES ('R{i:03}', 'Bench room {i}', 10, '20.00', false) RETURNING id"
            ),
        )
        .await;
        rooms.push(id);
    }
    println!("  created {} rooms", rooms.len());
    Fixture { admin, rooms }
}

async fn new_visitor(addr: SocketAddr) -> String {
    let anonymous = connect(addr, "anonymous").await;
    let id = scalar(
        &anonymous,
        &format!(
            "INSERT INTO visitors (email, password_hash, first_name, last_name) \
             VALUES ('{}@bench.test', 'x', 'Bench', 'Visitor') RETURNING id",
            Ulid::new().to_string().to_lowercase()
        ),
    )
    .await;
    format!("visitor:{id}")
}

async fn phase1_sequential(addr: SocketAddr, room_id: &str) {
    let client = connect(addr, &new_visitor(addr).await).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&booking_sql(room_id, i)).await.expect("booking failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task races for the same slots. Exactly one booking per slot may win.
async fn phase2_contended(addr: SocketAddr, room_id: &str) {
    let n_tasks = 10;
    let n_slots = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let room_id = room_id.to_string();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &new_visitor(addr).await).await;
            for n in 0..n_slots {
                match client.batch_execute(&booking_sql(&room_id, n)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("23P01") => lost.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots;
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} attempts in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!("  won={won} lost={} (expected won={n_slots})", lost.load(Ordering::Relaxed));
    assert_eq!(won, n_slots, "double booking detected");
}

async fn phase3_read_under_load(addr: SocketAddr, fixture: &Fixture) {
    let read_room = fixture.rooms[2].clone();
    let writer_rooms = fixture.rooms[3..8].to_vec();

    let seed = connect(addr, &new_visitor(addr).await).await;
    for i in (0..SLOTS_PER_DAY).step_by(3) {
        seed.batch_execute(&booking_sql(&read_room, i)).await.expect("seed failed");
    }
    drop(seed);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for room_id in writer_rooms {
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(addr, &new_visitor(addr).await).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&booking_sql(&room_id, i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    let (date, _, _) = slot(0);
    for r in 0..n_readers {
        let room_id = read_room.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(addr, "anonymous").await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = if (r + i) % 2 == 0 {
                    format!("SELECT * FROM free_slots WHERE room_id = {room_id} AND booking_date = '{date}'")
                } else {
                    format!(
                        "SELECT * FROM availability WHERE room_id = {room_id} AND booking_date = '{date}' \
                         AND start_time = '10:00' AND end_time = '11:00'"
                    )
                };
                let t = Instant::now();
                client.simple_query(&sql).await.expect("read failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(addr: SocketAddr, fixture: &Fixture) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let room_id = fixture.rooms[9].clone();

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let success = success.clone();
        let room_id = room_id.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &new_visitor(addr).await).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&booking_sql(&room_id, c * ops_per_conn + i))
                    .await
                    .expect("booking failed");
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
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== roomd stress benchmark ===");
    let addr = start_server().await;
    println!("target: {addr}\n");

    println!("[setup]");
    let fixture = setup(addr).await;
    let admin = connect(addr, &fixture.admin).await;

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(addr, &fixture.rooms[0]).await;

    println!("\n[phase 2] contended writes on one room");
    phase2_contended(addr, &fixture.rooms[1]).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(addr, &fixture).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr, &fixture).await;

    let stats = admin.simple_query("SELECT * FROM stats").await.expect("stats failed");
    if let Some(SimpleQueryMessage::Row(row)) = stats.first() {
        println!("\n  total bookings: {}", row.get("total_bookings").unwrap_or("?"));
    }
    println!("\n=== benchmark complete ===");
}
