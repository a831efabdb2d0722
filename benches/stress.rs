use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use ulid::Ulid;

use swimbook::clock::SystemClock;
use swimbook::config::BookingPolicy;
use swimbook::engine::{Engine, NewInstance};
use swimbook::model::*;
use swimbook::notify::NotifyHub;

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn monday(week: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap().and_hms_opt(15, 0, 0).unwrap()
        + TimeDelta::weeks(week as i64)
}

async fn engine(journal: bool) -> Arc<Engine> {
    let notify = Arc::new(NotifyHub::new());
    let policy = BookingPolicy::default();
    if journal {
        let path = std::env::temp_dir().join(format!("swimbook_bench_{}.wal", Ulid::new()));
        Arc::new(Engine::new(path, notify, Arc::new(SystemClock), policy).unwrap())
    } else {
        Arc::new(Engine::in_memory(notify, Arc::new(SystemClock), policy))
    }
}

/// One weekly slot per (week, lane): lanes are parallel lessons at 15:00.
async fn seed(engine: &Engine, weeks: u32, lanes: u32, capacity: u32) -> Vec<Vec<InstanceId>> {
    let mut by_lane = vec![Vec::new(); lanes as usize];
    for lane in 0..lanes {
        let instructor = Ulid::new();
        for week in 0..weeks {
            let start = monday(week);
            let instance = engine
                .create_instance(NewInstance {
                    id: None,
                    span: Span::new(start, start + TimeDelta::minutes(30)),
                    instructor_id: instructor,
                    location: format!("lane-{lane}"),
                    capacity,
                    booked_count: 0,
                    kind: SessionKind::Recurring,
                })
                .await
                .unwrap();
            by_lane[lane as usize].push(instance.id);
        }
    }
    by_lane
}

async fn phase1_hold_churn(journal: bool) {
    let engine = engine(journal).await;
    let lanes = seed(&engine, 1, 1, 1).await;
    let id = lanes[0][0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let holder = format!("checkout-{i}");
        let t = Instant::now();
        engine.acquire_hold(id, &holder).await.unwrap();
        engine.release_hold(id, &holder).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} acquire+release pairs in {:.2}s = {:.0} pairs/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("pair latency", &mut latencies);
}

async fn phase2_hot_slot(journal: bool) {
    let engine = engine(journal).await;
    let lanes = seed(&engine, 1, 1, 1).await;
    let id = lanes[0][0];

    let contenders = 500;
    let booked = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..contenders {
        let engine = engine.clone();
        let booked = booked.clone();
        handles.push(tokio::spawn(async move {
            if engine.confirm_booking(Ulid::new(), vec![id]).await.is_ok() {
                booked.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let count = engine.get_instance(id).await.unwrap().booked_count;
    println!(
        "  {contenders} families racing for one slot: {} booked, booked_count={count} in {:.2}s",
        booked.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert_eq!(count, 1, "slot overbooked");
}

async fn phase3_series_bookings(journal: bool) {
    let engine = engine(journal).await;
    let lanes = seed(&engine, 12, 20, 4).await;

    let families = 100;
    let start = Instant::now();
    let mut handles = Vec::new();
    for f in 0..families {
        let engine = engine.clone();
        let series = lanes[f % lanes.len()].clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let ok = engine.confirm_booking(Ulid::new(), series).await.is_ok();
            (ok, t.elapsed())
        }));
    }

    let mut latencies = Vec::new();
    let mut confirmed = 0;
    for h in handles {
        let (ok, latency) = h.await.unwrap();
        if ok {
            confirmed += 1;
        }
        latencies.push(latency);
    }
    println!(
        "  {families} families booking 12-week series: {confirmed} confirmed in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("series confirm latency", &mut latencies);

    for lane in &lanes {
        for id in lane {
            let instance = engine.get_instance(*id).await.unwrap();
            assert!(instance.booked_count <= instance.capacity, "lane overbooked");
        }
    }
}

async fn phase4_resolve_under_load(journal: bool) {
    let engine = engine(journal).await;
    let lanes = seed(&engine, 52, 10, 50).await;

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        let lane = lanes[w].clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let id = lane[i % lane.len()];
                let holder = format!("writer-{w}");
                let _ = engine.acquire_hold(id, &holder).await;
                let _ = engine.release_hold(id, &holder).await;
                i += 1;
            }
        }));
    }

    let pattern = RecurringPattern {
        day_of_week: Weekday::Mon,
        time_of_day: NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
        range_start: monday(0).date(),
        range_end: monday(51).date(),
        instructor_id: None,
    };
    let mut latencies = Vec::with_capacity(500);
    for _ in 0..500 {
        let t = Instant::now();
        let series = engine.resolve_recurring(&pattern).await.unwrap();
        latencies.push(t.elapsed());
        assert_eq!(series.matched.len(), 520);
    }

    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("resolve (52 weeks x 10 lanes)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let journal = std::env::var("SWIMBOOK_BENCH_JOURNAL").is_ok_and(|v| v != "0");

    println!("=== swimbook stress benchmark ===");
    println!("journal: {}\n", if journal { "on" } else { "off" });

    println!("[phase 1] hold churn on one slot");
    phase1_hold_churn(journal).await;

    println!("\n[phase 2] hot slot contention");
    phase2_hot_slot(journal).await;

    println!("\n[phase 3] concurrent series bookings");
    phase3_series_bookings(journal).await;

    println!("\n[phase 4] recurring resolution under hold churn");
    phase4_resolve_under_load(journal).await;

    println!("\n=== done ===");
}
