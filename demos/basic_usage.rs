// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic record-store usage example.
//!
//! Demonstrates:
//! 1. Connecting to a backend (SQLite file by default)
//! 2. Writing Records whose field names contain '.' and '$'
//! 3. Counters and field-level updates
//! 4. Cached batch reads
//! 5. Set membership
//! 6. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # Against Redis instead
//! RECORD_STORE_REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use record_store::{Database, Record, StoreConfig};
use serde_json::json;

const DEMO_DB: &str = "./record_store_demo.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           record-store: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and connect
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring record-store...");

    let config = match std::env::var("RECORD_STORE_REDIS_URL") {
        Ok(redis_url) => StoreConfig {
            redis_url: Some(redis_url),
            redis_prefix: Some("demo:".into()),
            ..Default::default()
        },
        Err(_) => StoreConfig {
            sql_url: Some(format!("sqlite://{}?mode=rwc", DEMO_DB)),
            ..Default::default()
        },
    };
    let db = Database::connect(&config).await?;
    println!("   ✅ Connected to {} backend", db.backend_name());

    let objects = db.objects();
    let sets = db.sets();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Records with awkward field names
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing records...");
    let users = [
        ("user:alice", json!({"name": "Alice", "prefs.theme": "dark", "$plan": "pro"})),
        ("user:bob", json!({"name": "Bob", "prefs.theme": "light"})),
        ("user:carol", json!({"name": "Carol"})),
    ];
    let entries: Vec<(&str, Record)> = users
        .iter()
        .filter_map(|(key, value)| value.as_object().map(|r| (*key, r.clone())))
        .collect();
    objects.set_object_bulk(&entries).await?;
    for (key, _) in &entries {
        println!("   └─ {}", key);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Counters and field updates
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔢 Counters...");
    for _ in 0..3 {
        objects.incr_object_field("user:alice", "logins").await?;
    }
    let logins = objects.incr_object_field_by("user:alice", "logins", 10).await?;
    println!("   └─ alice logins: {:?}", logins);

    let bulk_logins = objects
        .incr_objects_field_by(&["user:bob", "user:carol"], "logins", 1)
        .await?;
    println!("   └─ bob/carol logins: {:?}", bulk_logins);

    objects.set_object_field("user:bob", "prefs.theme", json!("dark")).await?;
    objects.delete_object_field("user:carol", "name").await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reads (second batch served from cache)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading back...");
    let keys = ["user:alice", "user:bob", "user:carol", "user:nobody"];
    for (key, record) in keys.iter().zip(objects.get_objects(&keys).await?) {
        println!("   └─ {}: {:?}", key, record);
    }
    objects.get_objects(&keys).await?;

    let theme = objects.get_object_field("user:bob", "prefs.theme").await?;
    println!("   └─ bob prefs.theme = {:?}", theme);

    let stats = db.cache_stats();
    println!(
        "   └─ cache: {} hits / {} misses ({:.0}% hit rate, {} entries)",
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0,
        stats.entry_count
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Sets
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🏷️  Sets...");
    sets.set_add("group:admins", &["user:alice"]).await?;
    sets.sets_add(&["group:beta", "group:all"], &["user:alice", "user:bob"]).await?;
    sets.set_add("group:all", &["user:carol", "user:alice"]).await?;

    println!("   └─ all: {:?}", sets.get_set_members("group:all").await?);
    println!(
        "   └─ counts (admins, beta, all): {:?}",
        sets.sets_count(&["group:admins", "group:beta", "group:all"]).await?
    );
    println!(
        "   └─ is bob in (admins, beta)? {:?}",
        sets.is_member_of_sets(&["group:admins", "group:beta"], "user:bob").await?
    );
    println!("   └─ raffle winner: {:?}", sets.set_remove_random("group:all").await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean up
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🧹 Cleaning up...");
    objects.delete_all(&["user:alice", "user:bob", "user:carol"]).await?;
    objects.delete_all(&["group:admins", "group:beta", "group:all"]).await?;
    if config.sql_url.is_some() {
        for path in [DEMO_DB.to_string(), format!("{}-shm", DEMO_DB), format!("{}-wal", DEMO_DB)] {
            let _ = std::fs::remove_file(path);
        }
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name.to_string(), label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name.to_string(), label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name.to_string(), label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("      └─ {}{} count={} avg={:.6}", name, labels, count, avg);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
