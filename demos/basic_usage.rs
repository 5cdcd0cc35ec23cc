// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic globals-engine usage example.
//!
//! Demonstrates:
//! 1. Starting an engine on the in-memory adapter
//! 2. Writing a small patient file with a "B" cross-reference
//! 3. Walking subscripts with `order` and `children`
//! 4. Batch reads and a prefix search
//! 5. A rolled-back transaction
//! 6. Displaying the performance report and raw metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```
//!
//! Set `GLOBALS_SQL_URL=sqlite:///tmp/globals.db?mode=rwc` to run the same
//! steps against SQLite.

use std::time::Duration;

use globals_engine::{
    GlobalAddress, GlobalsConfig, GlobalsEngine, GlobalsError, RoutePreference, Subscript,
    XrefQuery,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

const PATIENTS: [(i64, &str, &str); 5] = [
    (1, "SMITH,JOHN", "M^2450101"),
    (2, "SMITH,JANE", "F^2460512"),
    (3, "JONES,MARY", "F^2391120"),
    (4, "SMYTHE,ALAN", "M^2520704"),
    (5, "BROWN,OLIVER", "M^2611231"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    if recorder.install().is_err() {
        eprintln!("metrics recorder already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          globals-engine: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let config = match std::env::var("GLOBALS_SQL_URL") {
        Ok(url) => GlobalsConfig {
            adapter: "sql".into(),
            url: Some(url),
            ..Default::default()
        },
        Err(_) => GlobalsConfig {
            cache_max_size: 256,
            predictive_loading: true,
            pool_size: 4,
            ..Default::default()
        },
    };
    println!("📦 Adapter: {}", config.adapter);

    let engine = GlobalsEngine::new(config)?;
    engine.start().await?;
    let version = engine.version_info()?;
    println!("   └─ Ready ({} / {})", version.adapter_version, version.database_version);
    println!("   └─ Capabilities: {:?}\n", engine.capabilities()?);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write patients and their name cross-reference
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Writing {} patients...", PATIENTS.len());
    for (dfn, name, rest) in PATIENTS {
        let zero = GlobalAddress::new("DPT", [Subscript::from(dfn), Subscript::from(0)])?;
        engine.set(&zero, &format!("{}^{}", name, rest)).await?;

        let xref = GlobalAddress::new("DPT", [Subscript::from("B"), Subscript::from(name), Subscript::from(dfn)])?;
        engine.set(&xref, "1").await?;
        println!("   └─ ^DPT({},0) = {}", dfn, name);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Walk subscripts
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔎 $ORDER over ^DPT:");
    let mut cursor: GlobalAddress = "^DPT(\"\")".parse()?;
    while let Some(next) = engine.order(&cursor).await? {
        let kind = if next.is_number() { "number" } else { "string" };
        println!("   └─ {} ({})", next, kind);
        cursor = cursor.sibling(next);
    }

    let under_one = engine.children(&"^DPT(1)".parse()?, None).await?;
    println!("   └─ children of ^DPT(1): {:?}", under_one.iter().map(Subscript::as_str).collect::<Vec<_>>());
    println!("   └─ $DATA(^DPT(1)) = {}", engine.data_status(&"^DPT(1)".parse()?).await?.as_code());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Batch read and search
    // ─────────────────────────────────────────────────────────────────────────
    let addresses: Vec<GlobalAddress> = ["^DPT(3,0)", "^DPT(1,0)", "^DPT(3,0)", "^DPT(99,0)"]
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_, GlobalsError>>()?;
    let values = engine.batch_get(&addresses).await?;
    println!("\n📚 Batch read:");
    for (address, value) in addresses.iter().zip(&values) {
        let shown = value.as_str().unwrap_or("<undefined>");
        println!("   └─ {} = {}", address, shown);
    }

    println!("\n🔍 Patients whose name starts with \"SM\":");
    for preference in [RoutePreference::PreferTraversal, RoutePreference::PreferBulk] {
        let query = XrefQuery::new("^DPT(\"B\")".parse()?)
            .with_prefix("SM")
            .with_preference(preference);
        let hits = engine.search(&query).await?;
        let shown: Vec<String> = hits.iter().map(|m| format!("{}→{}", m.value, m.id)).collect();
        println!("   └─ {:?}: {}", preference, shown.join(", "));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Transaction rolled back
    // ─────────────────────────────────────────────────────────────────────────
    let alan: GlobalAddress = "^DPT(4,0)".parse()?;
    let mut tx = engine.start_transaction().await?;
    tx.set(&alan, "SMYTHE,ALAN^M^2520704^DECEASED").await?;
    println!("\n🔄 Inside transaction: {}", tx.get(&alan).await?);
    let transactional = tx.is_transactional();
    tx.rollback().await?;
    println!(
        "   └─ After rollback ({}): {}",
        if transactional { "undone" } else { "no-op transaction" },
        engine.get(&alan).await?
    );

    engine.lock(&alan, Duration::from_millis(100)).await?;
    engine.unlock(&alan).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Stats and raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    let stats = engine.stats();
    println!("\n📊 Performance:");
    println!("   ├─ healthy: {} (latency {:?} ms)", health.healthy, health.backend_latency_ms);
    println!("   ├─ operations: {}", stats.total_operations);
    println!("   ├─ avg response: {:?}", stats.average_response_time);
    println!("   ├─ cache: {} entries, hit rate {:.1}%", stats.cache_size, stats.cache_hit_rate * 100.0);
    println!("   ├─ batches: {}", stats.batch_operations);
    println!("   ├─ searches: {} bulk / {} traversal", stats.bulk_queries, stats.traversal_queries);
    println!("   └─ pool: {} created, peak {} in use", stats.pool.created, stats.pool.peak_in_use);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    engine.shutdown().await;
    println!("\n🛑 Shutdown complete. State: {}", engine.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let shown = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, shown)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
