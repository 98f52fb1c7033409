//! End-to-end throughput benchmark for Courier.
//!
//! Drives an in-process bus with concurrent publishers and subscribers and
//! reports delivered messages per second.
//!
//! Usage: `e2e_throughput [subscribers] [publishers] [config.toml]`

use anyhow::{Context, Result};
use courier_core::{BusConfig, BusError, MessageBus, MessageResult, Subscriber};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TOPIC: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "error".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_subscribers = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let num_publishers = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);
    let config = match args.get(3) {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => BusConfig::load().context("Failed to load config")?,
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Courier In-Process Throughput Benchmark              ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(config, num_subscribers, num_publishers).await
}

async fn run_pubsub_benchmark(
    config: BusConfig,
    num_subscribers: usize,
    num_publishers: usize,
) -> Result<()> {
    println!(
        "📊 Pub/Sub Benchmark: {} subscribers, {} publishers",
        num_subscribers, num_publishers
    );
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    info!(?config, "Starting bus");
    let bus = Arc::new(MessageBus::new(config)?);
    let delivered = Arc::new(AtomicU64::new(0));
    let published = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));

    let mut subscriptions = Vec::with_capacity(num_subscribers);
    for n in 0..num_subscribers {
        let delivered = Arc::clone(&delivered);
        let handler = move |result: MessageResult| {
            delivered.fetch_add(result.total_count as u64, Ordering::Relaxed);
            async { Ok::<_, BusError>(true) }
        };
        subscriptions.push(bus.subscribe(
            &Subscriber::new(format!("sub-{}", n), [TOPIC]),
            None,
            None,
            handler,
        )?);
    }
    println!("✓ {} subscribers registered", num_subscribers);

    let mut publishers = Vec::with_capacity(num_publishers);
    for n in 0..num_publishers {
        let bus = Arc::clone(&bus);
        let published = Arc::clone(&published);
        let running = Arc::clone(&running);
        publishers.push(tokio::spawn(async move {
            let source = format!("pub-{}", n);
            let payload = vec![0u8; 64];
            while running.load(Ordering::Relaxed) {
                if bus.publish(&source, TOPIC, payload.clone()).is_err() {
                    break;
                }
                published.fetch_add(1, Ordering::Relaxed);
                // Small yield to not starve the workers
                tokio::task::yield_now().await;
            }
        }));
    }

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_delivered = delivered.load(Ordering::SeqCst);
    let total_published = published.load(Ordering::SeqCst);
    running.store(false, Ordering::SeqCst);
    for publisher in publishers {
        publisher.await?;
    }

    let delivered_per_sec = total_delivered as f64 / elapsed.as_secs_f64();
    let published_per_sec = total_published as f64 / elapsed.as_secs_f64();
    let stats = bus.stats();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Subscribers:          {:>10}                           ║",
        num_subscribers
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Published:            {:>10.0} msg/s                    ║",
        published_per_sec
    );
    println!(
        "║  Delivered:            {:>10.0} msg/s                    ║",
        delivered_per_sec
    );
    println!(
        "║  Workers (alive/busy): {:>6}/{:<6}                        ║",
        stats.allocated_workers, stats.busy_workers
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for subscription in subscriptions {
        subscription.dispose().await?;
    }
    bus.shutdown();
    Ok(())
}
