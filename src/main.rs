//! Fanout Demo Broker
//!
//! Self-contained key-shared dispatch run: an in-memory segmented log, a
//! producer with a seeded key stream, simulated consumers with permit
//! windows, and the dispatcher wired in between. Halfway through, one
//! consumer leaves and a late joiner arrives to exercise the
//! recently-joined fence.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanout_backend::{
    BrokerConfig, Consumer, Cursor, DispatchError, Entry, HashRange, KeySharedMode, MemoryCursor,
    MemoryLedger, Position, StickyKeyDispatcher,
};

#[derive(Parser, Debug)]
#[command(name = "fanoutd", about = "Key-shared dispatch demo broker")]
struct Args {
    /// Consumers to start with
    #[arg(long, default_value_t = 3, env = "FANOUT_CONSUMERS")]
    consumers: usize,

    /// Distinct sticky keys in the produced stream
    #[arg(long, default_value_t = 64)]
    keys: u32,

    /// Total entries to produce
    #[arg(long, default_value_t = 5000)]
    entries: u64,

    /// Permit window per consumer
    #[arg(long, default_value_t = 200)]
    permits: i32,

    /// Seed of the key stream (reruns are identical)
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Skip mid-run consumer churn
    #[arg(long)]
    no_churn: bool,

    /// Optional TOML config path
    #[arg(long, env = "FANOUT_CONFIG_PATH")]
    config: Option<String>,
}

/// Consumer that acks everything it receives through a channel-fed task.
struct SimulatedConsumer {
    name: String,
    permits: AtomicI32,
    unacked: AtomicI32,
    max_unacked: i32,
    delivered: AtomicU64,
    acks: mpsc::UnboundedSender<Position>,
    claims: Option<Vec<HashRange>>,
}

impl SimulatedConsumer {
    fn new(
        name: impl Into<String>,
        permits: i32,
        claims: Option<Vec<HashRange>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Position>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            name: name.into(),
            permits: AtomicI32::new(permits),
            unacked: AtomicI32::new(0),
            max_unacked: permits * 2,
            delivered: AtomicU64::new(0),
            acks: tx,
            claims,
        });
        (consumer, rx)
    }
}

#[async_trait::async_trait]
impl Consumer for SimulatedConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_entries(&self, batch: Vec<Arc<Entry>>) -> Result<(), DispatchError> {
        self.permits.fetch_sub(batch.len() as i32, Ordering::SeqCst);
        self.unacked.fetch_add(batch.len() as i32, Ordering::SeqCst);
        self.delivered.fetch_add(batch.len() as u64, Ordering::SeqCst);
        for entry in &batch {
            // A dropped receiver means the demo is shutting down.
            if self.acks.send(entry.position).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn available_permits(&self) -> i32 {
        self.permits.load(Ordering::SeqCst)
    }

    fn unacked_messages(&self) -> i32 {
        self.unacked.load(Ordering::SeqCst)
    }

    fn max_unacked_messages(&self) -> i32 {
        self.max_unacked
    }

    fn claimed_hash_ranges(&self) -> Option<Vec<HashRange>> {
        self.claims.clone()
    }
}

/// Ack loop of one consumer: return permits, advance the cursor, and tell
/// the dispatcher when the mark-delete pointer moved.
async fn run_acker(
    mut rx: mpsc::UnboundedReceiver<Position>,
    consumer: Arc<SimulatedConsumer>,
    cursor: Arc<MemoryCursor>,
    dispatcher: StickyKeyDispatcher,
) {
    while let Some(position) = rx.recv().await {
        consumer.unacked.fetch_sub(1, Ordering::SeqCst);
        consumer.permits.fetch_add(1, Ordering::SeqCst);
        if let Some(mark_delete) = cursor.ack(position) {
            dispatcher.on_mark_delete_advanced(mark_delete);
        }
        dispatcher.notify();
    }
}

async fn run_producer(
    ledger: Arc<MemoryLedger>,
    dispatcher: StickyKeyDispatcher,
    entries: u64,
    keys: u32,
    seed: u64,
) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for i in 0..entries {
        let key = format!("key-{}", rng.gen_range(0..keys));
        ledger.append(key, format!("payload-{i}"));
        dispatcher.notify();
        if i % 512 == 511 {
            sleep(Duration::from_millis(5)).await;
        }
    }
    info!(entries, "producer finished");
}

/// Equal slices of the hash space for Sticky-mode claims. One spare slice
/// stays unclaimed for the late joiner.
fn sticky_claims(slot: usize, slots: usize) -> Vec<HashRange> {
    let n = slots as u64;
    let start = ((slot as u64) << 32).div_ceil(n) as u32;
    let end = ((((slot as u64 + 1) << 32).div_ceil(n)) - 1) as u32;
    vec![HashRange { start, end }]
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::from_env(),
    };
    let sticky = config.subscription.key_shared_mode == KeySharedMode::Sticky;
    let slots = args.consumers + 1; // spare slice for the late joiner

    info!(
        consumers = args.consumers,
        keys = args.keys,
        entries = args.entries,
        mode = ?config.subscription.key_shared_mode,
        "fanoutd starting"
    );

    let ledger = Arc::new(MemoryLedger::new(config.entries_per_ledger));
    let cursor = Arc::new(MemoryCursor::new(ledger.clone()));
    let dispatcher = StickyKeyDispatcher::new(
        "demo-subscription",
        cursor.clone(),
        config.subscription.clone(),
    );

    let consumers: Arc<Mutex<Vec<Arc<SimulatedConsumer>>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..args.consumers {
        let claims = sticky.then(|| sticky_claims(i, slots));
        let (consumer, rx) = SimulatedConsumer::new(format!("consumer-{i}"), args.permits, claims);
        dispatcher.add_consumer(consumer.clone())?;
        tokio::spawn(run_acker(
            rx,
            consumer.clone(),
            cursor.clone(),
            dispatcher.clone(),
        ));
        consumers.lock().push(consumer);
    }

    dispatcher.start();
    tokio::spawn(run_producer(
        ledger.clone(),
        dispatcher.clone(),
        args.entries,
        args.keys,
        args.seed,
    ));

    // Stats ticker.
    {
        let dispatcher = dispatcher.clone();
        let ledger = ledger.clone();
        let cursor = cursor.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let stats = dispatcher.stats();
                info!(
                    produced = ledger.len(),
                    dispatched = stats.entries_dispatched,
                    redelivered = stats.entries_redelivered,
                    pending_replays = dispatcher.pending_redeliveries(),
                    mark_delete = %cursor
                        .mark_delete_position()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".into()),
                    "progress"
                );
            }
        });
    }

    // Mid-run churn: one consumer leaves, a late joiner arrives fenced.
    if !args.no_churn && args.consumers > 1 {
        let dispatcher = dispatcher.clone();
        let cursor = cursor.clone();
        let consumers = consumers.clone();
        let permits = args.permits;
        // The late joiner takes the spare slice plus the one consumer-0
        // frees, so every hash keeps an owner.
        let late_claims = sticky.then(|| {
            let mut claims = sticky_claims(args.consumers, slots);
            claims.extend(sticky_claims(0, slots));
            claims
        });
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            if let Err(e) = dispatcher.remove_consumer("consumer-0") {
                warn!(error = %e, "churn: removing consumer-0 failed");
            } else {
                info!("churn: consumer-0 left");
            }
            let (late, rx) = SimulatedConsumer::new("late-joiner", permits, late_claims);
            match dispatcher.add_consumer(late.clone()) {
                Ok(fence) => {
                    info!(fence = ?fence.map(|p| p.to_string()), "churn: late-joiner subscribed");
                    consumers.lock().push(late.clone());
                    tokio::spawn(run_acker(rx, late, cursor, dispatcher));
                }
                Err(e) => warn!(error = %e, "churn: late join failed"),
            }
        });
    }

    // Run until the whole stream is produced and acknowledged, or ctrl-c.
    let drained = async {
        loop {
            sleep(Duration::from_millis(200)).await;
            let produced = ledger.len() as u64 == args.entries;
            let acked = cursor.mark_delete_position() == ledger.last_position();
            if produced && acked && ledger.last_position().is_some() {
                break;
            }
        }
    };
    tokio::select! {
        _ = drained => info!("stream fully dispatched and acknowledged"),
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    dispatcher.close();
    cursor.close();

    let summary = serde_json::json!({
        "produced": ledger.len(),
        "stats": dispatcher.stats(),
        "per_consumer": consumers
            .lock()
            .iter()
            .map(|c| (c.name.clone(), c.delivered.load(Ordering::SeqCst)))
            .collect::<std::collections::HashMap<_, _>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
