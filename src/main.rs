//! Attestor - price attestation oracle service.
//!
//! Boot order: env + tracing, load the signing key from the encrypted
//! secret file, open the event store, start the price sources, seed the
//! default event classes, start the scheduler loops, serve the API.

use anyhow::{Context, Result};
use chrono::Utc;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attestor_backend::codec::EVENT_STRING_TEMPLATE_DEFAULT;
use attestor_backend::config::Config;
use attestor_backend::crypto::{secret_file, KeySigner};
use attestor_backend::oracle::{Oracle, OracleApp};
use attestor_backend::price::{
    BinancePriceSource, BitstampPriceSource, CoinbasePriceSource, KrakenPriceSource,
    PriceAggregator, PriceSource,
};
use attestor_backend::scheduler::Scheduler;
use attestor_backend::store::{EventClassRow, EventStore, SqliteEventStore};
use attestor_backend::{api, config};

/// Classes seeded on first boot: (class id, definition, digits, period).
const DEFAULT_EVENT_CLASSES: &[(&str, &str, u32, i64)] = &[
    ("btcusd", "BTCUSD", 7, 10 * 60),
    ("btceur", "BTCEUR", 7, 12 * 3600),
];

/// How far out a seeded class keeps generating events.
const DEFAULT_CLASS_LIFETIME_SECS: i64 = 5 * 365 * 86_400;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("starting attestor oracle");
    let config = Config::from_env().context("configuration")?;

    // Crypto facade: one signer per process.
    let secret = secret_file::load(&config.key_secret_file_name, &config.key_secret_pwd)
        .context("load secret file")?;
    let signer = Arc::new(KeySigner::init(&secret.entropy, secret.network)?);
    info!(
        network = %secret.network,
        public_key = %signer.public_key(0)?,
        "signer loaded"
    );

    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(&config.db_dir)?);

    let coinbase_source = CoinbasePriceSource::spawn();
    let sources: Vec<Arc<dyn PriceSource>> = vec![
        Arc::new(BitstampPriceSource::new()),
        Arc::new(BinancePriceSource::new(false)),
        Arc::new(KrakenPriceSource::new()),
        coinbase_source,
    ];
    let prices = PriceAggregator::new(
        sources,
        vec!["BTCUSD".to_string(), "BTCEUR".to_string()],
    );
    info!("price aggregator started with 4 sources");

    seed_default_event_classes(store.as_ref(), &signer).await?;

    let defer_nonces = std::env::var("DEFER_NONCES")
        .map(|v| config::flag_is_set(&v))
        .unwrap_or(false);
    let scheduler = Scheduler::new(
        store.clone(),
        signer.clone(),
        prices.clone(),
        config.horizon_days,
        defer_nonces,
    );
    scheduler.spawn();

    let oracle = Oracle::new(store, prices, signer, config.horizon_days)?;
    let app = Arc::new(OracleApp {
        oracle,
        demo_mode: config.demo_mode,
    });
    if config.demo_mode {
        info!("demo mode on: schema and outcome-preview endpoints enabled");
    }

    let router = api::router(app);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");
    axum::serve(listener, router).await.context("server error")?;

    Ok(())
}

/// Insert the default event classes if this is a fresh database. Classes
/// are immutable once present; reboots never touch them.
async fn seed_default_event_classes(store: &dyn EventStore, signer: &KeySigner) -> Result<()> {
    let now = Utc::now().timestamp();
    let signer_public_key = signer.public_key(0)?;

    for (id, definition, digits, period) in DEFAULT_EVENT_CLASSES {
        let repeat_first_time = (now / period) * period;
        let class = EventClassRow {
            id: id.to_string(),
            create_time: now,
            definition: definition.to_string(),
            range_digits: *digits,
            range_digit_low_pos: 0,
            string_template: EVENT_STRING_TEMPLATE_DEFAULT.to_string(),
            repeat_first_time,
            repeat_period: *period,
            repeat_offset: repeat_first_time.rem_euclid(*period),
            repeat_last_time: repeat_first_time + DEFAULT_CLASS_LIFETIME_SECS,
            signer_public_key: signer_public_key.clone(),
        };
        if store.insert_class_if_missing(&class).await? == 1 {
            info!(class_id = %id, definition = %definition, period = *period, "event class seeded");
        }
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attestor_backend=info,attestor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    dotenv().ok();
}
