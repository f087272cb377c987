//! # Live Backend Round Trip
//!
//! Runs one signal through PostgreSQL and Redis: schema migration, emission,
//! routing, audit, configuration write and cache invalidation, then prints
//! the dashboard aggregates. Needs `DATABASE_URL` and `REDIS_URL`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use neocortex::configs::NeocortexSettings;
use neocortex::connections::{PgStore, RedisRelay};
use neocortex::core::limbic::EmitOptions;
use neocortex::store::Store;
use neocortex::{CortexModule, Neocortex, SignalType};
use serde_json::json;
use tokio::time::{Duration, timeout};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
    let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;

    let settings = NeocortexSettings::default();
    let store = PgStore::connect(&database_url, 4)?;
    store.ping().await?;
    store.migrate().await?;
    let relay = RedisRelay::connect(&redis_url, &settings.channel).await?;
    let n = Neocortex::new(Arc::new(store), Arc::new(relay), settings);

    let seeded = n.seed_defaults().await?;
    println!("seeded {} config entries", seeded);

    let mut auditif = n.bus().subscribe(CortexModule::Auditif);
    let entity = uuid::Uuid::new_v4().to_string();
    let id = n
        .bus()
        .emit_business(
            SignalType::NominationValidee,
            "nomination",
            &entity,
            json!({ "source": "test_live_backends" }),
            EmitOptions::default(),
        )
        .await?;
    println!("emitted {}", id);

    let routed = n.circadian().route_tick().await;
    println!("routed {} pending signal(s)", routed);
    let delivered = timeout(Duration::from_secs(5), auditif.recv())
        .await
        .context("AUDITIF did not receive the signal")?;
    match delivered {
        Some(signal) if signal.entite_id.as_deref() == Some(entity.as_str()) => {
            println!("AUDITIF received {} for {}", signal.kind, entity)
        }
        Some(other) => println!("AUDITIF received an older signal {}", other.signal_id),
        None => bail!("bus closed"),
    }

    let key = "signal.batch_size";
    let before: u64 = n.plasticity().read_or(key, 0).await;
    let entry = n
        .plasticity()
        .write(key, &json!(before.max(1)), Some("test_live_backends"), None)
        .await?;
    let after: u64 = n.plasticity().read_or(key, 0).await;
    println!("{} = {} (v{}), read back {}", key, entry.valeur, entry.version, after);
    if after != before.max(1) {
        bail!("cached value was not invalidated");
    }

    let stats = n.bus().stats().await?;
    println!("signals: {}", serde_json::to_string_pretty(&stats)?);
    let history = n.hippocampus().stats().await?;
    println!("history: {}", serde_json::to_string_pretty(&history)?);
    let tasks = n.motor().stats().await?;
    println!("tasks: {}", serde_json::to_string_pretty(&tasks)?);

    println!("OK");
    Ok(())
}
