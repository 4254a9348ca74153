mod auth;
mod browser;
mod classifier;
mod coerce;
mod currency;
mod enrich;
mod http;
mod models;
mod normalize;
mod reconcile;
mod status;
mod store;
mod supabase;
mod sync;

use crate::browser::HttpBrowserFactory;
use crate::classifier::{ClassifierConfig, GatewayClassifier};
use crate::currency::{CurrencyCache, HttpRateFetcher};
use crate::enrich::{CancelToken, NullSink};
use crate::store::{Base64Cipher, CredentialStore, MemoryStore, SyncStore};
use crate::supabase::SupabaseStore;
use crate::sync::{SyncConfig, SyncService};
use eyre::WrapErr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "parcelsync.main", "sync run failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let owner_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SYNC_OWNER_ID").ok())
        .ok_or_else(|| eyre::eyre!("owner id required: first argument or SYNC_OWNER_ID"))?;

    let (store, credentials): (Arc<dyn SyncStore>, Arc<dyn CredentialStore>) =
        match SupabaseStore::from_env() {
            Some(supabase) => {
                let supabase = Arc::new(supabase);
                (supabase.clone(), supabase)
            }
            None => {
                warn!(
                    target = "parcelsync.main",
                    "SUPABASE_URL not set, records will not be persisted"
                );
                let memory = Arc::new(MemoryStore::new());
                (memory.clone(), memory)
            }
        };

    let service = SyncService::new(
        SyncConfig::from_env(),
        store,
        credentials,
        Arc::new(Base64Cipher),
        Arc::new(HttpBrowserFactory),
        Arc::new(GatewayClassifier::new(ClassifierConfig::from_env())),
        Arc::new(CurrencyCache::new(Box::new(HttpRateFetcher::from_env()))),
    );

    let report = service
        .run(&owner_id, &CancelToken::new(), &NullSink)
        .await
        .wrap_err("sync run failed")?;

    info!(
        target = "parcelsync.main",
        run_id = %report.run_id,
        parcels = report.parcels_count,
        orders = report.orders_count,
        message = %report.message,
        "sync finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&report).wrap_err("report serialization")?
    );
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,parcelsync=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
