use openid_consumer::api::{AppState, start_webserver};
use openid_consumer::config::load_config_or_panic;
use openid_consumer::http::HttpClient;
use openid_consumer::openid::HttpConsumerFactory;
use openid_consumer::registration::DbRegistrations;
use openid_consumer::session::SessionStore;
use openid_consumer::store::{CouchDbStore, StoreBackend};
use rustls::crypto;
use rustls::crypto::CryptoProvider;
use sea_orm::Database;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired associations and stale nonces are swept.
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

fn initialize_tracing() {
    let default_directives = "openid_consumer=info,hyper=warn,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    let _ = dotenvy::dotenv();

    initialize_tracing();

    let (config, settings) = load_config_or_panic();

    let ring_provider = crypto::ring::default_provider();
    CryptoProvider::install_default(ring_provider).expect("Failed to install crypto provider");

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .expect("Failed to connect to database"),
    );

    let http = HttpClient::new()?;
    if let StoreBackend::CouchDb { url } = &settings.store {
        CouchDbStore::new(http.clone(), url.clone())
            .ensure_database()
            .await?;
    }
    tracing::info!(
        store = ?settings.store,
        identifiers_open = settings.authorized_identifiers.is_open(),
        providers_open = settings.authorized_providers.is_open(),
        "consumer configuration"
    );

    // Sweep the association store in the background
    {
        let backend = settings.store.clone();
        let http = http.clone();
        tokio::spawn(async move {
            let mut interval = interval(STORE_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let store = match backend.open(&http).await {
                    Ok(store) => store,
                    Err(e) => {
                        tracing::warn!("Cannot open association store for cleanup: {e}");
                        continue;
                    }
                };
                match (store.cleanup_nonces().await, store.cleanup_associations().await) {
                    (Ok(nonces), Ok(associations)) => {
                        tracing::debug!(nonces, associations, "association store cleaned")
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!("Association store cleanup failed: {e}")
                    }
                }
            }
        });
    }

    let state = AppState {
        settings: Arc::new(settings.clone()),
        sessions: SessionStore::new(config.session.clone()),
        registrations: Arc::new(DbRegistrations::new(db)),
        factory: HttpConsumerFactory::new(http, settings.store),
    };

    start_webserver(state, &config.listen_addr).await?;

    Ok(())
}
