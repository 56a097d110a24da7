use cadence_bridge::{RegistryConfig, ResolverRegistry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RegistryConfig::from_env();
    tracing::info!(
        resolver_dir = %config.resolver_dir.display(),
        storage_root = %config.bridge.storage_root.display(),
        "starting resolver host"
    );

    let registry = match ResolverRegistry::new(config) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("failed to create resolver registry: {e}");
            std::process::exit(1);
        }
    };

    let loaded = registry.load_all().await;
    if loaded.is_empty() {
        tracing::warn!("no resolvers loaded");
    }

    // URLs given on the command line are routed once, then the host keeps
    // serving until interrupted.
    for url in std::env::args().skip(1) {
        match registry.route_url(&url).await {
            Ok(answer) => tracing::info!(url = %url, answer = ?answer, "URL resolved"),
            Err(e) => tracing::warn!(url = %url, "URL lookup failed: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutting down");
    registry.unload_all().await;
}
