use std::{sync::Arc, time::Duration};

use feature_flags::{
    overrides, use_flags, FeatureFlagStorage, FileStore, FlagClient, HttpFetcher,
    HttpFetcherConfig, PersistCache, PullConfig,
};

#[tokio::main]
async fn main() -> feature_flags::Result<()> {
    env_logger::init();

    let api_key = std::env::var("FEATURE_FLAGS_API_KEY").unwrap_or_default();
    let base_url = std::env::var("FEATURE_FLAGS_BASE_URL")
        .unwrap_or_else(|_| HttpFetcherConfig::DEFAULT_BASE_URL.to_owned());

    let storage = Arc::new(FeatureFlagStorage::new());
    // Flags forced through the environment win over anything the server says.
    storage.use_interceptor(overrides::fixed(overrides::from_env_vars(
        "FEATURE_FLAG_",
        std::env::vars(),
    )));

    let client = FlagClient::new(storage.clone()).with_cache(PersistCache::new(Arc::new(
        FileStore::new(std::env::temp_dir().join("feature-flags-demo")),
    )));

    let _subscription = use_flags(&storage, || println!("flags changed"));

    let fetcher = HttpFetcher::new(HttpFetcherConfig::from_api_key(api_key).base_url(base_url))?;
    let result = client
        .pull_feature_flags(
            PullConfig::new()
                .fetch_feature_gating(fetcher)
                .polling_interval(Duration::from_secs(10)),
        )
        .await?;

    println!("Resolved {} flags from {}", result.values.len(), result.source);

    let flags = storage.get_flags()?;
    for key in flags.keys() {
        println!("{key}: {}", flags.get(&key));
    }

    client.stop_polling();
    Ok(())
}
