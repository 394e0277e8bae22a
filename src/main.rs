use std::{error::Error, process, sync::Arc};

use swrproxy::{
    cache::{CacheStore, DiskStore, MemoryStore},
    config::{self, CacheBackend, Settings},
    fetch::{Fetch, Forward, HttpFetcher},
    interceptor::Interceptor,
    middleware::{LoggerMiddleware, Pipeline},
    server::Server,
    telemetry,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // The subscriber may not be installed yet.
        eprintln!("swrproxy: {err}");
        error!(error = %err, "swrproxy exited with an error");
        process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = config::load_from_args()?;
    telemetry::init(&settings.logging)?;

    let store = open_store(&settings).await?;
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(settings.origin.clone())?);

    let interceptor = Interceptor::builder(
        Arc::clone(&store),
        Arc::clone(&fetcher),
        settings.origin.clone(),
        settings.cache.generation.clone(),
    )
    .filter(settings.cache.filter.clone())
    .key_headers(settings.cache.key_headers.clone())
    .max_entry_bytes(settings.cache.max_entry_bytes)
    .build();

    let report = interceptor.activate().await;
    if !report.is_clean() {
        warn!(
            failed = report.failed.len(),
            "some out-of-date cache generations could not be deleted"
        );
    }

    let handler = Pipeline::new()
        .layer(LoggerMiddleware)
        .layer(interceptor.clone())
        .layer(Forward::new(fetcher))
        .into_handler();

    let server = Server::bind(settings.server.listen.to_string()).await?;
    info!(
        origin = %settings.origin,
        generation = %settings.cache.generation,
        store = store.name(),
        "proxy ready"
    );

    server.run_until(handler, shutdown_signal()).await?;

    info!("waiting for background cache writes");
    interceptor.shutdown().await;
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn CacheStore>, Box<dyn Error>> {
    let store: Arc<dyn CacheStore> = match &settings.cache.backend {
        CacheBackend::Memory { max_entries } => Arc::new(MemoryStore::new(max_entries.get())),
        CacheBackend::Disk { directory } => Arc::new(DiskStore::open(directory.clone()).await?),
    };
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal; running until killed");
        std::future::pending::<()>().await;
    }
}
