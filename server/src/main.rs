// main.rs

mod cache;
mod config;
mod error;
mod fetch;
mod jobs;
mod mbtiles;
mod providers;
mod state;
mod tile_math;
mod web;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tokio::time::Duration;

use crate::cache::{DISK_CHECK_INTERVAL, TileCache};
use crate::jobs::JobRegistry;
use crate::mbtiles::{MbtilesStore, StoreMetadata};
use crate::providers::{ChartProvider, ProviderKind, parse_header_line};
use crate::state::AppState;

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                eprintln!("Failed to install SIGTERM handler: {err}");
            }
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    state.request_shutdown();
}

async fn open_provider(
    pc: &config::ProviderConfig,
    cache_dir: &std::path::Path,
) -> ChartProvider {
    let headers: Vec<(String, String)> = pc
        .headers
        .iter()
        .filter_map(|line| {
            let parsed = parse_header_line(line);
            if parsed.is_none() {
                eprintln!(
                    "charts: ignoring malformed header {line:?} for provider {}",
                    pc.identifier
                );
            }
            parsed
        })
        .collect();

    let mut provider = ChartProvider {
        identifier: pc.identifier.clone(),
        name: pc.name.clone().unwrap_or_else(|| pc.identifier.clone()),
        kind: pc.kind,
        format: pc.format,
        min_zoom: pc.min_zoom,
        max_zoom: pc.max_zoom,
        url_template: pc.url.clone(),
        headers,
        store: None,
    };

    if provider.kind == ProviderKind::OnlineProxied {
        let path = cache_dir.join(format!("{}.mbtiles", provider.identifier));
        let meta = StoreMetadata {
            name: provider.name.clone(),
            format: provider.format.extension().to_string(),
            min_zoom: provider.min_zoom,
            max_zoom: provider.max_zoom,
        };
        match MbtilesStore::open(&path, &meta).await {
            Ok(store) => provider.store = Some(Arc::new(store)),
            Err(err) => eprintln!(
                "WARNING: cache for {} unavailable, proxying without caching: {err}",
                provider.identifier
            ),
        }
    }
    provider
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config().map_err(anyhow::Error::msg)?;
    fs::create_dir_all(&cfg.cache_dir)?;

    let client = reqwest::Client::builder()
        .user_agent("ChartTilesServer/0.1")
        .build()?;

    let mut providers = HashMap::new();
    for pc in &cfg.providers {
        let provider = open_provider(pc, &cfg.cache_dir).await;
        println!(
            "charts: provider {} ({:?}, z{}..{}{})",
            provider.identifier,
            provider.kind,
            provider.min_zoom,
            provider.max_zoom,
            if provider.caches_tiles() { ", cached" } else { "" }
        );
        providers.insert(provider.identifier.clone(), Arc::new(provider));
    }

    let state = Arc::new(AppState {
        providers,
        cache: Arc::new(TileCache::new(
            cfg.cache_dir.clone(),
            config::fetch_timeout(),
            config::min_free_disk_bytes(),
            DISK_CHECK_INTERVAL,
        )),
        jobs: JobRegistry::new(),
        client,
        seed_concurrency: config::seed_concurrency(),
    });

    let app = web::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    println!("charts: listening on {}", cfg.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // Ensure jobs are signaled even if the server exits unexpectedly.
    state.request_shutdown();

    let job_drain_timeout = Duration::from_secs(10);
    if !state.jobs.wait_all_stopped(job_drain_timeout).await {
        eprintln!(
            "Jobs did not stop within {:?}; flushing caches anyway",
            job_drain_timeout
        );
    }

    for provider in state.providers.values() {
        if let Some(store) = &provider.store {
            store.flush_and_close().await;
        }
    }
    Ok(())
}
