use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::fetch;
use crate::providers::ChartProvider;
use crate::tile_math::Tile;

/// How often (in cache writes) the free-disk probe runs.
pub const DISK_CHECK_INTERVAL: u64 = 1000;

/// Per-provider request counters. Monotonic; reset only by restart.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStatistic {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

/// Where a served tile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Remote,
    None,
}

/// The lookup-or-fetch layer: consult the provider's MBTiles cache, fall
/// back to the remote origin, write successful fetches back. Once the free
/// disk space at the cache root drops below the threshold, caching latches
/// off for the rest of the process; proxied bytes are still served.
pub struct TileCache {
    cache_dir: PathBuf,
    fetch_timeout: Duration,
    min_free_bytes: u64,
    disk_check_interval: u64,
    stats: Mutex<HashMap<String, CacheStatistic>>,
    caching_disabled: AtomicBool,
    cached_tiles: AtomicU64,
}

impl TileCache {
    pub fn new(
        cache_dir: PathBuf,
        fetch_timeout: Duration,
        min_free_bytes: u64,
        disk_check_interval: u64,
    ) -> Self {
        Self {
            cache_dir,
            fetch_timeout,
            min_free_bytes,
            disk_check_interval: disk_check_interval.max(1),
            stats: Mutex::new(HashMap::new()),
            caching_disabled: AtomicBool::new(false),
            cached_tiles: AtomicU64::new(0),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn caching_disabled(&self) -> bool {
        self.caching_disabled.load(Ordering::Relaxed)
    }

    /// Copy-out snapshot of all provider counters.
    pub fn statistics(&self) -> HashMap<String, CacheStatistic> {
        self.stats.lock().unwrap().clone()
    }

    fn bump(&self, id: &str, f: impl FnOnce(&mut CacheStatistic)) {
        let mut stats = self.stats.lock().unwrap();
        f(stats.entry(id.to_string()).or_default());
    }

    /// Serve one tile: cache first (unless `refetch`), then the remote
    /// origin, writing the fetched bytes back when caching is admitted.
    pub async fn get_tile_from_cache_or_remote(
        &self,
        client: &Client,
        provider: &ChartProvider,
        tile: Tile,
        refetch: bool,
    ) -> (Option<Vec<u8>>, FetchSource) {
        self.bump(&provider.identifier, |s| s.requests += 1);

        if !refetch && let Some(store) = &provider.store {
            match store.get_tile(tile).await {
                Ok(Some(bytes)) => {
                    self.bump(&provider.identifier, |s| s.hits += 1);
                    return (Some(bytes), FetchSource::Cache);
                }
                Ok(None) => {}
                Err(err) => {
                    eprintln!("cache: read failed for {}: {err}", provider.identifier);
                }
            }
        }

        if provider.is_online() {
            if let Some(bytes) =
                fetch::fetch_remote_tile(client, provider, tile, self.fetch_timeout).await
            {
                if provider.caches_tiles() && !self.caching_disabled() {
                    self.admit_and_write(provider, tile, &bytes).await;
                }
                self.bump(&provider.identifier, |s| s.misses += 1);
                return (Some(bytes), FetchSource::Remote);
            }
        }

        self.bump(&provider.identifier, |s| s.failures += 1);
        (None, FetchSource::None)
    }

    async fn admit_and_write(&self, provider: &ChartProvider, tile: Tile, bytes: &[u8]) {
        let n = self.cached_tiles.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.disk_check_interval == 0 {
            self.check_disk_space();
        }
        if self.caching_disabled() {
            return;
        }
        if let Some(store) = &provider.store {
            if let Err(err) = store.put_tile(tile, bytes).await {
                eprintln!(
                    "cache: write failed for {} z={} x={} y={}: {err}",
                    provider.identifier, tile.z, tile.x, tile.y
                );
            }
        }
    }

    fn check_disk_space(&self) {
        let Some(free) = free_disk_bytes(&self.cache_dir) else {
            return;
        };
        if free < self.min_free_bytes && !self.caching_disabled.swap(true, Ordering::Relaxed) {
            eprintln!(
                "cache: {} has {free} bytes free (threshold {}); tile caching disabled until restart",
                self.cache_dir.display(),
                self.min_free_bytes
            );
        }
    }
}

#[cfg(unix)]
fn free_disk_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn free_disk_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbtiles::{MbtilesStore, StoreMetadata};
    use crate::providers::{ProviderKind, TileFormat};
    use axum::Router;
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::Arc;

    async fn spawn_origin() -> std::net::SocketAddr {
        let app = Router::new().route(
            "/tiles/{z}/{x}/{y_ext}",
            get(|AxumPath((z, x, y_ext)): AxumPath<(u8, u32, String)>| async move {
                let y: u32 = y_ext.trim_end_matches(".png").parse().unwrap();
                if y == 99 {
                    Err(StatusCode::NOT_FOUND)
                } else {
                    Ok(format!("tile-{z}-{x}-{y}").into_bytes())
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn proxied_provider(
        addr: std::net::SocketAddr,
        dir: &tempfile::TempDir,
    ) -> ChartProvider {
        let meta = StoreMetadata {
            name: "osm".to_string(),
            format: "png".to_string(),
            min_zoom: 0,
            max_zoom: 12,
        };
        let store = MbtilesStore::open(dir.path().join("osm.mbtiles"), &meta)
            .await
            .unwrap();
        ChartProvider {
            identifier: "osm".to_string(),
            name: "osm".to_string(),
            kind: ProviderKind::OnlineProxied,
            format: TileFormat::Png,
            min_zoom: 0,
            max_zoom: 12,
            url_template: Some(format!("http://{addr}/tiles/{{z}}/{{x}}/{{y}}.png")),
            headers: Vec::new(),
            store: Some(Arc::new(store)),
        }
    }

    fn test_cache(dir: &tempfile::TempDir) -> TileCache {
        TileCache::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            0, // free space can never drop below zero bytes
            DISK_CHECK_INTERVAL,
        )
    }

    #[tokio::test]
    async fn miss_then_hit_with_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_origin().await;
        let provider = proxied_provider(addr, &dir).await;
        let cache = test_cache(&dir);
        let client = Client::new();
        let t = Tile { z: 3, x: 2, y: 5 };

        let (first, src) = cache
            .get_tile_from_cache_or_remote(&client, &provider, t, false)
            .await;
        assert_eq!(src, FetchSource::Remote);

        let (second, src) = cache
            .get_tile_from_cache_or_remote(&client, &provider, t, false)
            .await;
        assert_eq!(src, FetchSource::Cache);
        assert_eq!(first, second);

        let stats = cache.statistics();
        let s = stats.get("osm").unwrap();
        assert_eq!((s.requests, s.hits, s.misses, s.failures), (2, 1, 1, 0));
    }

    #[tokio::test]
    async fn refetch_bypasses_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_origin().await;
        let provider = proxied_provider(addr, &dir).await;
        let cache = test_cache(&dir);
        let client = Client::new();
        let t = Tile { z: 4, x: 1, y: 2 };

        for _ in 0..2 {
            let (bytes, src) = cache
                .get_tile_from_cache_or_remote(&client, &provider, t, true)
                .await;
            assert_eq!(src, FetchSource::Remote);
            assert_eq!(bytes.unwrap(), b"tile-4-1-2");
        }
        // The refetched tile landed in the cache for later non-refetch reads.
        let store = provider.store.as_ref().unwrap();
        assert_eq!(store.get_tile(t).await.unwrap().unwrap(), b"tile-4-1-2");
    }

    #[tokio::test]
    async fn counters_balance_across_mixed_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_origin().await;
        let provider = proxied_provider(addr, &dir).await;
        let cache = test_cache(&dir);
        let client = Client::new();

        let ok = Tile { z: 5, x: 3, y: 3 };
        let missing = Tile { z: 5, x: 3, y: 99 };

        cache
            .get_tile_from_cache_or_remote(&client, &provider, ok, false)
            .await;
        cache
            .get_tile_from_cache_or_remote(&client, &provider, ok, false)
            .await;
        let (bytes, src) = cache
            .get_tile_from_cache_or_remote(&client, &provider, missing, false)
            .await;
        assert!(bytes.is_none());
        assert_eq!(src, FetchSource::None);

        let stats = cache.statistics();
        let s = stats.get("osm").unwrap();
        assert_eq!(s.requests, s.hits + s.misses + s.failures);
        assert_eq!((s.requests, s.hits, s.misses, s.failures), (3, 1, 1, 1));
    }

    #[tokio::test]
    async fn low_disk_latches_caching_off_but_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_origin().await;
        let provider = proxied_provider(addr, &dir).await;
        // Impossible threshold and a tiny probe interval: the second write
        // trips the latch.
        let cache = TileCache::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            u64::MAX,
            2,
        );
        let client = Client::new();

        for x in 0..2 {
            cache
                .get_tile_from_cache_or_remote(
                    &client,
                    &provider,
                    Tile { z: 6, x, y: 1 },
                    false,
                )
                .await;
        }
        assert!(cache.caching_disabled());

        let store = provider.store.as_ref().unwrap();
        let cached_before = store.tile_count().await.unwrap();

        let t = Tile { z: 6, x: 9, y: 1 };
        let (bytes, src) = cache
            .get_tile_from_cache_or_remote(&client, &provider, t, false)
            .await;
        assert_eq!(src, FetchSource::Remote);
        assert_eq!(bytes.unwrap(), b"tile-6-9-1");
        assert_eq!(store.tile_count().await.unwrap(), cached_before);
    }
}
