use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use geo::{Polygon, Rect, coord};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::cache::{FetchSource, TileCache};
use crate::error::TileServerError;
use crate::mbtiles::{MbtilesStore, StoreError, StoreMetadata};
use crate::providers::ChartProvider;
use crate::tile_math::{self, Bbox, TileSeqFactory};

/// Worker pool size for seed jobs unless overridden.
pub const DEFAULT_SEED_CONCURRENCY: usize = 32;

const DELETE_CHUNK_SIZE: usize = 1000;
const DISK_RECHECK_INTERVAL: u64 = 1000;

/// Below this estimate the tile total is refined by real enumeration,
/// bounded by the cap. Small regions get an accurate progress bar.
const REFINE_THRESHOLD: u64 = 10_000;
const REFINE_CAP: usize = 11_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Seed,
    Delete,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    /// Fetch every tile from the origin even when already cached.
    pub refetch: bool,
    /// Export the seeded region to a standalone MBTiles file on completion.
    pub mbtiles: bool,
    /// Run VACUUM after a delete.
    pub vacuum: bool,
}

/// The region a job operates on.
pub enum JobArea {
    Feature(Box<geojson::Feature>),
    Bbox(Bbox),
}

/// Immutable snapshot of a job, as served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: u64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub status: String,
    pub provider: String,
    pub area_description: String,
    pub total_tiles: u64,
    pub downloaded_tiles: u64,
    pub cached_tiles: u64,
    pub failed_tiles: u64,
    pub deleted_tiles: u64,
    /// May step backwards briefly when the tile-count estimate is revised
    /// upward mid-run.
    pub progress: f64,
}

/// A long-running seed or delete unit of work. Counters are atomics so the
/// worker pool can update them without locking; snapshots may observe
/// partial progress.
pub struct CacheJob {
    pub id: u64,
    pub provider: Arc<ChartProvider>,
    pub options: JobOptions,
    pub min_zoom: u8,
    pub max_zoom: u8,
    area_description: String,
    region_slug: String,
    polygons: Arc<Vec<Polygon<f64>>>,
    factory: TileSeqFactory,
    job_type: Mutex<JobType>,
    state: Mutex<JobState>,
    status: Mutex<String>,
    cancel: AtomicBool,
    total_tiles: AtomicU64,
    downloaded_tiles: AtomicU64,
    cached_tiles: AtomicU64,
    failed_tiles: AtomicU64,
    deleted_tiles: AtomicU64,
}

impl std::fmt::Debug for CacheJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheJob")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("options", &self.options)
            .field("min_zoom", &self.min_zoom)
            .field("max_zoom", &self.max_zoom)
            .field("area_description", &self.area_description)
            .field("region_slug", &self.region_slug)
            .field("polygons", &self.polygons)
            .field("job_type", &self.job_type)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("cancel", &self.cancel)
            .field("total_tiles", &self.total_tiles)
            .field("downloaded_tiles", &self.downloaded_tiles)
            .field("cached_tiles", &self.cached_tiles)
            .field("failed_tiles", &self.failed_tiles)
            .field("deleted_tiles", &self.deleted_tiles)
            .finish()
    }
}

impl CacheJob {
    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Cooperative: workers exit before their next pull; in-flight fetches
    /// and writes complete and still count.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_string();
    }

    /// Flip to running, or report that the job already runs.
    fn begin(&self, ty: JobType) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == JobState::Running {
            return false;
        }
        *state = JobState::Running;
        drop(state);
        *self.job_type.lock().unwrap() = ty;
        self.cancel.store(false, Ordering::Relaxed);
        true
    }

    fn processed(&self) -> u64 {
        self.downloaded_tiles.load(Ordering::Relaxed)
            + self.cached_tiles.load(Ordering::Relaxed)
            + self.failed_tiles.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> JobInfo {
        let job_type = *self.job_type.lock().unwrap();
        let total = self.total_tiles.load(Ordering::Relaxed);
        let done = match job_type {
            JobType::Delete => self.deleted_tiles.load(Ordering::Relaxed),
            _ => self.processed(),
        };
        let progress = if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64).min(1.0)
        };
        JobInfo {
            id: self.id,
            job_type,
            state: self.state(),
            status: self.status.lock().unwrap().clone(),
            provider: self.provider.identifier.clone(),
            area_description: self.area_description.clone(),
            total_tiles: total,
            downloaded_tiles: self.downloaded_tiles.load(Ordering::Relaxed),
            cached_tiles: self.cached_tiles.load(Ordering::Relaxed),
            failed_tiles: self.failed_tiles.load(Ordering::Relaxed),
            deleted_tiles: self.deleted_tiles.load(Ordering::Relaxed),
            progress,
        }
    }
}

/// Drive a seed job to completion: N workers share one lazy tile iterator
/// and push every tile through the cache.
pub async fn run_seed(
    job: Arc<CacheJob>,
    cache: Arc<TileCache>,
    client: Client,
    concurrency: usize,
) {
    if !job.begin(JobType::Seed) {
        return;
    }
    job.set_status("Seeding");
    job.downloaded_tiles.store(0, Ordering::Relaxed);
    job.cached_tiles.store(0, Ordering::Relaxed);
    job.failed_tiles.store(0, Ordering::Relaxed);

    let pulled = AtomicU64::new(0);
    {
        let job = &job;
        let cache = &cache;
        let client = &client;
        let pulled = &pulled;
        stream::iter((job.factory)())
            .take_while(|_| futures::future::ready(!job.cancel_requested()))
            .for_each_concurrent(concurrency.max(1), |tile| async move {
                let (_bytes, source) = cache
                    .get_tile_from_cache_or_remote(client, &job.provider, tile, job.options.refetch)
                    .await;
                match source {
                    FetchSource::Cache => job.cached_tiles.fetch_add(1, Ordering::Relaxed),
                    FetchSource::Remote => job.downloaded_tiles.fetch_add(1, Ordering::Relaxed),
                    FetchSource::None => job.failed_tiles.fetch_add(1, Ordering::Relaxed),
                };
                // The estimate was low; raise the total so progress stays sane.
                job.total_tiles.fetch_max(job.processed(), Ordering::Relaxed);

                let n = pulled.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DISK_RECHECK_INTERVAL == 0 && cache.caching_disabled() {
                    eprintln!("seed: disk space low, cancelling job {}", job.id);
                    job.request_cancel();
                }
            })
            .await;
    }

    if job.options.mbtiles && !job.cancel_requested() {
        if let Err(err) = export_region(&job, cache.cache_dir()).await {
            eprintln!("seed: MBTiles export failed for job {}: {err}", job.id);
        }
    }

    if !job.cancel_requested() {
        job.set_status("Completed");
    }
    job.set_state(JobState::Stopped);
}

/// Copy every cached tile of the job's region into a standalone MBTiles
/// file under `<cache_dir>/mbtiles/`.
async fn export_region(job: &CacheJob, cache_dir: &Path) -> Result<(), TileServerError> {
    let Some(store) = &job.provider.store else {
        return Ok(());
    };
    job.set_status("Creating MBTiles");

    let path = cache_dir.join("mbtiles").join(format!(
        "{}_{}.mbtiles",
        job.region_slug, job.provider.identifier
    ));
    let meta = StoreMetadata {
        name: job.provider.name.clone(),
        format: job.provider.format.extension().to_string(),
        min_zoom: job.min_zoom,
        max_zoom: job.max_zoom,
    };
    let export = MbtilesStore::open(&path, &meta).await?;

    for tile in (job.factory)() {
        if job.cancel_requested() {
            break;
        }
        match store.get_tile(tile).await {
            Ok(Some(bytes)) => {
                if let Err(err) = export.put_tile(tile, &bytes).await {
                    eprintln!("seed: export write failed for job {}: {err}", job.id);
                }
            }
            Ok(None) => {}
            Err(err) => eprintln!("seed: export read failed for job {}: {err}", job.id),
        }
    }

    export.flush_and_close().await;
    println!("seed: wrote MBTiles export {}", path.display());
    Ok(())
}

/// Drive a delete job: remove the region's cached tiles, purge orphaned
/// blobs, optionally vacuum.
pub async fn run_delete(job: Arc<CacheJob>) {
    let Some(store) = job.provider.store.clone() else {
        eprintln!(
            "delete: provider {} has no cache store",
            job.provider.identifier
        );
        return;
    };
    if !job.begin(JobType::Delete) {
        return;
    }
    job.deleted_tiles.store(0, Ordering::Relaxed);

    match delete_region(&job, &store).await {
        Ok(()) => {
            if !job.cancel_requested() {
                job.set_status("Completed");
            }
        }
        Err(err) => eprintln!("delete: job {} failed: {err}", job.id),
    }
    job.set_state(JobState::Stopped);
}

async fn delete_region(job: &CacheJob, store: &MbtilesStore) -> Result<(), StoreError> {
    job.set_status("Deleting tiles");
    let tiles = store
        .tiles_in_polygon(&job.polygons, job.min_zoom, job.max_zoom)
        .await?;
    job.total_tiles
        .store(tiles.len() as u64, Ordering::Relaxed);

    store
        .delete_tiles_in_chunks(
            tiles.into_iter().take_while(|_| !job.cancel_requested()),
            DELETE_CHUNK_SIZE,
            |total| job.deleted_tiles.store(total, Ordering::Relaxed),
        )
        .await?;
    if job.cancel_requested() {
        return Ok(());
    }

    job.set_status("Purging orphaned images");
    store
        .purge_orphan_images(DELETE_CHUNK_SIZE, |_, _| {})
        .await?;

    if job.options.vacuum && !job.cancel_requested() {
        job.set_status("Vacuuming MBTiles database");
        store.vacuum().await?;
    }
    Ok(())
}

/// Process-wide job table. Ids are monotonic from 1 and never reused; jobs
/// stay listed across start/stop transitions until removed.
pub struct JobRegistry {
    jobs: Mutex<HashMap<u64, Arc<CacheJob>>>,
    next_id: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn create(
        &self,
        provider: Arc<ChartProvider>,
        options: JobOptions,
        min_zoom: u8,
        max_zoom: u8,
        area: JobArea,
    ) -> Result<Arc<CacheJob>, TileServerError> {
        let (polygons, area_description, factory, estimate) = match area {
            JobArea::Bbox(bbox) => {
                let polygons: Vec<Polygon<f64>> = tile_math::split_bbox(bbox)
                    .into_iter()
                    .map(|[min_lon, min_lat, max_lon, max_lat]| {
                        Rect::new(
                            coord! { x: min_lon, y: min_lat },
                            coord! { x: max_lon, y: max_lat },
                        )
                        .to_polygon()
                    })
                    .collect();
                let desc = format!(
                    "bbox [{:.3}, {:.3}, {:.3}, {:.3}]",
                    bbox[0], bbox[1], bbox[2], bbox[3]
                );
                let factory: TileSeqFactory =
                    Arc::new(move || tile_math::bbox_tiles(bbox, min_zoom, max_zoom));
                let estimate = tile_math::bbox_range_count(bbox, min_zoom, max_zoom);
                (polygons, desc, factory, estimate)
            }
            JobArea::Feature(feature) => {
                let polygons = tile_math::polygons_from_feature(&feature);
                if polygons.is_empty() {
                    return Err(TileServerError::InvalidArea(
                        "feature has no polygon geometry".to_string(),
                    ));
                }
                let desc = feature
                    .properties
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("polygon")
                    .to_string();
                let factory_polys = polygons.clone();
                let factory: TileSeqFactory = Arc::new(move || {
                    tile_math::polygon_tiles(factory_polys.clone(), min_zoom, max_zoom)
                });
                let estimate = tile_math::estimate_polygon_range(&polygons, min_zoom, max_zoom);
                (polygons, desc, factory, estimate)
            }
        };

        let mut total = estimate;
        if total < REFINE_THRESHOLD {
            total = (factory)().take(REFINE_CAP).count() as u64;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job = Arc::new(CacheJob {
            id,
            provider,
            options,
            min_zoom,
            max_zoom,
            region_slug: slugify(&area_description),
            area_description,
            polygons: Arc::new(polygons),
            factory,
            job_type: Mutex::new(JobType::None),
            state: Mutex::new(JobState::Stopped),
            status: Mutex::new("Idle".to_string()),
            cancel: AtomicBool::new(false),
            total_tiles: AtomicU64::new(total),
            downloaded_tiles: AtomicU64::new(0),
            cached_tiles: AtomicU64::new(0),
            failed_tiles: AtomicU64::new(0),
            deleted_tiles: AtomicU64::new(0),
        });
        self.jobs.lock().unwrap().insert(id, Arc::clone(&job));
        Ok(job)
    }

    pub fn by_id(&self, id: u64) -> Option<Arc<CacheJob>> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    /// Snapshot of every job, oldest first.
    pub fn list(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|j| j.info())
            .collect();
        infos.sort_unstable_by_key(|i| i.id);
        infos
    }

    /// Remove a stopped job. Running jobs must be cancelled first.
    pub fn remove(&self, id: u64) -> Result<(), TileServerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get(&id) else {
            return Err(TileServerError::UnknownJobAction);
        };
        if job.state() == JobState::Running {
            return Err(TileServerError::JobBusy);
        }
        jobs.remove(&id);
        Ok(())
    }

    pub fn cancel_all(&self) {
        for job in self.jobs.lock().unwrap().values() {
            job.request_cancel();
        }
    }

    /// Poll until every job is stopped or the timeout passes; used during
    /// shutdown so stores can be flushed safely.
    pub async fn wait_all_stopped(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all_stopped = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .all(|j| j.state() == JobState::Stopped);
            if all_stopped {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    slug.trim_matches('_').chars().take(48).collect()
}
