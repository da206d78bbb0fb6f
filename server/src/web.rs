use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;

use crate::cache::CacheStatistic;
use crate::error::TileServerError;
use crate::jobs::{self, JobArea, JobInfo, JobOptions};
use crate::providers::{ProviderKind, TileFormat};
use crate::state::AppState;
use crate::tile_math::{MAX_ZOOM, Tile};

/// 90 days; cached chart tiles change rarely.
const TILE_CACHE_CONTROL: &str = "public, max-age=7776000";

/// Public router constructor
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chart-tiles", get(list_charts))
        .route("/chart-tiles/cache/statistics", get(get_statistics))
        .route("/chart-tiles/cache/jobs", get(list_jobs))
        .route("/chart-tiles/cache/jobs/{id}", post(control_job))
        .route("/chart-tiles/cache/{id}", post(create_job))
        .route("/chart-tiles/{id}/{z}/{x}/{y}", get(get_chart_tile))
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Provider listing entry for chart discovery by plotters.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartSummary {
    identifier: String,
    name: String,
    kind: ProviderKind,
    format: TileFormat,
    min_zoom: u8,
    max_zoom: u8,
}

async fn list_charts(State(state): State<Arc<AppState>>) -> Json<Vec<ChartSummary>> {
    let mut charts: Vec<ChartSummary> = state
        .providers
        .values()
        .map(|p| ChartSummary {
            identifier: p.identifier.clone(),
            name: p.name.clone(),
            kind: p.kind,
            format: p.format,
            min_zoom: p.min_zoom,
            max_zoom: p.max_zoom,
        })
        .collect();
    charts.sort_unstable_by(|a, b| a.identifier.cmp(&b.identifier));
    Json(charts)
}

async fn get_statistics(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, CacheStatistic>> {
    Json(state.cache.statistics())
}

fn tile_response(format: TileFormat, bytes: Vec<u8>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, format.content_type()),
            (header::CACHE_CONTROL, TILE_CACHE_CONTROL),
        ],
        bytes,
    )
}

async fn get_chart_tile(
    State(state): State<Arc<AppState>>,
    Path((id, z, x, y)): Path<(String, u8, u32, u32)>,
) -> Result<impl IntoResponse, TileServerError> {
    let provider = state
        .provider(&id)
        .ok_or(TileServerError::UnknownProvider)?;
    if z > MAX_ZOOM || x >= (1u32 << z) || y >= (1u32 << z) {
        return Err(TileServerError::TileAbsent);
    }
    let tile = Tile { z, x, y };

    if provider.is_online() {
        let (bytes, _source) = state
            .cache
            .get_tile_from_cache_or_remote(&state.client, &provider, tile, false)
            .await;
        return match bytes {
            Some(b) => Ok(tile_response(provider.format, b)),
            None => Err(TileServerError::RemoteFetchFailure),
        };
    }

    // Locally backed provider: the store is the only source.
    if let Some(store) = &provider.store {
        return match store.get_tile(tile).await? {
            Some(b) => Ok(tile_response(provider.format, b)),
            None => Err(TileServerError::TileAbsent),
        };
    }
    Err(TileServerError::TileAbsent)
}

/// Body of `POST /chart-tiles/cache/{id}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRequest {
    feature: Option<geojson::Feature>,
    bbox: Option<[f64; 4]>,
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
    action: String,
    #[serde(default)]
    options: JobOptions,
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CacheRequest>,
) -> Result<Json<JobInfo>, TileServerError> {
    let provider = state
        .provider(&id)
        .ok_or(TileServerError::UnknownProvider)?;
    if !provider.caches_tiles() {
        return Err(TileServerError::InvalidParameters(format!(
            "provider {id} does not cache tiles"
        )));
    }
    if !matches!(req.action.as_str(), "seed" | "delete") {
        return Err(TileServerError::InvalidParameters(format!(
            "unrecognized action {:?}",
            req.action
        )));
    }
    let Some(max_zoom) = req.max_zoom else {
        return Err(TileServerError::InvalidParameters(
            "missing maxZoom".to_string(),
        ));
    };
    let min_zoom = req.min_zoom.unwrap_or(1);
    if min_zoom < 1 || max_zoom > MAX_ZOOM || min_zoom > max_zoom {
        return Err(TileServerError::InvalidParameters(format!(
            "zoom range {min_zoom}..{max_zoom} must lie within [1, {MAX_ZOOM}]"
        )));
    }

    let area = match (req.feature, req.bbox) {
        (Some(feature), _) => JobArea::Feature(Box::new(feature)),
        (None, Some(bbox)) => JobArea::Bbox(bbox),
        (None, None) => {
            return Err(TileServerError::InvalidArea(
                "request carries neither a feature nor a bbox".to_string(),
            ));
        }
    };

    let job = state
        .jobs
        .create(provider, req.options, min_zoom, max_zoom, area)?;
    println!(
        "jobs: created job {} for provider {id} ({} tiles estimated)",
        job.id,
        job.info().total_tiles
    );
    Ok(Json(job.info()))
}

/// Body of `POST /chart-tiles/cache/jobs/{id}`.
#[derive(Deserialize)]
struct JobCommand {
    action: String,
}

async fn control_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(cmd): Json<JobCommand>,
) -> Result<Json<JobInfo>, TileServerError> {
    let job = state
        .jobs
        .by_id(id)
        .ok_or(TileServerError::UnknownJobAction)?;
    match cmd.action.as_str() {
        "start" => {
            tokio::spawn(jobs::run_seed(
                Arc::clone(&job),
                Arc::clone(&state.cache),
                state.client.clone(),
                state.seed_concurrency,
            ));
        }
        "delete" => {
            tokio::spawn(jobs::run_delete(Arc::clone(&job)));
        }
        "stop" => job.request_cancel(),
        "remove" => state.jobs.remove(id)?,
        _ => return Err(TileServerError::UnknownJobAction),
    }
    Ok(Json(job.info()))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobInfo>> {
    Json(state.jobs.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DISK_CHECK_INTERVAL, TileCache};
    use crate::jobs::JobRegistry;
    use crate::mbtiles::{MbtilesStore, StoreMetadata};
    use crate::providers::ChartProvider;
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn spawn_origin() -> std::net::SocketAddr {
        let app = Router::new().route(
            "/tiles/{z}/{x}/{y_ext}",
            get(|AxumPath((z, x, y_ext)): AxumPath<(u8, u32, String)>| async move {
                let y: u32 = y_ext.trim_end_matches(".png").parse().unwrap();
                if y == 99 {
                    Err(StatusCode::NOT_FOUND)
                } else {
                    // 32 bytes, starts with the PNG magic.
                    let mut bytes = vec![0x89, b'P', b'N', b'G'];
                    bytes.extend(format!("{z:09}-{x:09}-{y:08}").into_bytes());
                    Ok(bytes)
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

    async fn spawn_server(dir: &tempfile::TempDir) -> std::net::SocketAddr {
        let origin = spawn_origin().await;
        let meta = StoreMetadata {
            name: "osm".to_string(),
            format: "png".to_string(),
            min_zoom: 0,
            max_zoom: 16,
        };
        let store = MbtilesStore::open(dir.path().join("osm.mbtiles"), &meta)
            .await
            .unwrap();
        let provider = Arc::new(ChartProvider {
            identifier: "osm".to_string(),
            name: "osm".to_string(),
            kind: ProviderKind::OnlineProxied,
            format: TileFormat::Png,
            min_zoom: 0,
            max_zoom: 16,
            url_template: Some(format!("http://{origin}/tiles/{{z}}/{{x}}/{{y}}.png")),
            headers: Vec::new(),
            store: Some(Arc::new(store)),
        });

        let mut providers = HashMap::new();
        providers.insert(provider.identifier.clone(), provider);
        let state = Arc::new(AppState {
            providers,
            cache: Arc::new(TileCache::new(
                dir.path().to_path_buf(),
                Duration::from_secs(5),
                0,
                DISK_CHECK_INTERVAL,
            )),
            jobs: JobRegistry::new(),
            client: reqwest::Client::new(),
            seed_concurrency: 8,
        });

        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn proxied_tile_is_served_then_cached_with_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(&dir).await;
        let http = reqwest::Client::new();
        let url = format!("http://{addr}/chart-tiles/osm/3/2/5");

        let first = http.get(&url).send().await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(
            first.headers().get("content-type").unwrap(),
            "image/png"
        );
        assert_eq!(
            first.headers().get("cache-control").unwrap(),
            "public, max-age=7776000"
        );
        let first_bytes = first.bytes().await.unwrap();
        assert_eq!(first_bytes.len(), 32);

        let second_bytes = http.get(&url).send().await.unwrap().bytes().await.unwrap();
        assert_eq!(first_bytes, second_bytes);

        let stats: Value = http
            .get(format!("http://{addr}/chart-tiles/cache/statistics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["osm"]["requests"], 2);
        assert_eq!(stats["osm"]["hits"], 1);
        assert_eq!(stats["osm"]["misses"], 1);
        assert_eq!(stats["osm"]["failures"], 0);
    }

    #[tokio::test]
    async fn unknown_provider_and_remote_failures_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(&dir).await;
        let http = reqwest::Client::new();

        let resp = http
            .get(format!("http://{addr}/chart-tiles/nope/3/2/5"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        // Origin 404s y=99: the proxy surfaces a bad gateway.
        let resp = http
            .get(format!("http://{addr}/chart-tiles/osm/8/1/99"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);

        // Out-of-range tile address.
        let resp = http
            .get(format!("http://{addr}/chart-tiles/osm/1/5/0"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn job_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(&dir).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(format!("http://{addr}/chart-tiles/cache/osm"))
            .json(&json!({
                "bbox": [0.0, 0.0, 15.0, 15.0],
                "minZoom": 2,
                "maxZoom": 4,
                "action": "seed",
                "options": { "refetch": false, "mbtiles": false, "vacuum": false }
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_u64().unwrap();
        assert_eq!(created["state"], "stopped");
        assert_eq!(created["status"], "Idle");
        let total = created["totalTiles"].as_u64().unwrap();
        assert!(total > 0);

        let started = http
            .post(format!("http://{addr}/chart-tiles/cache/jobs/{id}"))
            .json(&json!({ "action": "start" }))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), 200);

        // Poll the snapshot list until the seed completes.
        let mut last: Value = Value::Null;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let jobs: Value = http
                .get(format!("http://{addr}/chart-tiles/cache/jobs"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            last = jobs[0].clone();
            if last["state"] == "stopped" && last["status"] == "Completed" {
                break;
            }
        }
        assert_eq!(last["state"], "stopped");
        assert_eq!(last["status"], "Completed");
        assert_eq!(last["downloadedTiles"].as_u64().unwrap(), total);
        assert_eq!(last["progress"].as_f64().unwrap(), 1.0);

        let removed = http
            .post(format!("http://{addr}/chart-tiles/cache/jobs/{id}"))
            .json(&json!({ "action": "remove" }))
            .send()
            .await
            .unwrap();
        assert_eq!(removed.status(), 200);
        let jobs: Value = http
            .get(format!("http://{addr}/chart-tiles/cache/jobs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_job_requests_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(&dir).await;
        let http = reqwest::Client::new();
        let cache_url = format!("http://{addr}/chart-tiles/cache/osm");

        // Missing maxZoom.
        let resp = http
            .post(&cache_url)
            .json(&json!({ "bbox": [0.0, 0.0, 1.0, 1.0], "action": "seed" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Zoom outside [1, 24].
        let resp = http
            .post(&cache_url)
            .json(&json!({
                "bbox": [0.0, 0.0, 1.0, 1.0],
                "maxZoom": 25,
                "action": "seed"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Unrecognized action.
        let resp = http
            .post(&cache_url)
            .json(&json!({
                "bbox": [0.0, 0.0, 1.0, 1.0],
                "maxZoom": 3,
                "action": "shred"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // No area at all.
        let resp = http
            .post(&cache_url)
            .json(&json!({ "maxZoom": 3, "action": "seed" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Unknown job id / unknown control action.
        let resp = http
            .post(format!("http://{addr}/chart-tiles/cache/jobs/999"))
            .json(&json!({ "action": "start" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn chart_listing_names_configured_providers() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(&dir).await;
        let charts: Value = reqwest::Client::new()
            .get(format!("http://{addr}/chart-tiles"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(charts[0]["identifier"], "osm");
        assert_eq!(charts[0]["kind"], "online-proxied");
        assert_eq!(charts[0]["format"], "png");
    }
}
