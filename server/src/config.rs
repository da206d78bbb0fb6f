use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::DEFAULT_SEED_CONCURRENCY;
use crate::providers::{ProviderKind, TileFormat};

const DEFAULT_CONFIG_PATH: &str = "charts.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Root directory for per-provider MBTiles caches and exports.
    pub cache_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ProviderKind,
    #[serde(default = "default_format")]
    pub format: TileFormat,
    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    /// Remote URL template with {z}/{z-2}/{x}/{y}/{-y} placeholders.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra headers sent upstream, one "Name: Value" string each.
    #[serde(default)]
    pub headers: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_format() -> TileFormat {
    TileFormat::Png
}

fn default_min_zoom() -> u8 {
    1
}

fn default_max_zoom() -> u8 {
    18
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CT_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

pub fn load_config() -> Result<ChartConfig, String> {
    let path = config_path();
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read chart config {path:?}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid chart config JSON: {e}"))
}

fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Worker pool size for seed jobs.
pub fn seed_concurrency() -> usize {
    env_usize("CT_SEED_CONCURRENCY", DEFAULT_SEED_CONCURRENCY, 1, 256)
}

/// Per-request timeout for remote tile fetches.
pub fn fetch_timeout() -> Duration {
    Duration::from_millis(env_u64("CT_FETCH_TIMEOUT_MS", 5_000, 500, 60_000))
}

/// Free-space floor below which tile caching latches off.
pub fn min_free_disk_bytes() -> u64 {
    env_u64(
        "CT_MIN_FREE_DISK_BYTES",
        1024 * 1024 * 1024,
        64 * 1024 * 1024,
        1 << 50,
    )
}
