use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::TileCache;
use crate::jobs::JobRegistry;
use crate::providers::ChartProvider;

pub struct AppState {
    /// Configured chart providers keyed by identifier.
    pub providers: HashMap<String, Arc<ChartProvider>>,

    /// Lookup-or-fetch layer shared by request handlers and jobs.
    pub cache: Arc<TileCache>,

    /// Seed/delete jobs, process-wide.
    pub jobs: JobRegistry,

    /// Shared HTTP client for remote tile origins.
    pub client: reqwest::Client,

    /// Worker pool size for seed jobs.
    pub seed_concurrency: usize,
}

impl AppState {
    pub fn provider(&self, id: &str) -> Option<Arc<ChartProvider>> {
        self.providers.get(id).cloned()
    }

    /// Ask every running job to wind down.
    pub fn request_shutdown(&self) {
        self.jobs.cancel_all();
    }
}
