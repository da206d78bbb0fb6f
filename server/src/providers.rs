use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mbtiles::MbtilesStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    MbtilesFile,
    TileDirectory,
    OnlineProxied,
    OnlinePassthrough,
    StyleJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    Jpg,
    Pbf,
}

impl TileFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpg => "image/jpeg",
            TileFormat::Pbf => "application/x-protobuf",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpg => "jpg",
            TileFormat::Pbf => "pbf",
        }
    }
}

/// A configured chart source. Providers backed by an on-disk cache carry an
/// open store handle; the handle is absent when the cache failed to open or
/// the kind never caches.
#[derive(Debug)]
pub struct ChartProvider {
    pub identifier: String,
    pub name: String,
    pub kind: ProviderKind,
    pub format: TileFormat,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub url_template: Option<String>,
    pub headers: Vec<(String, String)>,
    pub store: Option<Arc<MbtilesStore>>,
}

impl ChartProvider {
    /// A provider participates in caching iff it is proxied and its cache
    /// store opened.
    pub fn caches_tiles(&self) -> bool {
        self.kind == ProviderKind::OnlineProxied && self.store.is_some()
    }

    pub fn is_online(&self) -> bool {
        matches!(
            self.kind,
            ProviderKind::OnlineProxied | ProviderKind::OnlinePassthrough
        )
    }
}

/// Parse a configured `"Name: Value"` header line. Lines without a colon or
/// with an empty name are rejected.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
