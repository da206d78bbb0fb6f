use std::time::Duration;

use reqwest::Client;

use crate::providers::ChartProvider;
use crate::tile_math::{Tile, flip_y};

/// Fill a provider URL template for one tile. Supported placeholders:
/// `{z}`, `{z-2}`, `{x}`, `{y}` and `{-y}` (TMS row).
pub fn substitute_template(template: &str, t: Tile) -> String {
    template
        .replace("{z}", &t.z.to_string())
        .replace("{z-2}", &t.z.saturating_sub(2).to_string())
        .replace("{x}", &t.x.to_string())
        .replace("{y}", &t.y.to_string())
        .replace("{-y}", &flip_y(t.y, t.z).to_string())
}

/// GET one tile from the provider's remote origin. Any non-2xx status,
/// timeout, connection error or empty body comes back as `None`; the caller
/// decides whether that is a 502 or a counted failure.
pub async fn fetch_remote_tile(
    client: &Client,
    provider: &ChartProvider,
    t: Tile,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let template = provider.url_template.as_deref()?;
    let url = substitute_template(template, t);

    let mut req = client.get(&url).timeout(timeout);
    for (name, value) in &provider.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderKind, TileFormat};
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;

    #[test]
    fn template_substitution_covers_all_placeholders() {
        let t = Tile { z: 7, x: 10, y: 20 };
        assert_eq!(
            substitute_template("https://o.example/{z}/{x}/{y}.png", t),
            "https://o.example/7/10/20.png"
        );
        assert_eq!(substitute_template("{z-2}/{x}", t), "5/10");
        // TMS flip: 2^7 - 1 - 20 = 107
        assert_eq!(substitute_template("{z}/{x}/{-y}", t), "7/10/107");
    }

    #[test]
    fn template_z_minus_two_saturates_at_zero() {
        let t = Tile { z: 1, x: 0, y: 0 };
        assert_eq!(substitute_template("{z-2}", t), "0");
    }

    fn origin_provider(addr: std::net::SocketAddr) -> ChartProvider {
        ChartProvider {
            identifier: "origin".to_string(),
            name: "origin".to_string(),
            kind: ProviderKind::OnlineProxied,
            format: TileFormat::Png,
            min_zoom: 0,
            max_zoom: 12,
            url_template: Some(format!("http://{addr}/tiles/{{z}}/{{x}}/{{y}}.png")),
            headers: vec![("X-Test".to_string(), "1".to_string())],
            store: None,
        }
    }

    async fn spawn_origin() -> std::net::SocketAddr {
        let app = Router::new()
            .route(
                "/tiles/{z}/{x}/{y_ext}",
                get(|Path((z, x, y_ext)): Path<(u8, u32, String)>| async move {
                    let y: u32 = y_ext.trim_end_matches(".png").parse().unwrap();
                    match (z, x, y) {
                        (3, 2, 5) => Ok(vec![0x89u8, b'P', b'N', b'G']),
                        (3, 0, 0) => Ok(Vec::new()), // present but empty
                        _ => Err(StatusCode::NOT_FOUND),
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

    #[tokio::test]
    async fn fetch_maps_status_and_body_to_option() {
        let addr = spawn_origin().await;
        let provider = origin_provider(addr);
        let client = Client::new();
        let timeout = Duration::from_secs(5);

        let hit = fetch_remote_tile(&client, &provider, Tile { z: 3, x: 2, y: 5 }, timeout).await;
        assert_eq!(hit.unwrap(), vec![0x89u8, b'P', b'N', b'G']);

        let missing =
            fetch_remote_tile(&client, &provider, Tile { z: 3, x: 1, y: 1 }, timeout).await;
        assert!(missing.is_none());

        let empty =
            fetch_remote_tile(&client, &provider, Tile { z: 3, x: 0, y: 0 }, timeout).await;
        assert!(empty.is_none());
    }
}
