use std::f64::consts::PI;
use std::sync::Arc;

use geo::{BoundingRect, Contains, Coord, Intersects, LineString, Point, Polygon, Rect, coord};

/// Highest zoom level the server will enumerate or serve.
pub const MAX_ZOOM: u8 = 24;

/// Sampling grid resolution for the polygon tile-count estimator.
const SAMPLE_GRID: usize = 64;

/// A Web-Mercator XYZ tile address (y = 0 at the top).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// A finite, lazy, single-use tile sequence.
pub type BoxTileIter = Box<dyn Iterator<Item = Tile> + Send>;

/// Factory producing a fresh tile sequence on every call. Jobs invoke it once
/// per pass; the returned iterator is never restarted.
pub type TileSeqFactory = Arc<dyn Fn() -> BoxTileIter + Send + Sync>;

/// `[min_lon, min_lat, max_lon, max_lat]` in degrees. `min_lon > max_lon`
/// means the box crosses the antimeridian.
pub type Bbox = [f64; 4];

/// XYZ ↔ TMS row conversion.
pub fn flip_y(y: u32, z: u8) -> u32 {
    (1u32 << z) - 1 - y
}

/// Convert lon/lat (deg) to XYZ tile indices at zoom `z`. Latitudes beyond
/// the Mercator limit clamp to the edge rows.
pub fn lonlat_to_tile(lon: f64, lat: f64, z: u8) -> (u32, u32) {
    let lat_rad = lat.to_radians();
    let n = 2f64.powi(z as i32);

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - ((lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI)) / 2.0 * n).floor();

    let max_idx = n - 1.0;
    (x.clamp(0.0, max_idx) as u32, y.clamp(0.0, max_idx) as u32)
}

/// Bounding box of a tile as `[min_lon, min_lat, max_lon, max_lat]`.
pub fn tile_to_bbox(t: Tile) -> Bbox {
    let n = 2f64.powi(t.z as i32);
    let min_lon = t.x as f64 / n * 360.0 - 180.0;
    let max_lon = (t.x as f64 + 1.0) / n * 360.0 - 180.0;
    let min_lat = (PI * (1.0 - 2.0 * (t.y as f64 + 1.0) / n)).sinh().atan().to_degrees();
    let max_lat = (PI * (1.0 - 2.0 * t.y as f64 / n)).sinh().atan().to_degrees();
    [min_lon, min_lat, max_lon, max_lat]
}

fn tile_polygon(t: Tile) -> Polygon<f64> {
    let [min_lon, min_lat, max_lon, max_lat] = tile_to_bbox(t);
    Rect::new(
        coord! { x: min_lon, y: min_lat },
        coord! { x: max_lon, y: max_lat },
    )
    .to_polygon()
}

/// Wrap an out-of-range longitude back into [-180, 180]. Values already in
/// range (including the ±180 edges) pass through untouched.
pub fn normalize_lon(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Split a bbox that crosses the antimeridian into two ordinary boxes.
pub fn split_bbox(bbox: Bbox) -> Vec<Bbox> {
    let [min_lon, min_lat, max_lon, max_lat] = bbox;
    let (min_lon, max_lon) = (normalize_lon(min_lon), normalize_lon(max_lon));
    if min_lon > max_lon {
        vec![
            [min_lon, min_lat, 180.0, max_lat],
            [-180.0, min_lat, max_lon, max_lat],
        ]
    } else {
        vec![[min_lon, min_lat, max_lon, max_lat]]
    }
}

/// Inclusive tile index ranges covering a non-crossing bbox at zoom `z`.
fn tile_range(bbox: Bbox, z: u8) -> (u32, u32, u32, u32) {
    let [min_lon, min_lat, max_lon, max_lat] = bbox;
    let (x0, y0) = lonlat_to_tile(min_lon, max_lat, z);
    let (x1, y1) = lonlat_to_tile(max_lon, min_lat, z);
    (x0.min(x1), x0.max(x1), y0.min(y1), y0.max(y1))
}

/// Lazily enumerate every tile a bbox touches over a zoom range. Boxes that
/// cross the antimeridian are split and enumerated per hemisphere.
pub fn bbox_tiles(bbox: Bbox, min_zoom: u8, max_zoom: u8) -> BoxTileIter {
    Box::new(split_bbox(bbox).into_iter().flat_map(move |b| {
        (min_zoom..=max_zoom).flat_map(move |z| {
            let (x0, x1, y0, y1) = tile_range(b, z);
            (x0..=x1).flat_map(move |x| (y0..=y1).map(move |y| Tile { z, x, y }))
        })
    }))
}

/// Exact tile count for a bbox at one zoom.
pub fn bbox_tile_count(bbox: Bbox, z: u8) -> u64 {
    split_bbox(bbox)
        .into_iter()
        .map(|b| {
            let (x0, x1, y0, y1) = tile_range(b, z);
            (x1 - x0 + 1) as u64 * (y1 - y0 + 1) as u64
        })
        .sum()
}

/// Exact tile count for a bbox over a zoom range.
pub fn bbox_range_count(bbox: Bbox, min_zoom: u8, max_zoom: u8) -> u64 {
    (min_zoom..=max_zoom).map(|z| bbox_tile_count(bbox, z)).sum()
}

fn normalize_polygon(poly: &Polygon<f64>) -> Polygon<f64> {
    use geo::MapCoords;
    poly.map_coords(|c| Coord { x: normalize_lon(c.x), y: c.y })
}

fn crosses_antimeridian(ring: &LineString<f64>) -> bool {
    ring.lines().any(|l| (l.end.x - l.start.x).abs() > 180.0)
}

/// Cut a polygon along the ±180° meridian. The exterior ring is unwrapped
/// into a continuous longitude window, clipped against the meridian, and the
/// far part is shifted back into [-180, 180]. Interior rings are not carried
/// across a cut. Polygons that do not cross come back whole (normalized).
pub fn split_polygon_at_antimeridian(poly: &Polygon<f64>) -> Vec<Polygon<f64>> {
    let poly = normalize_polygon(poly);
    if !crosses_antimeridian(poly.exterior()) {
        return vec![poly];
    }

    // Unwrap: undo each >180° jump so the ring becomes continuous.
    let mut ring: Vec<Coord<f64>> = Vec::with_capacity(poly.exterior().0.len());
    let mut offset = 0.0;
    let mut prev_x: Option<f64> = None;
    for c in poly.exterior().coords() {
        if let Some(px) = prev_x {
            let dx = c.x - px;
            if dx > 180.0 {
                offset -= 360.0;
            } else if dx < -180.0 {
                offset += 360.0;
            }
        }
        prev_x = Some(c.x);
        ring.push(Coord { x: c.x + offset, y: c.y });
    }
    // Drop the closing duplicate; clip_ring treats the slice as cyclic.
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }

    let max_x = ring.iter().fold(f64::MIN, |m, c| m.max(c.x));
    let mut halves = Vec::with_capacity(2);
    if max_x > 180.0 {
        halves.push(clip_ring(&ring, 180.0, true));
        halves.push(shift_ring(clip_ring(&ring, 180.0, false), -360.0));
    } else {
        halves.push(clip_ring(&ring, -180.0, false));
        halves.push(shift_ring(clip_ring(&ring, -180.0, true), 360.0));
    }

    halves
        .into_iter()
        .filter(|r| r.len() >= 3)
        .map(|r| Polygon::new(LineString::from(r), vec![]))
        .collect()
}

/// Sutherland–Hodgman clip of a cyclic ring against the vertical line
/// `x = bound`, keeping the side selected by `keep_below`.
fn clip_ring(ring: &[Coord<f64>], bound: f64, keep_below: bool) -> Vec<Coord<f64>> {
    let inside = |c: &Coord<f64>| if keep_below { c.x <= bound } else { c.x >= bound };
    let mut out = Vec::with_capacity(ring.len() + 2);
    for i in 0..ring.len() {
        let cur = ring[i];
        let next = ring[(i + 1) % ring.len()];
        if inside(&cur) {
            out.push(cur);
        }
        if inside(&cur) != inside(&next) {
            let t = (bound - cur.x) / (next.x - cur.x);
            out.push(Coord {
                x: bound,
                y: cur.y + t * (next.y - cur.y),
            });
        }
    }
    out
}

fn shift_ring(ring: Vec<Coord<f64>>, dx: f64) -> Vec<Coord<f64>> {
    ring.into_iter().map(|c| Coord { x: c.x + dx, y: c.y }).collect()
}

/// Convert a GeoJSON feature into antimeridian-safe polygons. Non-polygon
/// geometries are skipped with a log message.
pub fn polygons_from_feature(feature: &geojson::Feature) -> Vec<Polygon<f64>> {
    let Some(geometry) = &feature.geometry else {
        return Vec::new();
    };
    let geom: geo_types::Geometry<f64> = match geometry.value.clone().try_into() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("charts: unparseable geometry in area feature: {e}");
            return Vec::new();
        }
    };
    match geom {
        geo_types::Geometry::Polygon(p) => split_polygon_at_antimeridian(&p),
        geo_types::Geometry::MultiPolygon(mp) => mp
            .0
            .iter()
            .flat_map(split_polygon_at_antimeridian)
            .collect(),
        _ => {
            eprintln!("charts: skipping non-polygon geometry in area feature");
            Vec::new()
        }
    }
}

fn tiles_in_polygon_at_zoom(poly: Arc<Polygon<f64>>, z: u8) -> BoxTileIter {
    let Some(rect) = poly.bounding_rect() else {
        return Box::new(std::iter::empty());
    };
    let bbox = [rect.min().x, rect.min().y, rect.max().x, rect.max().y];
    let (x0, x1, y0, y1) = tile_range(bbox, z);
    Box::new((x0..=x1).flat_map(move |x| {
        let poly = Arc::clone(&poly);
        (y0..=y1)
            .map(move |y| Tile { z, x, y })
            .filter(move |t| poly.intersects(&tile_polygon(*t)))
    }))
}

/// Lazily enumerate the tiles whose own bbox intersects any of the polygons,
/// over a zoom range. Callers split crossing polygons first.
pub fn polygon_tiles(polygons: Vec<Polygon<f64>>, min_zoom: u8, max_zoom: u8) -> BoxTileIter {
    Box::new(polygons.into_iter().flat_map(move |poly| {
        let poly = Arc::new(poly);
        (min_zoom..=max_zoom).flat_map(move |z| tiles_in_polygon_at_zoom(Arc::clone(&poly), z))
    }))
}

/// Whether a tile's bbox intersects any of the polygons.
pub fn tile_in_polygons(t: Tile, polygons: &[Polygon<f64>]) -> bool {
    let tp = tile_polygon(t);
    polygons.iter().any(|p| p.intersects(&tp))
}

/// Estimate how many tiles a polygon touches at one zoom by sampling a
/// 64×64 grid of cell centers over its bbox for point-in-polygon hits.
pub fn estimate_polygon_tiles(poly: &Polygon<f64>, z: u8) -> u64 {
    let Some(rect) = poly.bounding_rect() else {
        return 0;
    };
    let bbox = [rect.min().x, rect.min().y, rect.max().x, rect.max().y];
    let bbox_count = bbox_tile_count(bbox, z);
    if bbox_count == 0 {
        return 0;
    }

    let (w, h) = (rect.width(), rect.height());
    let mut inside = 0u64;
    for i in 0..SAMPLE_GRID {
        for j in 0..SAMPLE_GRID {
            let lon = rect.min().x + (i as f64 + 0.5) / SAMPLE_GRID as f64 * w;
            let lat = rect.min().y + (j as f64 + 0.5) / SAMPLE_GRID as f64 * h;
            if poly.contains(&Point::new(lon, lat)) {
                inside += 1;
            }
        }
    }
    let total = (SAMPLE_GRID * SAMPLE_GRID) as u64;
    ((bbox_count as f64) * (inside as f64) / (total as f64)).round() as u64
}

/// Sum of the per-zoom sampling estimates over a zoom range.
pub fn estimate_polygon_range(polygons: &[Polygon<f64>], min_zoom: u8, max_zoom: u8) -> u64 {
    polygons
        .iter()
        .map(|p| {
            (min_zoom..=max_zoom)
                .map(|z| estimate_polygon_tiles(p, z))
                .sum::<u64>()
        })
        .sum()
}
