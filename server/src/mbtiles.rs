use std::fs;
use std::path::{Path, PathBuf};

use geo::{BoundingRect, Polygon};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::tile_math::{self, Tile, flip_y, lonlat_to_tile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open MBTiles store {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("MBTiles read failed: {0}")]
    Read(sqlx::Error),

    #[error("MBTiles write failed: {0}")]
    Write(sqlx::Error),
}

/// Provider metadata written into the `metadata` table on open.
#[derive(Debug, Clone)]
pub struct StoreMetadata {
    pub name: String,
    pub format: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

/// A single MBTiles file: `map` rows point at content-deduplicated `images`
/// blobs, with the standard `tiles` view on top. Rows use the TMS y
/// convention; the XYZ↔TMS flip happens only at this boundary.
///
/// The pool is capped at one connection, which doubles as the per-store
/// writer token: concurrent jobs and request handlers queue their statements
/// on it instead of contending for the SQLite file lock.
#[derive(Debug)]
pub struct MbtilesStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl MbtilesStore {
    pub async fn open(path: impl AsRef<Path>, meta: &StoreMetadata) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |message: String| StoreError::Open {
            path: path.clone(),
            message,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
        }
        if !path.exists() {
            fs::write(&path, b"").map_err(|e| open_err(e.to_string()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite://{}", path.display()))
            .await
            .map_err(|e| open_err(e.to_string()))?;

        let store = Self { pool, path };
        store.apply_pragmas().await;
        store
            .create_schema(meta)
            .await
            .map_err(|e| StoreError::Open {
                path: store.path.clone(),
                message: e.to_string(),
            })?;
        Ok(store)
    }

    async fn apply_pragmas(&self) {
        let synchronous = std::env::var("CT_SQLITE_SYNCHRONOUS")
            .unwrap_or_else(|_| "NORMAL".to_string())
            .to_uppercase();
        let synchronous = match synchronous.as_str() {
            "OFF" | "NORMAL" | "FULL" | "EXTRA" => synchronous,
            _ => "NORMAL".to_string(),
        };

        // page_size and auto_vacuum only take effect on a fresh database,
        // before the first table is created.
        let pragmas = [
            "PRAGMA page_size=4096;".to_string(),
            "PRAGMA auto_vacuum=INCREMENTAL;".to_string(),
            "PRAGMA journal_mode=WAL;".to_string(),
            format!("PRAGMA synchronous={synchronous};"),
            "PRAGMA temp_store=MEMORY;".to_string(),
            "PRAGMA locking_mode=EXCLUSIVE;".to_string(),
            "PRAGMA cache_size=-20480;".to_string(),
            "PRAGMA mmap_size=268435456;".to_string(),
        ];

        for stmt in pragmas {
            if let Err(err) = sqlx::query(&stmt).execute(&self.pool).await {
                eprintln!("mbtiles: pragma failed ({stmt}): {err}");
            }
        }
    }

    async fn create_schema(&self, meta: &StoreMetadata) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS map (
                zoom_level  INTEGER NOT NULL,
                tile_column INTEGER NOT NULL,
                tile_row    INTEGER NOT NULL,
                tile_id     TEXT    NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS map_index ON map (zoom_level, tile_column, tile_row)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                tile_id   TEXT PRIMARY KEY NOT NULL,
                tile_data BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS metadata (name TEXT PRIMARY KEY, value TEXT)")
            .execute(&self.pool)
            .await?;

        // The standard read-side view most MBTiles consumers expect.
        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS tiles AS
                SELECT map.zoom_level   AS zoom_level,
                       map.tile_column  AS tile_column,
                       map.tile_row     AS tile_row,
                       images.tile_data AS tile_data
                FROM map
                JOIN images ON images.tile_id = map.tile_id;
            "#,
        )
        .execute(&self.pool)
        .await?;

        let rows = [
            ("name", meta.name.clone()),
            ("type", "baselayer".to_string()),
            ("version", "1.1".to_string()),
            ("format", meta.format.clone()),
            ("minzoom", meta.min_zoom.to_string()),
            ("maxzoom", meta.max_zoom.to_string()),
        ];
        for (name, value) in rows {
            sqlx::query("INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Tile bytes, or `None` when the store has no such tile.
    pub async fn get_tile(&self, t: Tile) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            "SELECT tile_data FROM map JOIN images ON images.tile_id = map.tile_id \
             WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(t.z as i64)
        .bind(t.x as i64)
        .bind(flip_y(t.y, t.z) as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Read)?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("tile_data")))
    }

    /// Write a tile, deduplicating the blob by content hash. Idempotent.
    pub async fn put_tile(&self, t: Tile, bytes: &[u8]) -> Result<(), StoreError> {
        let tile_id = blake3::hash(bytes).to_hex().to_string();
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;
        sqlx::query("INSERT OR IGNORE INTO images (tile_id, tile_data) VALUES (?, ?)")
            .bind(&tile_id)
            .bind(bytes)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?;
        sqlx::query(
            "INSERT OR REPLACE INTO map (zoom_level, tile_column, tile_row, tile_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(t.z as i64)
        .bind(t.x as i64)
        .bind(flip_y(t.y, t.z) as i64)
        .bind(&tile_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Write)?;
        tx.commit().await.map_err(StoreError::Write)
    }

    /// Delete `map` rows for the given tiles in transactions of `chunk_size`,
    /// yielding between chunks. Leaves `images` untouched (see
    /// [`purge_orphan_images`](Self::purge_orphan_images)). Returns the total
    /// number of rows deleted; `on_progress` receives the running total after
    /// each chunk.
    pub async fn delete_tiles_in_chunks(
        &self,
        tiles: impl Iterator<Item = Tile> + Send,
        chunk_size: usize,
        mut on_progress: impl FnMut(u64) + Send,
    ) -> Result<u64, StoreError> {
        let mut total = 0u64;
        let mut pending: Vec<Tile> = Vec::with_capacity(chunk_size);
        for t in tiles {
            pending.push(t);
            if pending.len() >= chunk_size {
                total += self.delete_chunk(&pending).await?;
                pending.clear();
                on_progress(total);
                tokio::task::yield_now().await;
            }
        }
        if !pending.is_empty() {
            total += self.delete_chunk(&pending).await?;
            on_progress(total);
        }
        Ok(total)
    }

    async fn delete_chunk(&self, tiles: &[Tile]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;
        let mut deleted = 0u64;
        for t in tiles {
            let res = sqlx::query(
                "DELETE FROM map WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
            )
            .bind(t.z as i64)
            .bind(t.x as i64)
            .bind(flip_y(t.y, t.z) as i64)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?;
            deleted += res.rows_affected();
        }
        tx.commit().await.map_err(StoreError::Write)?;
        Ok(deleted)
    }

    /// Delete `images` rows no longer referenced by any `map` row, up to
    /// `chunk_size` per pass, until none remain. `on_progress` receives
    /// `(last_chunk_deleted, cumulative)`. Ends with a WAL truncate.
    pub async fn purge_orphan_images(
        &self,
        chunk_size: usize,
        mut on_progress: impl FnMut(u64, u64) + Send,
    ) -> Result<u64, StoreError> {
        let mut cumulative = 0u64;
        loop {
            let res = sqlx::query(
                "DELETE FROM images WHERE tile_id IN ( \
                   SELECT tile_id FROM images \
                   WHERE tile_id NOT IN (SELECT DISTINCT tile_id FROM map) LIMIT ?)",
            )
            .bind(chunk_size as i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Write)?;
            let deleted = res.rows_affected();
            cumulative += deleted;
            on_progress(deleted, cumulative);
            if deleted == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.checkpoint().await;
        Ok(cumulative)
    }

    /// VACUUM requires a rollback journal, and SQLite refuses to leave WAL
    /// while the locking mode is exclusive, so relax it for the duration.
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        for stmt in [
            "PRAGMA locking_mode=NORMAL;",
            "PRAGMA journal_mode=DELETE;",
            "VACUUM;",
            "PRAGMA journal_mode=WAL;",
            "PRAGMA locking_mode=EXCLUSIVE;",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Write)?;
        }
        Ok(())
    }

    /// Tiles that both exist in this store and intersect one of the polygons.
    /// Queries the `map` window per zoom (in TMS row space) and filters each
    /// hit by polygon intersection, so only cached tiles are enumerated.
    pub async fn tiles_in_polygon(
        &self,
        polygons: &[Polygon<f64>],
        min_zoom: u8,
        max_zoom: u8,
    ) -> Result<Vec<Tile>, StoreError> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for poly in polygons {
            let Some(rect) = poly.bounding_rect() else {
                continue;
            };
            for z in min_zoom..=max_zoom {
                let (x0, y0) = lonlat_to_tile(rect.min().x, rect.max().y, z);
                let (x1, y1) = lonlat_to_tile(rect.max().x, rect.min().y, z);
                let (row0, row1) = (flip_y(y0.max(y1), z), flip_y(y0.min(y1), z));
                let rows = sqlx::query(
                    "SELECT tile_column, tile_row FROM map \
                     WHERE zoom_level = ? AND tile_column BETWEEN ? AND ? \
                       AND tile_row BETWEEN ? AND ?",
                )
                .bind(z as i64)
                .bind(x0.min(x1) as i64)
                .bind(x0.max(x1) as i64)
                .bind(row0 as i64)
                .bind(row1 as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Read)?;

                for r in rows {
                    let x = r.get::<i64, _>("tile_column") as u32;
                    let y = flip_y(r.get::<i64, _>("tile_row") as u32, z);
                    let t = Tile { z, x, y };
                    if seen.insert(t) && tile_math::tile_in_polygons(t, std::slice::from_ref(poly))
                    {
                        out.push(t);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Number of `map` rows.
    pub async fn tile_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM map")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        Ok(n as u64)
    }

    /// Number of `images` rows (deduplicated blobs).
    pub async fn image_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        Ok(n as u64)
    }

    /// Checkpoint all WAL frames and truncate the log.
    pub async fn checkpoint(&self) {
        if let Err(err) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&self.pool)
            .await
        {
            eprintln!("mbtiles: wal_checkpoint(TRUNCATE) failed: {err}");
        }
    }

    /// Flush journals and release the connection; called on shutdown.
    pub async fn flush_and_close(&self) {
        self.checkpoint().await;
        if let Err(err) = sqlx::query("PRAGMA optimize;").execute(&self.pool).await {
            eprintln!("mbtiles: PRAGMA optimize failed: {err}");
        }
        self.pool.close().await;
    }
}
