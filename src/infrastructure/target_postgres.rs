use crate::domain::{
    Cluster, DomainError, FaceRect, PhotoKey, TargetAsset, TargetFace, TargetInventory,
    TargetRepository, TargetTotals,
};
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashMap;
use tracing::warn;

const POOL_SIZE: u32 = 4;

/// Reader over the Immich Postgres database. An Immich `person` row is a
/// cluster (blank name = unnamed); `asset_faces` carries pixel bounding
/// boxes plus the image dimensions they were measured against; `assets`
/// and `exif` supply the photo identity key.
pub struct TargetPostgresReader {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl TargetPostgresReader {
    pub fn connect(
        host: &str,
        port: u16,
        dbname: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self, DomainError> {
        let mut config = postgres::Config::new();
        config.host(host).port(port).dbname(dbname).user(user);
        if let Some(password) = password {
            config.password(password);
        }
        let manager = PostgresConnectionManager::new(config, NoTls);
        // build() establishes the first connections, which doubles as the
        // connection test for the config endpoints; keep the wait short.
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)?;
        Ok(Self { pool })
    }
}

impl TargetRepository for TargetPostgresReader {
    fn load(&self) -> Result<TargetInventory, DomainError> {
        let mut client = self.pool.get()?;
        let mut inventory = TargetInventory::default();

        // Clusters: every Immich person, named or not.
        let face_counts: HashMap<String, i64> = client
            .query(
                r#"SELECT "personId"::text, COUNT(*)
                   FROM asset_faces
                   WHERE "personId" IS NOT NULL
                   GROUP BY 1"#,
                &[],
            )?
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();
        for row in client.query("SELECT id::text, name FROM person", &[])? {
            let id: String = row.get(0);
            let raw_name: Option<String> = row.get(1);
            let name = normalize_cluster_name(raw_name);
            if let Some(name) = &name {
                inventory.person_names.insert(name.clone());
            }
            inventory.clusters.insert(
                id.clone(),
                Cluster {
                    face_count: face_counts.get(&id).copied().unwrap_or(0),
                    id,
                    name,
                },
            );
        }

        // Assets and their identity keys.
        let mut key_of_asset: HashMap<String, PhotoKey> = HashMap::new();
        let asset_rows = client.query(
            r#"SELECT a.id::text, a."originalFileName", e."fileSizeInByte",
                      e."exifImageWidth", e."exifImageHeight"
               FROM assets a
               LEFT JOIN exif e ON e."assetId" = a.id"#,
            &[],
        )?;
        for row in asset_rows {
            let id: String = row.get(0);
            let file_name: Option<String> = row.get(1);
            let size: Option<i64> = row.get(2);
            let Some(file_name) = file_name else { continue };
            if size.is_none() {
                inventory.key_degraded = true;
            }
            let key = PhotoKey::from_parts(&file_name, size);
            key_of_asset.insert(id.clone(), key.clone());
            inventory.assets.insert(
                key,
                TargetAsset {
                    id,
                    width: row.get(3),
                    height: row.get(4),
                },
            );
        }

        // Faces, normalized from pixel boxes on read.
        let face_rows = client.query(
            r#"SELECT f.id::text, f."assetId"::text, f."personId"::text,
                      f."boundingBoxX1", f."boundingBoxY1", f."boundingBoxX2", f."boundingBoxY2",
                      f."imageWidth", f."imageHeight"
               FROM asset_faces f"#,
            &[],
        )?;
        for row in face_rows {
            let id: String = row.get(0);
            let asset_id: String = row.get(1);
            let cluster_id: Option<String> = row.get(2);
            let Some(photo) = key_of_asset.get(&asset_id) else {
                inventory.malformed_faces += 1;
                continue;
            };
            let rect = normalize_bbox(
                row.get::<_, i32>(3),
                row.get::<_, i32>(4),
                row.get::<_, i32>(5),
                row.get::<_, i32>(6),
                row.get::<_, i32>(7),
                row.get::<_, i32>(8),
            );
            let Some(rect) = rect else {
                inventory.malformed_faces += 1;
                continue;
            };
            inventory.faces.push(TargetFace {
                id,
                asset_id,
                photo: photo.clone(),
                rect,
                cluster_id,
            });
        }

        if inventory.key_degraded {
            warn!("immich exif rows are missing file sizes; photo identity degraded to basename only");
        }
        Ok(inventory)
    }

    fn totals(&self) -> Result<TargetTotals, DomainError> {
        let mut client = self.pool.get()?;
        let count = |client: &mut postgres::Client, sql: &str| -> Result<i64, DomainError> {
            let row = client.query_one(sql, &[])?;
            Ok(row.get(0))
        };
        Ok(TargetTotals {
            assets: count(&mut client, "SELECT COUNT(*) FROM assets")?,
            faces: count(&mut client, "SELECT COUNT(*) FROM asset_faces")?,
            clusters: count(&mut client, "SELECT COUNT(*) FROM person")?,
        })
    }
}

/// Blank and whitespace-only names both mean "unnamed" so the rename
/// bucket and the already-named refusal share one definition.
fn normalize_cluster_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Immich boxes are pixel corners measured against `imageWidth` x
/// `imageHeight`; degenerate boxes and non-positive dimensions drop out.
fn normalize_bbox(x1: i32, y1: i32, x2: i32, y2: i32, img_w: i32, img_h: i32) -> Option<FaceRect> {
    if img_w <= 0 || img_h <= 0 {
        return None;
    }
    FaceRect::new(
        x1 as f64 / img_w as f64,
        y1 as f64 / img_h as f64,
        x2 as f64 / img_w as f64,
        y2 as f64 / img_h as f64,
    )
}
