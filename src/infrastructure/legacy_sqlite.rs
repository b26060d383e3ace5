use crate::domain::{
    fold_person_name, DomainError, FaceRect, PhotoKey, SourceFace, SourceInventory, SourcePerson,
    SourceRepository, SourceTotals,
};
use rusqlite::{Connection, OpenFlags};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::warn;

/// Reader over the Windows Photos Legacy MediaGraph database.
///
/// Relevant schema: `Person` (Person_Id, Person_Name), `Face` (Face_Id,
/// Face_PersonId, Face_ItemId, Face_RectLeft/Top/Width/Height in
/// normalized coordinates) and `Item` (Item_Id, Item_FileName,
/// Item_FileSize). The store is never written: the connection is opened
/// read-only.
pub struct LegacySqliteReader {
    conn: Mutex<Connection>,
}

struct RawPerson {
    id: i64,
    name: String,
}

struct FaceRow {
    face_id: i64,
    person_id: i64,
    rect: Option<(f64, f64, f64, f64)>,
    file_name: Option<String>,
    file_size: Option<i64>,
}

impl LegacySqliteReader {
    pub fn open(path: &str) -> Result<Self, DomainError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DomainError::SourceStore(format!("cannot open {}: {}", path, e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DomainError::SourceStore("connection mutex poisoned".into()))?;
        f(&conn)
    }
}

impl SourceRepository for LegacySqliteReader {
    fn load(&self) -> Result<SourceInventory, DomainError> {
        self.with_conn(|conn| {
            let persons = read_persons(conn)?;
            if persons.is_empty() {
                return Err(DomainError::Schema(
                    "legacy store contains no named persons".into(),
                ));
            }
            let rows = read_face_rows(conn)?;
            Ok(build_inventory(persons, rows)?)
        })
    }

    fn totals(&self) -> Result<SourceTotals, DomainError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<i64, DomainError> {
                conn.query_row(sql, [], |row| row.get(0))
                    .map_err(|e| DomainError::Schema(e.to_string()))
            };
            Ok(SourceTotals {
                persons: count("SELECT COUNT(*) FROM Person WHERE Person_Name IS NOT NULL AND TRIM(Person_Name) != ''")?,
                faces: count("SELECT COUNT(*) FROM Face WHERE Face_PersonId IS NOT NULL")?,
                photos: count("SELECT COUNT(*) FROM Item")?,
            })
        })
    }
}

fn read_persons(conn: &Connection) -> Result<Vec<RawPerson>, DomainError> {
    let mut stmt = conn
        .prepare("SELECT Person_Id, Person_Name FROM Person")
        .map_err(|e| DomainError::Schema(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let name: Option<String> = row.get(1)?;
            Ok((id, name))
        })
        .map_err(|e| DomainError::Schema(e.to_string()))?;

    let mut persons = Vec::new();
    for row in rows {
        let (id, name) = row?;
        // Unnamed person rows cannot be migrated and are dropped here.
        let Some(name) = name else { continue };
        let name = name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        persons.push(RawPerson { id, name });
    }
    Ok(persons)
}

fn read_face_rows(conn: &Connection) -> Result<Vec<FaceRow>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT f.Face_Id, f.Face_PersonId,
                    f.Face_RectLeft, f.Face_RectTop, f.Face_RectWidth, f.Face_RectHeight,
                    i.Item_FileName, i.Item_FileSize
             FROM Face f
             JOIN Item i ON i.Item_Id = f.Face_ItemId
             WHERE f.Face_PersonId IS NOT NULL",
        )
        .map_err(|e| DomainError::Schema(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            let left: Option<f64> = row.get(2)?;
            let top: Option<f64> = row.get(3)?;
            let width: Option<f64> = row.get(4)?;
            let height: Option<f64> = row.get(5)?;
            let rect = match (left, top, width, height) {
                (Some(l), Some(t), Some(w), Some(h)) => Some((l, t, w, h)),
                _ => None,
            };
            Ok(FaceRow {
                face_id: row.get(0)?,
                person_id: row.get(1)?,
                rect,
                file_name: row.get(6)?,
                file_size: row.get(7)?,
            })
        })
        .map_err(|e| DomainError::Schema(e.to_string()))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Collapses person-name variants (case and whitespace) onto one canonical
/// person, normalizes rectangles and tallies the malformed ones.
fn build_inventory(
    persons: Vec<RawPerson>,
    rows: Vec<FaceRow>,
) -> Result<SourceInventory, DomainError> {
    // Faces per raw person id decide which variant is canonical.
    let mut raw_face_counts: HashMap<i64, usize> = HashMap::new();
    for row in &rows {
        *raw_face_counts.entry(row.person_id).or_default() += 1;
    }

    // Folded name -> canonical raw person (most faces, ties to lowest id).
    let mut canonical_by_name: HashMap<String, &RawPerson> = HashMap::new();
    for person in &persons {
        let folded = fold_person_name(&person.name);
        match canonical_by_name.get(&folded) {
            Some(current) => {
                let current_faces = raw_face_counts.get(&current.id).copied().unwrap_or(0);
                let candidate_faces = raw_face_counts.get(&person.id).copied().unwrap_or(0);
                if candidate_faces > current_faces
                    || (candidate_faces == current_faces && person.id < current.id)
                {
                    canonical_by_name.insert(folded, person);
                }
            }
            None => {
                canonical_by_name.insert(folded, person);
            }
        }
    }
    let mut canonical_of: HashMap<i64, i64> = HashMap::new();
    for person in &persons {
        let canonical = canonical_by_name[&fold_person_name(&person.name)];
        canonical_of.insert(person.id, canonical.id);
    }

    let mut inventory = SourceInventory::default();
    let mut seen_face_ids: HashSet<i64> = HashSet::new();
    for row in rows {
        let Some(&person_id) = canonical_of.get(&row.person_id) else {
            // Face owned by an unnamed person; out of scope for migration.
            continue;
        };
        if !seen_face_ids.insert(row.face_id) {
            return Err(DomainError::IdentifierCollision(format!(
                "face id {} appears more than once",
                row.face_id
            )));
        }
        let rect = row.rect.and_then(|(l, t, w, h)| FaceRect::new(l, t, l + w, t + h));
        let Some(rect) = rect else {
            inventory.malformed_faces += 1;
            continue;
        };
        let Some(file_name) = row.file_name else {
            inventory.malformed_faces += 1;
            continue;
        };
        if row.file_size.is_none() {
            inventory.key_degraded = true;
        }
        inventory.faces.push(SourceFace {
            id: row.face_id,
            person_id,
            photo: PhotoKey::from_parts(&file_name, row.file_size),
            rect,
        });
    }

    let mut final_counts: HashMap<i64, usize> = HashMap::new();
    for face in &inventory.faces {
        *final_counts.entry(face.person_id).or_default() += 1;
    }
    for person in canonical_by_name.values() {
        let face_count = final_counts.get(&person.id).copied().unwrap_or(0);
        let entry = SourcePerson {
            id: person.id,
            name: person.name.clone(),
            face_count,
        };
        if face_count == 0 {
            inventory.orphans.push(entry);
        } else {
            inventory.persons.insert(person.id, entry);
        }
    }
    inventory.orphans.sort_by_key(|p| p.id);

    if inventory.key_degraded {
        warn!("legacy items are missing file sizes; photo identity degraded to basename only");
    }
    Ok(inventory)
}

#[cfg(test)]
pub(crate) struct TestDb {
    pub path: String,
}

#[cfg(test)]
impl TestDb {
    /// Creates a scratch MediaGraph-shaped database in the temp dir.
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("{}_{}.db", prefix, uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Person (
                 Person_Id INTEGER PRIMARY KEY,
                 Person_Name TEXT
             );
             CREATE TABLE Item (
                 Item_Id INTEGER PRIMARY KEY,
                 Item_FileName TEXT NOT NULL,
                 Item_FileSize INTEGER
             );
             CREATE TABLE Face (
                 Face_Id INTEGER PRIMARY KEY,
                 Face_PersonId INTEGER,
                 Face_ItemId INTEGER NOT NULL REFERENCES Item(Item_Id),
                 Face_RectLeft REAL,
                 Face_RectTop REAL,
                 Face_RectWidth REAL,
                 Face_RectHeight REAL
             );",
        )
        .unwrap();
        Self { path }
    }

    pub fn insert_person(&self, id: i64, name: &str) {
        let conn = Connection::open(&self.path).unwrap();
        conn.execute(
            "INSERT INTO Person (Person_Id, Person_Name) VALUES (?1, ?2)",
            rusqlite::params![id, name],
        )
        .unwrap();
    }

    pub fn insert_item(&self, id: i64, file_name: &str, size: Option<i64>) {
        let conn = Connection::open(&self.path).unwrap();
        conn.execute(
            "INSERT INTO Item (Item_Id, Item_FileName, Item_FileSize) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, file_name, size],
        )
        .unwrap();
    }

    pub fn insert_face(
        &self,
        id: i64,
        person_id: Option<i64>,
        item_id: i64,
        rect: Option<(f64, f64, f64, f64)>,
    ) {
        let conn = Connection::open(&self.path).unwrap();
        let (l, t, w, h) = match rect {
            Some(r) => (Some(r.0), Some(r.1), Some(r.2), Some(r.3)),
            None => (None, None, None, None),
        };
        conn.execute(
            "INSERT INTO Face (Face_Id, Face_PersonId, Face_ItemId,
                               Face_RectLeft, Face_RectTop, Face_RectWidth, Face_RectHeight)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![id, person_id, item_id, l, t, w, h],
        )
        .unwrap();
    }
}

#[cfg(test)]
impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
