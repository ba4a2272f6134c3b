use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, trace};

use crate::errors::{AppError, AppResult};
use crate::transform::Coordinate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    pub id: i64,
    pub address: String,
    pub city: String,
}

/// Everything the pipeline derives for a record, written in a single update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub provider_point: Coordinate,
    pub standard_point: Coordinate,
    pub confidence: i64,
    pub level: String,
    pub comprehension: i64,
    pub precise: i64,
}

/// A stored row including its derived fields, all `None` while pending.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLocation {
    pub record: LocationRecord,
    pub provider_point: Option<Coordinate>,
    pub standard_point: Option<Coordinate>,
    pub confidence: Option<i64>,
    pub level: Option<String>,
    pub comprehension: Option<i64>,
    pub precise: Option<i64>,
}

impl StoredLocation {
    pub fn is_pending(&self) -> bool {
        self.standard_point.is_none()
    }
}

pub trait RecordStore: Send + Sync {
    /// Up to `limit` pending records with an id greater than `after`,
    /// ordered by id.
    fn pending_page(&self, after: Option<i64>, limit: usize) -> AppResult<Vec<LocationRecord>>;

    /// Writes all derived fields for a still-pending record in one statement.
    fn update(&self, id: i64, resolution: &Resolution) -> AppResult<()>;

    fn pending_count(&self) -> AppResult<u64>;

    /// Lazily walks the whole backlog a page at a time.
    fn list_pending(&self, page_size: usize) -> PendingRecords<'_, Self>
    where
        Self: Sized,
    {
        PendingRecords::new(self, page_size)
    }
}

pub struct PendingRecords<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    page_size: usize,
    cursor: Option<i64>,
    buffer: VecDeque<LocationRecord>,
    exhausted: bool,
}

impl<'a, S: RecordStore + ?Sized> PendingRecords<'a, S> {
    pub fn new(store: &'a S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl<S: RecordStore + ?Sized> Iterator for PendingRecords<'_, S> {
    type Item = AppResult<LocationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.pending_page(self.cursor, self.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }

        let record = self.buffer.pop_front()?;
        self.cursor = Some(record.id);
        Some(Ok(record))
    }
}

pub struct SqliteRecordStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Seeds a pending row. Ingestion normally happens elsewhere.
    pub fn insert_pending(&self, address: &str, city: &str) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO location_info (address, city) VALUES (?1, ?2)",
            (address, city),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch(&self, id: i64) -> AppResult<Option<StoredLocation>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, address, city, bd_lng, bd_lat, wgs_lng, wgs_lat,
                confidence, level, comprehension, precise
            FROM location_info
            WHERE id = ?1",
            [id],
            parse_stored_location,
        )
        .optional()
        .map_err(AppError::from)
    }
}

impl RecordStore for SqliteRecordStore {
    fn pending_page(&self, after: Option<i64>, limit: usize) -> AppResult<Vec<LocationRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, address, city
            FROM location_info
            WHERE wgs_lng IS NULL AND id > ?1
            ORDER BY id ASC
            LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![after.unwrap_or(i64::MIN), limit], |row| {
                Ok(LocationRecord {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    city: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        trace!(
            target: "record_store",
            after = ?after,
            fetched = rows.len(),
            "loaded backlog page"
        );
        Ok(rows)
    }

    fn update(&self, id: i64, resolution: &Resolution) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE location_info
            SET bd_lng = ?1, bd_lat = ?2, wgs_lng = ?3, wgs_lat = ?4,
                confidence = ?5, level = ?6, comprehension = ?7, precise = ?8
            WHERE id = ?9 AND wgs_lng IS NULL",
            params![
                resolution.provider_point.lng,
                resolution.provider_point.lat,
                resolution.standard_point.lng,
                resolution.standard_point.lat,
                resolution.confidence,
                resolution.level,
                resolution.comprehension,
                resolution.precise,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotPending(id));
        }
        debug!(target: "record_store", record_id = id, "resolution persisted");
        Ok(())
    }

    fn pending_count(&self) -> AppResult<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM location_info WHERE wgs_lng IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn parse_stored_location(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredLocation> {
    let point = |lng: Option<f64>, lat: Option<f64>| match (lng, lat) {
        (Some(lng), Some(lat)) => Some(Coordinate::new(lng, lat)),
        _ => None,
    };
    Ok(StoredLocation {
        record: LocationRecord {
            id: row.get(0)?,
            address: row.get(1)?,
            city: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        },
        provider_point: point(row.get(3)?, row.get(4)?),
        standard_point: point(row.get(5)?, row.get(6)?),
        confidence: row.get(7)?,
        level: row.get(8)?,
        comprehension: row.get(9)?,
        precise: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::db::bootstrap;

    fn open_store() -> (TempDir, SqliteRecordStore) {
        let dir = tempdir().unwrap();
        let context = bootstrap(dir.path().join("store.db"), Duration::from_millis(200)).unwrap();
        let store = SqliteRecordStore::new(Arc::new(Mutex::new(context.connection)));
        (dir, store)
    }

    fn resolution(confidence: i64) -> Resolution {
        Resolution {
            provider_point: Coordinate::new(116.404, 39.915),
            standard_point: Coordinate::new(116.3914, 39.9073),
            confidence,
            level: "旅游景点".into(),
            comprehension: 100,
            precise: 1,
        }
    }

    #[test]
    fn lists_pending_records_across_pages_in_id_order() {
        let (_dir, store) = open_store();
        let mut ids = Vec::new();
        for i in 0..7 {
            ids.push(store.insert_pending(&format!("addr-{i}"), "北京市").unwrap());
        }
        store.update(ids[2], &resolution(80)).unwrap();

        let listed: Vec<i64> = store
            .list_pending(3)
            .map(|record| record.unwrap().id)
            .collect();
        let expected: Vec<i64> = ids.iter().copied().filter(|id| *id != ids[2]).collect();
        assert_eq!(listed, expected);
        assert_eq!(store.pending_count().unwrap(), 6);
    }

    #[test]
    fn update_writes_every_derived_field() {
        let (_dir, store) = open_store();
        let id = store.insert_pending("天安门", "北京市").unwrap();
        store.update(id, &resolution(75)).unwrap();

        let stored = store.fetch(id).unwrap().unwrap();
        assert!(!stored.is_pending());
        assert_eq!(stored.provider_point, Some(Coordinate::new(116.404, 39.915)));
        assert_eq!(stored.standard_point, Some(Coordinate::new(116.3914, 39.9073)));
        assert_eq!(stored.confidence, Some(75));
        assert_eq!(stored.level.as_deref(), Some("旅游景点"));
        assert_eq!(stored.comprehension, Some(100));
        assert_eq!(stored.precise, Some(1));
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn resolved_record_is_never_overwritten() {
        let (_dir, store) = open_store();
        let id = store.insert_pending("天安门", "北京市").unwrap();
        store.update(id, &resolution(75)).unwrap();

        let err = store.update(id, &resolution(10)).unwrap_err();
        assert!(matches!(err, AppError::NotPending(found) if found == id));
        assert_eq!(store.fetch(id).unwrap().unwrap().confidence, Some(75));
    }

    #[test]
    fn missing_record_is_reported() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.update(404, &resolution(50)),
            Err(AppError::NotPending(404))
        ));
    }

    #[test]
    fn failed_write_leaves_record_fully_pending() {
        let (_dir, store) = open_store();
        let id = store.insert_pending("天安门", "北京市").unwrap();

        let err = store.update(id, &resolution(250)).unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));

        let stored = store.fetch(id).unwrap().unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.provider_point, None);
        assert_eq!(stored.confidence, None);
        assert_eq!(stored.level, None);
        assert_eq!(stored.comprehension, None);
        assert_eq!(stored.precise, None);
    }

    #[test]
    fn empty_backlog_yields_nothing() {
        let (_dir, store) = open_store();
        assert_eq!(store.list_pending(10).count(), 0);
    }
}
