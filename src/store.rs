//! # Store
//!
//! Narrow storage interface consumed by the engine, plus the SQLite backend.
//!
//! The engine never caches writes locally; every uniqueness rule lives in
//! the schema so concurrent writers (other threads, other processes on the
//! same database file) cannot break it:
//!
//! - `discoveries`: `UNIQUE(account_id, spot_id)`, inserted with
//!   `ON CONFLICT DO NOTHING`
//! - `scan_throttle`: one row per account, advanced with a conditional upsert
//!   that only succeeds once the minimum interval has elapsed
//! - `ratings`: primary key `(target_id, account_id)`, re-rating replaces

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::error::Result;
use crate::ledger::InsertOutcome;
use crate::{
    Clue, Discovery, DiscoveryMode, GpsPoint, Rating, ScanEvent, Spot, Trail, TrailOptions,
};

/// Storage operations the engine depends on.
///
/// Implementations must make each call atomic on its own; no multi-call
/// transactions are assumed.
pub trait Store: Send + Sync {
    // Catalog (read-only for the engine)

    fn get_trail(&self, trail_id: &str) -> Result<Option<Trail>>;

    /// Spots of a trail in trail order.
    fn list_trail_spots(&self, trail_id: &str) -> Result<Vec<Spot>>;

    fn count_trail_spots(&self, trail_id: &str) -> Result<u32>;

    // Discoveries

    /// Insert unless `(account_id, spot_id)` exists; the existing record wins.
    fn insert_discovery_if_absent(&self, discovery: &Discovery) -> Result<InsertOutcome>;

    fn get_discovery(&self, account_id: &str, spot_id: &str) -> Result<Option<Discovery>>;

    /// An account's discoveries on a trail, oldest first.
    fn list_discoveries(&self, account_id: &str, trail_id: &str) -> Result<Vec<Discovery>>;

    /// Every account's discoveries on a trail, oldest first.
    fn list_trail_discoveries(&self, trail_id: &str) -> Result<Vec<Discovery>>;

    // Scan throttle

    fn last_scan_at(&self, account_id: &str) -> Result<Option<i64>>;

    /// Atomically set `last_scan_at = now_ms` if at least `min_interval_ms`
    /// passed since the previous value (or none exists). True if claimed.
    fn try_claim_scan(&self, account_id: &str, now_ms: i64, min_interval_ms: i64) -> Result<bool>;

    // Scan events

    fn insert_scan_event(&self, event: &ScanEvent) -> Result<()>;

    /// An account's scan events on a trail, newest first.
    fn list_scan_events(&self, account_id: &str, trail_id: &str) -> Result<Vec<ScanEvent>>;

    // Ratings

    fn upsert_rating(&self, rating: &Rating) -> Result<()>;

    /// True if a rating was removed.
    fn delete_rating(&self, target_id: &str, account_id: &str) -> Result<bool>;

    fn list_ratings(&self, target_id: &str) -> Result<Vec<Rating>>;
}

const SCHEMA_V1: &str = r#"
    -- Catalog, authored elsewhere
    CREATE TABLE trails (
        id TEXT PRIMARY KEY,
        discovery_mode TEXT NOT NULL DEFAULT 'free',
        scanner_radius REAL NOT NULL,
        snap_radius REAL
    );

    CREATE TABLE spots (
        id TEXT PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        discovery_radius REAL NOT NULL,
        clue_radius REAL NOT NULL
    );

    CREATE TABLE trail_spots (
        trail_id TEXT NOT NULL,
        spot_id TEXT NOT NULL,
        sort_order INTEGER NOT NULL,
        PRIMARY KEY (trail_id, spot_id)
    );

    -- Append-only ledger
    CREATE TABLE discoveries (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        spot_id TEXT NOT NULL,
        trail_id TEXT NOT NULL,
        discovered_at INTEGER NOT NULL,
        UNIQUE (account_id, spot_id)
    );

    CREATE TABLE scan_events (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        trail_id TEXT NOT NULL,
        scanned_at INTEGER NOT NULL,
        radius_used REAL NOT NULL,
        successful INTEGER NOT NULL,
        clues_json TEXT NOT NULL,
        discovered_json TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL
    );

    CREATE TABLE scan_throttle (
        account_id TEXT PRIMARY KEY,
        last_scan_at INTEGER NOT NULL
    );

    CREATE TABLE ratings (
        target_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        value INTEGER NOT NULL CHECK (value BETWEEN 1 AND 5),
        PRIMARY KEY (target_id, account_id)
    );

    CREATE INDEX idx_trail_spots_order ON trail_spots(trail_id, sort_order);
    CREATE INDEX idx_discoveries_trail ON discoveries(trail_id, discovered_at);
    CREATE INDEX idx_discoveries_account_trail ON discoveries(account_id, trail_id);
    CREATE INDEX idx_scan_events_account_trail ON scan_events(account_id, trail_id, scanned_at);
"#;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(SCHEMA_V1)])
}

/// SQLite-backed store.
///
/// A single connection guarded by a mutex; each trait call holds the lock
/// for exactly one statement (or one insert-then-read pair).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn new(db_path: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        migrations().to_latest(&mut conn)?;
        info!("[Store] Opened {}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations().to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-call leaves SQLite itself consistent; keep serving
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Catalog seeding
    // ========================================================================

    /// Insert or replace a trail.
    pub fn put_trail(&self, trail: &Trail) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO trails (id, discovery_mode, scanner_radius, snap_radius)
             VALUES (?, ?, ?, ?)",
            params![
                trail.id,
                trail.options.discovery_mode.as_str(),
                trail.options.scanner_radius,
                trail.options.snap_radius,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a spot.
    pub fn put_spot(&self, spot: &Spot) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO spots (id, latitude, longitude, discovery_radius, clue_radius)
             VALUES (?, ?, ?, ?, ?)",
            params![
                spot.id,
                spot.location.latitude,
                spot.location.longitude,
                spot.discovery_radius,
                spot.clue_radius,
            ],
        )?;
        Ok(())
    }

    /// Place a spot on a trail at the given position.
    pub fn link_spot(&self, trail_id: &str, spot_id: &str, order: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO trail_spots (trail_id, spot_id, sort_order) VALUES (?, ?, ?)",
            params![trail_id, spot_id, order],
        )?;
        Ok(())
    }
}

fn discovery_from_row(row: &Row) -> rusqlite::Result<Discovery> {
    Ok(Discovery {
        id: row.get(0)?,
        account_id: row.get(1)?,
        spot_id: row.get(2)?,
        trail_id: row.get(3)?,
        discovered_at: row.get(4)?,
    })
}

const DISCOVERY_COLUMNS: &str = "id, account_id, spot_id, trail_id, discovered_at";

/// Scan event columns before JSON decoding.
struct ScanEventRow {
    id: String,
    account_id: String,
    trail_id: String,
    scanned_at: i64,
    radius_used: f64,
    successful: bool,
    clues_json: String,
    discovered_json: String,
    latitude: f64,
    longitude: f64,
}

impl ScanEventRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            trail_id: row.get(2)?,
            scanned_at: row.get(3)?,
            radius_used: row.get(4)?,
            successful: row.get(5)?,
            clues_json: row.get(6)?,
            discovered_json: row.get(7)?,
            latitude: row.get(8)?,
            longitude: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ScanEvent> {
        let clues: Vec<Clue> = serde_json::from_str(&self.clues_json)?;
        let discovered_spot_ids: Vec<String> = serde_json::from_str(&self.discovered_json)?;
        Ok(ScanEvent {
            id: self.id,
            account_id: self.account_id,
            trail_id: self.trail_id,
            scanned_at: self.scanned_at,
            radius_used: self.radius_used,
            successful: self.successful,
            clues,
            discovered_spot_ids,
            location: GpsPoint::new(self.latitude, self.longitude),
        })
    }
}

impl Store for SqliteStore {
    fn get_trail(&self, trail_id: &str) -> Result<Option<Trail>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, discovery_mode, scanner_radius, snap_radius FROM trails WHERE id = ?",
                params![trail_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(id, mode, scanner_radius, snap_radius)| {
            let discovery_mode = DiscoveryMode::parse(&mode).unwrap_or_else(|| {
                warn!("[Store] Trail {} has unknown discovery mode '{}'", id, mode);
                DiscoveryMode::default()
            });
            Trail::with_options(
                id,
                TrailOptions {
                    discovery_mode,
                    scanner_radius,
                    snap_radius,
                },
            )
        }))
    }

    fn list_trail_spots(&self, trail_id: &str) -> Result<Vec<Spot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.latitude, s.longitude, s.discovery_radius, s.clue_radius
             FROM trail_spots ts JOIN spots s ON s.id = ts.spot_id
             WHERE ts.trail_id = ?
             ORDER BY ts.sort_order, s.id",
        )?;
        let spots = stmt
            .query_map(params![trail_id], |row| {
                Ok(Spot {
                    id: row.get(0)?,
                    location: GpsPoint::new(row.get(1)?, row.get(2)?),
                    discovery_radius: row.get(3)?,
                    clue_radius: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(spots)
    }

    fn count_trail_spots(&self, trail_id: &str) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM trail_spots ts JOIN spots s ON s.id = ts.spot_id
             WHERE ts.trail_id = ?",
            params![trail_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_discovery_if_absent(&self, discovery: &Discovery) -> Result<InsertOutcome> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO discoveries (id, account_id, spot_id, trail_id, discovered_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_id, spot_id) DO NOTHING",
            params![
                discovery.id,
                discovery.account_id,
                discovery.spot_id,
                discovery.trail_id,
                discovery.discovered_at,
            ],
        )?;

        if inserted == 1 {
            return Ok(InsertOutcome::Created(discovery.clone()));
        }

        let existing = conn.query_row(
            &format!(
                "SELECT {} FROM discoveries WHERE account_id = ? AND spot_id = ?",
                DISCOVERY_COLUMNS
            ),
            params![discovery.account_id, discovery.spot_id],
            discovery_from_row,
        )?;
        Ok(InsertOutcome::Existing(existing))
    }

    fn get_discovery(&self, account_id: &str, spot_id: &str) -> Result<Option<Discovery>> {
        let discovery = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM discoveries WHERE account_id = ? AND spot_id = ?",
                    DISCOVERY_COLUMNS
                ),
                params![account_id, spot_id],
                discovery_from_row,
            )
            .optional()?;
        Ok(discovery)
    }

    fn list_discoveries(&self, account_id: &str, trail_id: &str) -> Result<Vec<Discovery>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM discoveries WHERE account_id = ? AND trail_id = ?
             ORDER BY discovered_at, id",
            DISCOVERY_COLUMNS
        ))?;
        let discoveries = stmt
            .query_map(params![account_id, trail_id], discovery_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(discoveries)
    }

    fn list_trail_discoveries(&self, trail_id: &str) -> Result<Vec<Discovery>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM discoveries WHERE trail_id = ? ORDER BY discovered_at, id",
            DISCOVERY_COLUMNS
        ))?;
        let discoveries = stmt
            .query_map(params![trail_id], discovery_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(discoveries)
    }

    fn last_scan_at(&self, account_id: &str) -> Result<Option<i64>> {
        let last = self
            .conn()
            .query_row(
                "SELECT last_scan_at FROM scan_throttle WHERE account_id = ?",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last)
    }

    fn try_claim_scan(&self, account_id: &str, now_ms: i64, min_interval_ms: i64) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO scan_throttle (account_id, last_scan_at) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET last_scan_at = excluded.last_scan_at
             WHERE excluded.last_scan_at - scan_throttle.last_scan_at >= ?3",
            params![account_id, now_ms, min_interval_ms],
        )?;
        Ok(changed == 1)
    }

    fn insert_scan_event(&self, event: &ScanEvent) -> Result<()> {
        let clues_json = serde_json::to_string(&event.clues)?;
        let discovered_json = serde_json::to_string(&event.discovered_spot_ids)?;
        self.conn().execute(
            "INSERT INTO scan_events (id, account_id, trail_id, scanned_at, radius_used,
                                      successful, clues_json, discovered_json, latitude, longitude)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                event.id,
                event.account_id,
                event.trail_id,
                event.scanned_at,
                event.radius_used,
                event.successful,
                clues_json,
                discovered_json,
                event.location.latitude,
                event.location.longitude,
            ],
        )?;
        Ok(())
    }

    fn list_scan_events(&self, account_id: &str, trail_id: &str) -> Result<Vec<ScanEvent>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, account_id, trail_id, scanned_at, radius_used, successful,
                        clues_json, discovered_json, latitude, longitude
                 FROM scan_events WHERE account_id = ? AND trail_id = ?
                 ORDER BY scanned_at DESC, rowid DESC",
            )?;
            let rows = stmt
                .query_map(params![account_id, trail_id], ScanEventRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(ScanEventRow::decode).collect()
    }

    fn upsert_rating(&self, rating: &Rating) -> Result<()> {
        self.conn().execute(
            "INSERT INTO ratings (target_id, account_id, value) VALUES (?, ?, ?)
             ON CONFLICT(target_id, account_id) DO UPDATE SET value = excluded.value",
            params![rating.target_id, rating.account_id, rating.value],
        )?;
        Ok(())
    }

    fn delete_rating(&self, target_id: &str, account_id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM ratings WHERE target_id = ? AND account_id = ?",
            params![target_id, account_id],
        )?;
        Ok(removed > 0)
    }

    fn list_ratings(&self, target_id: &str) -> Result<Vec<Rating>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target_id, account_id, value FROM ratings WHERE target_id = ?
             ORDER BY account_id",
        )?;
        let ratings = stmt
            .query_map(params![target_id], |row| {
                Ok(Rating {
                    target_id: row.get(0)?,
                    account_id: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ratings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.put_trail(&Trail::new("t1")).unwrap();
        for (i, id) in ["b", "a", "c"].iter().enumerate() {
            store
                .put_spot(&Spot::new(*id, GpsPoint::new(51.5 + i as f64 * 0.001, -0.12), 10.0, 50.0))
                .unwrap();
            store.link_spot("t1", id, i as i64).unwrap();
        }
        store
    }

    fn discovery(id: &str, account: &str, spot: &str, at: i64) -> Discovery {
        Discovery {
            id: id.to_string(),
            account_id: account.to_string(),
            spot_id: spot.to_string(),
            trail_id: "t1".to_string(),
            discovered_at: at,
        }
    }

    #[test]
    fn test_trail_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let trail = Trail::with_options(
            "t",
            TrailOptions {
                discovery_mode: DiscoveryMode::Scan,
                scanner_radius: 220.0,
                snap_radius: Some(15.0),
            },
        );
        store.put_trail(&trail).unwrap();
        assert_eq!(store.get_trail("t").unwrap(), Some(trail));
        assert!(store.get_trail("missing").unwrap().is_none());
    }

    #[test]
    fn test_spots_in_trail_order() {
        let store = seeded();
        let ids: Vec<String> = store
            .list_trail_spots("t1")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(store.count_trail_spots("t1").unwrap(), 3);
        assert_eq!(store.count_trail_spots("other").unwrap(), 0);
    }

    #[test]
    fn test_discovery_insert_if_absent() {
        let store = seeded();
        let first = store
            .insert_discovery_if_absent(&discovery("d1", "acct", "a", 100))
            .unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));

        let second = store
            .insert_discovery_if_absent(&discovery("d2", "acct", "a", 200))
            .unwrap();
        match second {
            InsertOutcome::Existing(d) => {
                assert_eq!(d.id, "d1");
                assert_eq!(d.discovered_at, 100);
            }
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.list_discoveries("acct", "t1").unwrap().len(), 1);
    }

    #[test]
    fn test_discoveries_ordered_by_time() {
        let store = seeded();
        store.insert_discovery_if_absent(&discovery("d1", "acct", "c", 300)).unwrap();
        store.insert_discovery_if_absent(&discovery("d2", "acct", "a", 100)).unwrap();
        store.insert_discovery_if_absent(&discovery("d3", "other", "b", 200)).unwrap();

        let mine: Vec<String> = store
            .list_discoveries("acct", "t1")
            .unwrap()
            .into_iter()
            .map(|d| d.spot_id)
            .collect();
        assert_eq!(mine, vec!["a", "c"]);

        let all = store.list_trail_discoveries("t1").unwrap();
        assert_eq!(all.iter().map(|d| d.discovered_at).collect::<Vec<_>>(), vec![100, 200, 300]);
        assert_eq!(store.get_discovery("other", "b").unwrap().unwrap().id, "d3");
    }

    #[test]
    fn test_throttle_claim() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.last_scan_at("acct").unwrap().is_none());
        assert!(store.try_claim_scan("acct", 10_000, 5_000).unwrap());
        assert!(!store.try_claim_scan("acct", 14_999, 5_000).unwrap());
        assert_eq!(store.last_scan_at("acct").unwrap(), Some(10_000));
        assert!(store.try_claim_scan("acct", 15_000, 5_000).unwrap());
        assert_eq!(store.last_scan_at("acct").unwrap(), Some(15_000));
        // Other accounts are independent
        assert!(store.try_claim_scan("other", 15_001, 5_000).unwrap());
    }

    #[test]
    fn test_scan_event_roundtrip() {
        let store = seeded();
        let event = ScanEvent {
            id: "e1".into(),
            account_id: "acct".into(),
            trail_id: "t1".into(),
            scanned_at: 1_000,
            radius_used: 150.0,
            successful: true,
            clues: vec![Clue {
                spot_id: "a".into(),
                trail_id: "t1".into(),
                location: GpsPoint::new(51.5, -0.12),
                source: crate::ClueSource::ScanEvent,
            }],
            discovered_spot_ids: vec!["b".into()],
            location: GpsPoint::new(51.5005, -0.12),
        };
        store.insert_scan_event(&event).unwrap();
        let later = ScanEvent {
            id: "e2".into(),
            scanned_at: 9_000,
            successful: false,
            clues: vec![],
            discovered_spot_ids: vec![],
            ..event.clone()
        };
        store.insert_scan_event(&later).unwrap();

        let events = store.list_scan_events("acct", "t1").unwrap();
        assert_eq!(events, vec![later, event]);
    }

    #[test]
    fn test_ratings_upsert_and_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let rating = |v| Rating {
            target_id: "spot-1".into(),
            account_id: "acct".into(),
            value: v,
        };
        store.upsert_rating(&rating(5)).unwrap();
        store.upsert_rating(&rating(3)).unwrap();
        let ratings = store.list_ratings("spot-1").unwrap();
        assert_eq!(ratings, vec![rating(3)]);

        assert!(store.delete_rating("spot-1", "acct").unwrap());
        assert!(!store.delete_rating("spot-1", "acct").unwrap());
        assert!(store.list_ratings("spot-1").unwrap().is_empty());
    }

    #[test]
    fn test_rating_range_enforced_by_schema() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.upsert_rating(&Rating {
            target_id: "t".into(),
            account_id: "a".into(),
            value: 9,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_file_persistence() {
        let tmp_dir = TempDir::new().unwrap();
        let db_path = tmp_dir.path().join("waymark.db");
        let path = db_path.to_str().unwrap();

        {
            let store = SqliteStore::new(path).unwrap();
            store.put_trail(&Trail::new("t1")).unwrap();
            store
                .insert_discovery_if_absent(&discovery("d1", "acct", "a", 5))
                .unwrap();
        }

        // Reopening runs migrations again without touching existing data
        let store = SqliteStore::new(path).unwrap();
        assert!(store.get_trail("t1").unwrap().is_some());
        assert_eq!(store.list_discoveries("acct", "t1").unwrap().len(), 1);
    }
}
