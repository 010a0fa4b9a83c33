///! SQLite-backed catalog store
///!
///! One write connection plus, for file databases, a few read-only
///! connections. Under WAL the readers see the last committed state while a
///! batch is being written, so queries do not serialise behind the writer or
///! each other. In-memory stores read through the write connection.
///! Readers that are blocked on a connection are counted so the single ingest
///! writer can step aside between batches (see [`Store::should_yield`]).

use crate::error::{CatalogError, CatalogResult};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS Register (
        id TEXT PRIMARY KEY NOT NULL,
        value TEXT
    );
    CREATE TABLE IF NOT EXISTS Sectors (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        gridid INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS SectorsNameGrid ON Sectors (name, gridid);
    CREATE INDEX IF NOT EXISTS SectorsNameNoCase ON Sectors (name COLLATE NOCASE);
    CREATE INDEX IF NOT EXISTS SectorsGrid ON Sectors (gridid);
    CREATE TABLE IF NOT EXISTS Systems (
        id INTEGER PRIMARY KEY NOT NULL,
        sector INTEGER NOT NULL,
        name INTEGER NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        z INTEGER NOT NULL,
        edsmid INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS SystemsEdsmId ON Systems (edsmid);
    CREATE INDEX IF NOT EXISTS SystemsSectorName ON Systems (sector, name);
    CREATE INDEX IF NOT EXISTS SystemsXZY ON Systems (x, z, y);
    CREATE TABLE IF NOT EXISTS Names (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL COLLATE NOCASE
    );
    CREATE INDEX IF NOT EXISTS NamesName ON Names (name);
    CREATE TABLE IF NOT EXISTS EDDB (
        edsmid INTEGER PRIMARY KEY NOT NULL,
        eddbid INTEGER NOT NULL,
        eddbupdatedat INTEGER NOT NULL,
        population INTEGER NOT NULL,
        faction TEXT,
        government TEXT,
        allegiance TEXT,
        state TEXT,
        security TEXT,
        primaryeconomy TEXT,
        needspermit INTEGER NOT NULL,
        power TEXT,
        powerstate TEXT,
        properties TEXT
    );
";

/// Row counts of the main tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub systems: i64,
    pub sectors: i64,
    pub names: i64,
    pub eddb: i64,
}

impl std::fmt::Display for CatalogStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Systems: {}, Sectors: {}, Names: {}, EDDB: {}",
            self.systems, self.sectors, self.names, self.eddb
        )
    }
}

/// Read-only connections opened next to the writer of a file store
const READ_CONNECTIONS: usize = 4;

/// Catalog store
pub struct Store {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    waiting_readers: AtomicUsize,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (and create if needed) a database file
    pub fn open(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::debug!("Journal mode: {}", journal);
        let mut store = Self::with_connection(conn, Some(path.clone()))?;

        // opened after the schema exists
        for _ in 0..READ_CONNECTIONS {
            let reader = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            store.readers.push(Mutex::new(reader));
        }

        tracing::info!(
            "Opened catalog store at {:?} ({} read connections)",
            store.path,
            store.readers.len()
        );
        Ok(store)
    }

    /// Private in-memory database, used by tests and throwaway runs
    pub fn open_in_memory() -> CatalogResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> CatalogResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            waiting_readers: AtomicUsize::new(0),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run one read round trip
    ///
    /// Takes the first idle read connection, or waits on one in turn when
    /// all are busy. Must not be called from inside [`Store::write`] on an
    /// in-memory store.
    pub fn read<T, F>(&self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        if self.readers.is_empty() {
            return self.read_on(&self.writer, f);
        }
        for reader in &self.readers {
            if let Ok(conn) = reader.try_lock() {
                return Ok(f(&conn)?);
            }
        }
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.read_on(&self.readers[index], f)
    }

    fn read_on<T, F>(&self, conn: &Mutex<Connection>, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.waiting_readers.fetch_add(1, Ordering::SeqCst);
        let guard = conn.lock();
        self.waiting_readers.fetch_sub(1, Ordering::SeqCst);

        let conn = guard.map_err(|_| CatalogError::LockPoisoned)?;
        Ok(f(&conn)?)
    }

    /// Run a write round trip; the closure manages its own transaction
    pub fn write<T, F>(&self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&mut Connection) -> CatalogResult<T>,
    {
        let mut conn = self.writer.lock().map_err(|_| CatalogError::LockPoisoned)?;
        f(&mut conn)
    }

    /// True while some reader is blocked waiting for the connection
    pub fn should_yield(&self) -> bool {
        self.waiting_readers.load(Ordering::SeqCst) > 0
    }

    /// True when no system has been stored yet
    pub fn tables_empty(&self) -> CatalogResult<bool> {
        self.read(|conn| {
            conn.query_row("SELECT NOT EXISTS (SELECT 1 FROM Systems)", [], |row| {
                row.get(0)
            })
        })
    }

    /// Next free id of `Sectors` or `Names`
    pub(crate) fn next_id(&self, table: IdTable) -> CatalogResult<i64> {
        let sql = match table {
            IdTable::Sectors => "SELECT COALESCE(MAX(id), 0) + 1 FROM Sectors",
            IdTable::Names => "SELECT COALESCE(MAX(id), 0) + 1 FROM Names",
        };
        self.read(|conn| conn.query_row(sql, [], |row| row.get(0)))
    }

    /// Id of the sector with this name in this grid cell
    pub fn find_sector(&self, name: &str, grid_id: i32) -> CatalogResult<Option<i64>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id FROM Sectors WHERE name = ?1 AND gridid = ?2",
                params![name, grid_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn get_setting(&self, key: &str) -> CatalogResult<Option<String>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT value FROM Register WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    pub fn put_setting(&self, key: &str, value: &str) -> CatalogResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO Register (id, value) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn stats(&self) -> CatalogResult<CatalogStats> {
        self.read(|conn| {
            conn.query_row(
                "SELECT (SELECT COUNT(*) FROM Systems),
                        (SELECT COUNT(*) FROM Sectors),
                        (SELECT COUNT(*) FROM Names),
                        (SELECT COUNT(*) FROM EDDB)",
                [],
                |row| {
                    Ok(CatalogStats {
                        systems: row.get(0)?,
                        sectors: row.get(1)?,
                        names: row.get(2)?,
                        eddb: row.get(3)?,
                    })
                },
            )
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum IdTable {
    Sectors,
    Names,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.tables_empty().unwrap());
        assert_eq!(store.stats().unwrap(), CatalogStats::default());
        assert_eq!(store.next_id(IdTable::Sectors).unwrap(), 1);
        assert_eq!(store.next_id(IdTable::Names).unwrap(), 1);
        assert!(!store.should_yield());
    }

    #[test]
    fn test_settings_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_setting("EDSMLastSystems").unwrap(), None);
        store.put_setting("EDSMLastSystems", "2020-01-01T00:00:00Z").unwrap();
        store.put_setting("EDSMLastSystems", "2021-01-01T00:00:00Z").unwrap();
        assert_eq!(
            store.get_setting("EDSMLastSystems").unwrap().as_deref(),
            Some("2021-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_sector_lookup_is_exact() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|conn| {
                conn.execute(
                    "INSERT INTO Sectors (id, name, gridid) VALUES (7, 'Tucanae Sector', 1210)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.find_sector("Tucanae Sector", 1210).unwrap(), Some(7));
        assert_eq!(store.find_sector("tucanae sector", 1210).unwrap(), None);
        assert_eq!(store.find_sector("Tucanae Sector", 1211).unwrap(), None);
        assert_eq!(store.next_id(IdTable::Sectors).unwrap(), 8);
    }

    #[test]
    fn test_open_file_store() {
        let dir = std::env::temp_dir().join("starcat_test_store");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("catalog.db");
        {
            let store = Store::open(&path).unwrap();
            store.put_setting("k", "v").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_setting("k").unwrap().as_deref(), Some("v"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reads_do_not_wait_for_open_write() {
        let dir = std::env::temp_dir().join("starcat_test_store_readers");
        let _ = std::fs::remove_dir_all(&dir);
        let store = Store::open(dir.join("catalog.db")).unwrap();
        store.put_setting("EDSMLastSystems", "2020-01-01T00:00:00Z").unwrap();

        // a read issued while a write transaction is open neither blocks nor
        // sees the uncommitted row
        let seen = store
            .write(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE Register SET value = '2021-01-01T00:00:00Z' WHERE id = 'EDSMLastSystems'",
                    [],
                )?;
                let seen = store.get_setting("EDSMLastSystems")?;
                assert!(!store.should_yield());
                tx.commit()?;
                Ok(seen)
            })
            .unwrap();

        assert_eq!(seen.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(
            store.get_setting("EDSMLastSystems").unwrap().as_deref(),
            Some("2021-01-01T00:00:00Z")
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_concurrent_readers() {
        let dir = std::env::temp_dir().join("starcat_test_store_concurrent");
        let _ = std::fs::remove_dir_all(&dir);
        let store = std::sync::Arc::new(Store::open(dir.join("catalog.db")).unwrap());
        store.put_setting("k", "v").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.get_setting("k").unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().as_deref(), Some("v"));
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
