//! SQLite store for probe sessions
//!
//! Each uploaded [`Run`] becomes one `session` row plus the `pings` and
//! `summary` rows pointing at it, written in a single transaction.
//! Read-side statistics are computed in SQL with the functions from
//! [`crate::functions`], which every opened handle registers.

use crate::functions;
use crate::probe::{Observation, Run, Summary};
use crate::schema::*;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Nullable};
use diesel::sqlite::SqliteConnection;
use log::{debug, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("only successful runs can be uploaded")]
    FailedRun,
    #[error("upload rolled back: {0}")]
    Upload(#[source] diesel::result::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = session)]
struct NewSession<'a> {
    id: &'a str,
    created: i64,
}

#[derive(Insertable)]
#[diesel(table_name = pings)]
struct NewPing<'a> {
    session_id: &'a str,
    nbytes: i64,
    ip_addr: String,
    icmp_seq: i64,
    time_ms: f64,
}

impl<'a> NewPing<'a> {
    fn new(session_id: &'a str, observation: &Observation) -> Self {
        Self {
            session_id,
            nbytes: i64::from(observation.byte_count),
            ip_addr: observation.source_address.to_string(),
            icmp_seq: i64::from(observation.sequence_number),
            time_ms: observation.round_trip_time_ms,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = summary)]
struct NewSummary<'a> {
    session_id: &'a str,
    n_transmitted: i64,
    n_received: i64,
    packet_loss: f64,
}

impl<'a> NewSummary<'a> {
    fn new(session_id: &'a str, totals: &Summary) -> Self {
        Self {
            session_id,
            n_transmitted: i64::from(totals.transmitted_count()),
            n_received: i64::from(totals.received_count()),
            packet_loss: totals.packet_loss_fraction(),
        }
    }
}

/// A stored session
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = session)]
pub struct SessionRecord {
    pub id: String,
    pub created: i64,
}

// ============================================================================
// Statistics Rows
// ============================================================================

/// Mean round trip of one session and the standard error of that mean.
///
/// A session without replies has no mean and a standard error of 0.0.
#[derive(QueryableByName, Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResponseTime {
    #[diesel(sql_type = BigInt)]
    pub timestamp: i64,
    #[diesel(sql_type = Nullable<Double>)]
    pub mean_ms: Option<f64>,
    #[diesel(sql_type = Double)]
    pub standard_error_ms: f64,
}

/// Seconds between a session and the one before it
#[derive(QueryableByName, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    #[diesel(sql_type = BigInt)]
    pub timestamp: i64,
    #[diesel(sql_type = BigInt)]
    pub delta_seconds: i64,
}

// ============================================================================
// Database Connection
// ============================================================================

const TABLES: [&str; 3] = ["session", "pings", "summary"];

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Drop all tables before anything else
    pub clear: bool,
    /// Create missing tables
    pub create: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            clear: false,
            create: true,
        }
    }
}

/// Owns one connection to the backing file.
///
/// Not meant to be shared between concurrent operations. The connection is
/// closed when the store is dropped, including on error paths.
pub struct Store {
    conn: SqliteConnection,
    path: PathBuf,
}

impl Store {
    /// Open the store with the standard `sqrt`/`std` functions
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        Self::open_with(path, options, functions::register)
    }

    /// Open the store, running `extensions` once on the new connection
    /// before any table is touched.
    pub fn open_with<P, F>(path: P, options: StoreOptions, extensions: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut SqliteConnection) -> QueryResult<()>,
    {
        let path = path.as_ref().to_path_buf();
        debug!("creating database {}", path.display());

        let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
        diesel::sql_query("PRAGMA foreign_keys = ON").execute(&mut conn)?;
        extensions(&mut conn)?;

        let mut store = Self { conn, path };
        if options.clear {
            store.reset()?;
        }
        if options.create {
            store.create_tables()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the connection
    pub fn close(self) {}

    fn reset(&mut self) -> Result<()> {
        info!("resetting database");
        self.conn.transaction::<_, diesel::result::Error, _>(|conn| {
            // Children before the parent they reference
            for table in TABLES.iter().rev() {
                info!("dropping table {}", table);
                diesel::sql_query(format!("DROP TABLE IF EXISTS {}", table)).execute(conn)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn create_tables(&mut self) -> Result<()> {
        info!("creating tables");
        self.conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS session (
                    id TEXT PRIMARY KEY,
                    created INTEGER NOT NULL
                )
            "#,
            )
            .execute(conn)?;

            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS pings (
                    id INTEGER PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES session(id),
                    nbytes INTEGER NOT NULL,
                    ip_addr TEXT NOT NULL,
                    icmp_seq INTEGER NOT NULL,
                    time_ms REAL NOT NULL
                )
            "#,
            )
            .execute(conn)?;

            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS summary (
                    id INTEGER PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES session(id),
                    n_transmitted INTEGER NOT NULL,
                    n_received INTEGER NOT NULL,
                    packet_loss REAL NOT NULL
                )
            "#,
            )
            .execute(conn)?;

            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_session_created ON session(created)").execute(conn)?;
            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_pings_session ON pings(session_id)").execute(conn)?;
            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_summary_session ON summary(session_id)").execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Store a successful run as a new session created now
    pub fn upload(&mut self, run: Run) -> Result<String> {
        self.upload_at(run, chrono::Utc::now().timestamp())
    }

    /// Store a successful run as a new session created at `created`
    /// (seconds since the epoch). Returns the new session id.
    ///
    /// All rows are written in one transaction: on error nothing of the
    /// session is left behind.
    pub fn upload_at(&mut self, run: Run, created: i64) -> Result<String> {
        if !run.is_success() {
            return Err(DbError::FailedRun);
        }
        let totals = run.summary().copied().ok_or(DbError::FailedRun)?;

        let session_id = Uuid::new_v4().to_string();
        let transaction_id = Uuid::new_v4();
        debug!("starting transaction {}", transaction_id);

        self.conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                info!("uploading session");
                diesel::insert_into(session::table)
                    .values(&NewSession {
                        id: &session_id,
                        created,
                    })
                    .execute(conn)?;

                info!("uploading pings");
                for observation in run.observations() {
                    diesel::insert_into(pings::table)
                        .values(&NewPing::new(&session_id, observation))
                        .execute(conn)?;
                }

                info!("uploading summary");
                diesel::insert_into(summary::table)
                    .values(&NewSummary::new(&session_id, &totals))
                    .execute(conn)?;

                Ok(())
            })
            .map_err(DbError::Upload)?;

        debug!("ending transaction {}", transaction_id);
        Ok(session_id)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// All sessions in creation order
    pub fn sessions(&mut self) -> Result<Vec<SessionRecord>> {
        let sessions = session::table
            .select(SessionRecord::as_select())
            .order(session::created.asc())
            .load(&mut self.conn)?;
        Ok(sessions)
    }

    /// Mean round trip and its standard error, one row per session, oldest
    /// first. Sessions without replies are included.
    pub fn response_times(&mut self, limit: Option<u32>) -> Result<Vec<ResponseTime>> {
        let rows = diesel::sql_query(
            r#"
            SELECT s.created AS timestamp,
                   AVG(p.time_ms) AS mean_ms,
                   CASE WHEN COUNT(p.time_ms) = 0 THEN 0.0
                        ELSE std(p.time_ms) / sqrt(CAST(COUNT(p.time_ms) AS REAL))
                   END AS standard_error_ms
            FROM session s
            LEFT JOIN pings p ON p.session_id = s.id
            GROUP BY s.id
            ORDER BY s.created ASC, s.rowid ASC
            LIMIT ?
        "#,
        )
        .bind::<BigInt, _>(sql_limit(limit))
        .load::<ResponseTime>(&mut self.conn)?;
        Ok(rows)
    }

    /// Gaps between consecutive distinct session timestamps, oldest first.
    ///
    /// The first timestamp has no predecessor and produces no entry, so
    /// fewer than two distinct timestamps give an empty result.
    pub fn gaps(&mut self, limit: Option<u32>) -> Result<Vec<Gap>> {
        let rows = diesel::sql_query(
            r#"
            SELECT timestamp, delta_seconds
            FROM (
                SELECT created AS timestamp,
                       created - LAG(created) OVER (ORDER BY created) AS delta_seconds
                FROM (SELECT DISTINCT created FROM session)
            )
            WHERE delta_seconds IS NOT NULL
            ORDER BY timestamp ASC
            LIMIT ?
        "#,
        )
        .bind::<BigInt, _>(sql_limit(limit))
        .load::<Gap>(&mut self.conn)?;
        Ok(rows)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        debug!("closing database {}", self.path.display());
    }
}

// SQLite treats a negative LIMIT as no limit
fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("netcheck.db"), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn run_with_times(times: &[f64]) -> Run {
        let observations = times
            .iter()
            .enumerate()
            .map(|(seq, &time)| Observation {
                byte_count: 64,
                source_address: Ipv4Addr::new(93, 184, 216, 34),
                sequence_number: seq as u32,
                time_to_live: 53,
                round_trip_time_ms: time,
            })
            .collect();
        let n = times.len() as u32;
        Run::success(observations, Summary::new(n.max(1), n).unwrap())
    }

    fn count(store: &mut Store, table: &str) -> i64 {
        #[derive(QueryableByName)]
        struct Count {
            #[diesel(sql_type = BigInt)]
            n: i64,
        }
        diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {}", table))
            .get_result::<Count>(&mut store.conn)
            .unwrap()
            .n
    }

    fn table_exists(store: &mut Store, table: &str) -> bool {
        #[derive(QueryableByName)]
        struct Count {
            #[diesel(sql_type = BigInt)]
            n: i64,
        }
        diesel::sql_query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind::<diesel::sql_types::Text, _>(table)
            .get_result::<Count>(&mut store.conn)
            .unwrap()
            .n
            == 1
    }

    // ==========================================================================
    // OPEN / SCHEMA TESTS
    // ==========================================================================

    #[test]
    fn test_open_creates_tables() {
        let (_dir, mut store) = temp_store();
        for table in TABLES {
            assert!(table_exists(&mut store, table), "missing table {}", table);
        }
    }

    #[test]
    fn test_open_without_create() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions { clear: false, create: false };
        let mut store = Store::open(dir.path().join("bare.db"), options).unwrap();

        assert!(!table_exists(&mut store, "session"));
        assert!(matches!(store.response_times(None), Err(DbError::Query(_))));
    }

    #[test]
    fn test_reopen_keeps_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netcheck.db");

        let mut store = Store::open(&path, StoreOptions::default()).unwrap();
        let id = store.upload_at(run_with_times(&[1.0]), 100).unwrap();
        store.close();

        let mut store = Store::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.sessions().unwrap(), vec![SessionRecord { id, created: 100 }]);
    }

    #[test]
    fn test_clear_drops_existing_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netcheck.db");

        let mut store = Store::open(&path, StoreOptions::default()).unwrap();
        store.upload_at(run_with_times(&[1.0, 2.0]), 100).unwrap();
        store.close();

        let options = StoreOptions { clear: true, create: true };
        let mut store = Store::open(&path, options).unwrap();
        assert_eq!(count(&mut store, "session"), 0);
        assert_eq!(count(&mut store, "pings"), 0);
        assert_eq!(count(&mut store, "summary"), 0);
    }

    #[test]
    fn test_clear_on_fresh_file() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions { clear: true, create: true };
        assert!(Store::open(dir.path().join("fresh.db"), options).is_ok());
    }

    #[test]
    fn test_extensions_run_once_per_handle() {
        let dir = TempDir::new().unwrap();
        let calls = Cell::new(0);
        let store = Store::open_with(dir.path().join("ext.db"), StoreOptions::default(), |conn| {
            calls.set(calls.get() + 1);
            functions::register(conn)
        })
        .unwrap();

        assert_eq!(calls.get(), 1);
        store.close();
    }

    #[test]
    fn test_statistics_need_registered_functions() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open_with(dir.path().join("plain.db"), StoreOptions::default(), |_| Ok(())).unwrap();
        store.upload_at(run_with_times(&[1.0, 2.0]), 100).unwrap();

        assert!(store.response_times(None).is_err());
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let (_dir, mut store) = temp_store();
        let result = diesel::insert_into(pings::table)
            .values(&NewPing::new("no-such-session", &run_with_times(&[1.0]).observations()[0]))
            .execute(&mut store.conn);

        assert!(result.is_err());
    }

    // ==========================================================================
    // UPLOAD TESTS
    // ==========================================================================

    #[test]
    fn test_upload_writes_all_rows() {
        let (_dir, mut store) = temp_store();
        let id = store.upload(run_with_times(&[91.755, 94.0, 90.5])).unwrap();

        assert_eq!(count(&mut store, "session"), 1);
        assert_eq!(count(&mut store, "pings"), 3);
        assert_eq!(count(&mut store, "summary"), 1);

        let sessions = store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);

        let stored: Vec<(i64, String, i64, f64)> = pings::table
            .filter(pings::session_id.eq(id.as_str()))
            .order(pings::id.asc())
            .select((pings::nbytes, pings::ip_addr, pings::icmp_seq, pings::time_ms))
            .load(&mut store.conn)
            .unwrap();
        assert_eq!(stored[0], (64, "93.184.216.34".to_string(), 0, 91.755));
        assert_eq!(stored[2].2, 2);

        let totals: (i64, i64, f64) = summary::table
            .filter(summary::session_id.eq(id.as_str()))
            .select((summary::n_transmitted, summary::n_received, summary::packet_loss))
            .first(&mut store.conn)
            .unwrap();
        assert_eq!(totals, (3, 3, 0.0));
    }

    #[test]
    fn test_upload_assigns_fresh_ids() {
        let (_dir, mut store) = temp_store();
        let a = store.upload_at(run_with_times(&[1.0]), 100).unwrap();
        let b = store.upload_at(run_with_times(&[1.0]), 100).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_upload_rejects_failed_run() {
        let (_dir, mut store) = temp_store();
        assert!(matches!(store.upload(Run::failure()), Err(DbError::FailedRun)));
        assert_eq!(count(&mut store, "session"), 0);
    }

    #[test]
    fn test_upload_is_atomic() {
        let (_dir, mut store) = temp_store();
        // The summary insert is the last step; make it fail
        diesel::sql_query("DROP TABLE summary").execute(&mut store.conn).unwrap();

        let result = store.upload_at(run_with_times(&[1.0, 2.0, 3.0]), 100);

        assert!(matches!(result, Err(DbError::Upload(_))));
        assert_eq!(count(&mut store, "session"), 0);
        assert_eq!(count(&mut store, "pings"), 0);
    }

    // ==========================================================================
    // RESPONSE TIME TESTS
    // ==========================================================================

    #[test]
    fn test_response_times_mean_and_standard_error() {
        let (_dir, mut store) = temp_store();
        store.upload_at(run_with_times(&[1.0, 2.0, 3.0]), 100).unwrap();

        let rows = store.response_times(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 100);
        assert!((rows[0].mean_ms.unwrap() - 2.0).abs() < 1e-12);
        // sqrt(2/3) / sqrt(3)
        assert!((rows[0].standard_error_ms - 2.0f64.sqrt() / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_response_times_single_reply_has_zero_error() {
        let (_dir, mut store) = temp_store();
        store.upload_at(run_with_times(&[42.0]), 100).unwrap();

        let rows = store.response_times(None).unwrap();
        assert_eq!(rows[0].mean_ms, Some(42.0));
        assert_eq!(rows[0].standard_error_ms, 0.0);
    }

    #[test]
    fn test_response_times_ordered_and_limited() {
        let (_dir, mut store) = temp_store();
        store.upload_at(run_with_times(&[30.0]), 300).unwrap();
        store.upload_at(run_with_times(&[10.0]), 100).unwrap();
        store.upload_at(run_with_times(&[20.0]), 200).unwrap();

        let all: Vec<(i64, Option<f64>)> = store
            .response_times(None)
            .unwrap()
            .iter()
            .map(|r| (r.timestamp, r.mean_ms))
            .collect();
        assert_eq!(all, vec![(100, Some(10.0)), (200, Some(20.0)), (300, Some(30.0))]);

        let first_two = store.response_times(Some(2)).unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[1].timestamp, 200);
    }

    #[test]
    fn test_response_times_include_sessions_without_replies() {
        let (_dir, mut store) = temp_store();
        let lost = crate::probe::parse("3 packets transmitted, 0 packets received, 100.0% packet loss").unwrap();
        store.upload_at(lost, 100).unwrap();
        store.upload_at(run_with_times(&[5.0]), 200).unwrap();

        let rows = store.response_times(None).unwrap();
        assert_eq!(
            rows,
            vec![
                ResponseTime { timestamp: 100, mean_ms: None, standard_error_ms: 0.0 },
                ResponseTime { timestamp: 200, mean_ms: Some(5.0), standard_error_ms: 0.0 },
            ]
        );
    }

    // ==========================================================================
    // GAP TESTS
    // ==========================================================================

    #[test]
    fn test_gaps_between_sessions() {
        let (_dir, mut store) = temp_store();
        for created in [100, 160, 245] {
            store.upload_at(run_with_times(&[1.0]), created).unwrap();
        }

        assert_eq!(
            store.gaps(None).unwrap(),
            vec![
                Gap { timestamp: 160, delta_seconds: 60 },
                Gap { timestamp: 245, delta_seconds: 85 },
            ]
        );
    }

    #[test]
    fn test_gaps_use_distinct_timestamps() {
        let (_dir, mut store) = temp_store();
        for created in [245, 100, 100, 160] {
            store.upload_at(run_with_times(&[1.0]), created).unwrap();
        }

        let deltas: Vec<i64> = store.gaps(None).unwrap().iter().map(|g| g.delta_seconds).collect();
        assert_eq!(deltas, vec![60, 85]);
    }

    #[test]
    fn test_gaps_limit() {
        let (_dir, mut store) = temp_store();
        for created in [100, 160, 245, 300] {
            store.upload_at(run_with_times(&[1.0]), created).unwrap();
        }

        assert_eq!(store.gaps(Some(1)).unwrap(), vec![Gap { timestamp: 160, delta_seconds: 60 }]);
    }

    #[test]
    fn test_gaps_empty_store() {
        let (_dir, mut store) = temp_store();
        assert!(store.gaps(None).unwrap().is_empty());

        store.upload_at(run_with_times(&[1.0]), 100).unwrap();
        assert!(store.gaps(None).unwrap().is_empty());
    }

    #[test]
    fn test_gaps_extreme_timestamps_do_not_panic() {
        let (_dir, mut store) = temp_store();
        store.upload_at(run_with_times(&[1.0]), i64::MIN).unwrap();
        store.upload_at(run_with_times(&[1.0]), i64::MAX).unwrap();

        let gaps = store.gaps(None).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].timestamp, i64::MAX);
    }

    #[test]
    fn test_sql_limit() {
        assert_eq!(sql_limit(None), -1);
        assert_eq!(sql_limit(Some(5)), 5);
    }
}
