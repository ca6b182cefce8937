use crate::models::error::{BackupError, Result};
use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the engine database. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(db_file: &str) -> Result<Database> {
        if db_file.is_empty() {
            return Err(BackupError::Config(
                "Database file path cannot be empty. Provide a valid path or use ':memory:' for in-memory database.".to_string(),
            ));
        }

        info!("Initializing database connection pool: {}", db_file);

        let is_in_memory = db_file == ":memory:" || db_file.starts_with("file::memory:");
        let use_wal = !is_in_memory;

        let manager = SqliteConnectionManager::file(db_file).with_init(move |conn| {
            let mut pragmas = String::from(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            );

            if use_wal {
                pragmas.push_str(" PRAGMA journal_mode = WAL;");
            }

            conn.execute_batch(&pragmas)
        });

        // An in-memory database lives and dies with its connection, so it
        // gets exactly one that is never recycled.
        let builder = if is_in_memory {
            Pool::builder()
                .max_size(1)
                .max_lifetime(None)
                .idle_timeout(None)
        } else {
            Pool::builder().max_size(num_cpus::get_physical() as u32 + 7)
        };

        let pool = builder
            .build(manager)
            .map_err(|e| BackupError::DatabaseConnection {
                path: db_file.to_string(),
                cause: e.to_string(),
            })?;

        info!(
            "Database pool created with {} connections",
            pool.max_size()
        );

        let db = Database { pool };
        db.setup_database()?;
        Ok(db)
    }

    pub(crate) fn connection(&self) -> Result<DbConnection> {
        self.pool.get().map_err(|e| BackupError::DatabaseConnection {
            path: "pool".to_string(),
            cause: format!("Failed to get database connection from pool: {}", e),
        })
    }

    fn setup_database(&self) -> Result<()> {
        info!("Initializing database schema");
        let setup_queries = "BEGIN;

    CREATE TABLE IF NOT EXISTS Tasks(
        ID            TEXT    not null
            constraint Tasks_ID_pk
                primary key,
        Name          TEXT    not null,
        Definition    TEXT    not null,
        Status        TEXT    not null,
        Last_Run      integer,
        Next_Run      integer,
        constraint Tasks_Status_Check
            check (Status IN ('idle', 'running', 'success', 'error')));

    CREATE TABLE IF NOT EXISTS Snapshots(
        ID            integer not null
            constraint Snapshots_ID_pk
                primary key autoincrement,
        Task_ID       TEXT    not null
            constraint Snapshots_Tasks_ID_fk
                references Tasks (ID) on delete cascade,
        Kind          TEXT    not null,
        Created_At    integer not null,
        Backup_Type   TEXT    not null,
        constraint Snapshots_Task_Kind
            unique (Task_ID, Kind),
        constraint Snapshots_Kind_Check
            check (Kind IN ('latest', 'anchor')));

    CREATE TABLE IF NOT EXISTS Snapshot_Entries(
        Snapshot_ID   integer not null
            constraint Snapshot_Entries_Snapshots_ID_fk
                references Snapshots (ID) on delete cascade,
        Relative_Path TEXT    not null,
        File_Size     integer not null,
        Modified_Ns   integer not null,
        Hash          TEXT    not null,
        constraint Snapshot_Entries_pk
            primary key (Snapshot_ID, Relative_Path));

    CREATE TABLE IF NOT EXISTS Run_Logs(
        ID            TEXT    not null
            constraint Run_Logs_ID_pk
                primary key,
        Task_ID       TEXT    not null,
        Task_Name     TEXT    not null,
        Timestamp     integer not null,
        Status        TEXT    not null,
        Record        TEXT    not null,
        constraint Run_Logs_Status_Check
            check (Status IN ('success', 'warning', 'error', 'cancelled')));

    CREATE INDEX IF NOT EXISTS Run_Logs_Timestamp_index
            on Run_Logs (Timestamp DESC);

    CREATE INDEX IF NOT EXISTS Run_Logs_Task_ID_Timestamp_index
            on Run_Logs (Task_ID, Timestamp DESC);

    COMMIT;";

        let conn = self.connection()?;
        conn.execute_batch(setup_queries)
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "create tables".to_string(),
                cause,
            })?;
        info!("Database schema initialized successfully");
        Ok(())
    }
}
