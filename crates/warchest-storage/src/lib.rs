//! DuckDB-backed persistence for agent progression records.

#[cfg(target_os = "windows")]
#[link(name = "rstrtmgr")]
extern "system" {}

use duckdb::{Connection, Transaction, params};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, mpsc},
    thread,
};
use thiserror::Error;
use warchest_core::{AgentProgress, ArchetypeKey, ProgressStore, SpeciesKey, Tick, UpgradeKey};

const DEFAULT_PENDING_BUFFER: usize = 128;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("levels column error: {0}")]
    Levels(#[from] serde_json::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// Row written to the `agent_progress` table. Levels travel as a JSON
/// object keyed by upgrade.
#[derive(Debug, Clone)]
struct ProgressRow {
    identity: i64,
    species: String,
    day_points: f64,
    kill_points: f64,
    spent_points: f64,
    levels: String,
    tier: i64,
    priority_path: Option<String>,
    last_step: i64,
}

fn row_from_progress(
    identity: u64,
    progress: &AgentProgress,
) -> Result<ProgressRow, serde_json::Error> {
    Ok(ProgressRow {
        identity: identity as i64,
        species: progress.species().to_string(),
        day_points: progress.day_points(),
        kill_points: progress.kill_points(),
        spent_points: progress.spent_points(),
        levels: serde_json::to_string(progress.levels())?,
        tier: i64::from(progress.tier()),
        priority_path: progress.priority_path().map(|path| path.to_string()),
        last_step: progress.last_evaluated_step().0 as i64,
    })
}

/// DuckDB-backed progress store with buffered writes. Rows pend in memory
/// keyed by identity, so repeated saves of the same agent collapse to the
/// freshest record before they hit the database.
pub struct ProgressDb {
    conn: Connection,
    pending: HashMap<i64, ProgressRow>,
    flush_threshold: usize,
}

impl ProgressDb {
    /// Open or create a DuckDB database at the provided path with the
    /// default buffering threshold.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, DEFAULT_PENDING_BUFFER)
    }

    /// Override the number of pending rows that triggers a flush.
    pub fn open_with_threshold(path: &str, flush_threshold: usize) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, flush_threshold)
    }

    /// Ephemeral in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_PENDING_BUFFER)
    }

    fn from_connection(conn: Connection, flush_threshold: usize) -> Result<Self, StorageError> {
        let mut db = Self {
            conn,
            pending: HashMap::new(),
            flush_threshold: flush_threshold.max(1),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists agent_progress (
                identity bigint primary key,
                species text,
                day_points double,
                kill_points double,
                spent_points double,
                levels json,
                tier integer,
                priority_path text,
                last_step bigint
            )",
            [],
        )?;
        Ok(())
    }

    /// Buffer one progress record, flushing once the threshold is met.
    pub fn persist(&mut self, identity: u64, progress: &AgentProgress) -> Result<(), StorageError> {
        let row = row_from_progress(identity, progress)?;
        self.pending.insert(row.identity, row);
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_rows(
        tx: &Transaction<'_>,
        rows: &HashMap<i64, ProgressRow>,
    ) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into agent_progress (
                identity, species, day_points, kill_points, spent_points,
                levels, tier, priority_path, last_step
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows.values() {
            stmt.execute(params![
                row.identity,
                row.species,
                row.day_points,
                row.kill_points,
                row.spent_points,
                row.levels,
                row.tier,
                row.priority_path.as_deref(),
                row.last_step,
            ])?;
        }
        Ok(())
    }

    /// Force flush buffered records to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_rows(&tx, &self.pending)?;
        tx.commit()?;
        self.pending.clear();
        Ok(())
    }

    /// Look up one persisted record. Pending rows are flushed first so a
    /// read always sees the latest save.
    pub fn fetch(&mut self, identity: u64) -> Result<Option<AgentProgress>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select species, day_points, kill_points, spent_points,
                    levels, tier, priority_path, last_step
             from agent_progress
             where identity = ?",
        )?;
        let mut rows = stmt.query(params![identity as i64])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let species: String = row.get(0)?;
        let day_points: f64 = row.get(1)?;
        let kill_points: f64 = row.get(2)?;
        let spent_points: f64 = row.get(3)?;
        let levels_doc: String = row.get(4)?;
        let tier: i64 = row.get(5)?;
        let priority_path: Option<String> = row.get(6)?;
        let last_step: i64 = row.get(7)?;
        let levels: HashMap<UpgradeKey, u16> = serde_json::from_str(&levels_doc)?;
        Ok(Some(AgentProgress::from_parts(
            SpeciesKey::new(species),
            day_points,
            kill_points,
            spent_points,
            levels,
            tier.clamp(0, i64::from(u8::MAX)) as u8,
            priority_path.map(ArchetypeKey::new),
            Tick(last_step.max(0) as u64),
        )))
    }

    /// Agents ranked by lifetime spend, ties broken by identity.
    pub fn most_advanced(&mut self, limit: usize) -> Result<Vec<AdvancedAgent>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select identity, species, spent_points, tier
             from agent_progress
             order by spent_points desc, identity asc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut ranked = Vec::with_capacity(limit.min(16));
        while let Some(row) = rows.next()? {
            ranked.push(AdvancedAgent {
                identity: row.get::<_, i64>(0)? as u64,
                species: SpeciesKey::new(row.get::<_, String>(1)?),
                spent_points: row.get::<_, f64>(2)?,
                tier: row.get::<_, i64>(3)?.clamp(0, i64::from(u8::MAX)) as u8,
            });
        }
        Ok(ranked)
    }

    /// Per-species agent counts and point totals.
    pub fn species_totals(&mut self) -> Result<Vec<SpeciesSpend>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select species,
                    count(*) as agents,
                    sum(spent_points) as total_spent,
                    sum(day_points + kill_points) as total_earned
             from agent_progress
             group by species
             order by total_spent desc",
        )?;
        let mut rows = stmt.query([])?;
        let mut totals = Vec::new();
        while let Some(row) = rows.next()? {
            totals.push(SpeciesSpend {
                species: SpeciesKey::new(row.get::<_, String>(0)?),
                agents: row.get::<_, i64>(1)? as u64,
                total_spent: row.get::<_, f64>(2)?,
                total_earned: row.get::<_, f64>(3)?,
            });
        }
        Ok(totals)
    }

    /// Rows buffered but not yet written.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ProgressDb {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            eprintln!("failed to flush progress rows on drop: {err}");
        }
    }
}

impl ProgressStore for ProgressDb {
    fn load(&mut self, identity: u64) -> Option<AgentProgress> {
        match self.fetch(identity) {
            Ok(record) => record,
            Err(err) => {
                eprintln!("failed to load progress for {identity}: {err}");
                None
            }
        }
    }

    fn save(&mut self, identity: u64, progress: &AgentProgress) {
        if let Err(err) = self.persist(identity, progress) {
            eprintln!("failed to persist progress for {identity}: {err}");
        }
    }
}

/// One row of the spend leaderboard.
#[derive(Debug, Clone)]
pub struct AdvancedAgent {
    pub identity: u64,
    pub species: SpeciesKey,
    pub spent_points: f64,
    pub tier: u8,
}

/// Aggregated per-species economy figures.
#[derive(Debug, Clone)]
pub struct SpeciesSpend {
    pub species: SpeciesKey,
    pub agents: u64,
    pub total_spent: f64,
    pub total_earned: f64,
}

#[derive(Debug)]
enum ProgressCommand {
    Save(u64, AgentProgress),
    Flush,
    Shutdown,
}

/// Asynchronous wrapper that keeps database writes off the simulation
/// thread. Saves queue with a worker; reads lock the database directly, so
/// a load only sees saves the worker has already drained.
pub struct ProgressPipeline {
    tx: mpsc::Sender<ProgressCommand>,
    db: Arc<Mutex<ProgressDb>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressPipeline {
    /// Create an asynchronous pipeline over a database at the provided path.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_db(ProgressDb::open(path)?)
    }

    /// Wrap an already-opened database.
    pub fn from_db(db: ProgressDb) -> Result<Self, StorageError> {
        let shared = Arc::new(Mutex::new(db));
        let (tx, rx) = mpsc::channel::<ProgressCommand>();
        let worker_db = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("warchest-storage-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        ProgressCommand::Save(identity, progress) => match worker_db.lock() {
                            Ok(mut db) => {
                                if let Err(err) = db.persist(identity, &progress) {
                                    eprintln!(
                                        "failed to persist progress for {identity} asynchronously: {err}"
                                    );
                                }
                            }
                            Err(poisoned) => {
                                eprintln!("storage mutex poisoned while saving {identity}");
                                let mut db = poisoned.into_inner();
                                if let Err(err) = db.persist(identity, &progress) {
                                    eprintln!(
                                        "failed to persist progress for {identity} after poison: {err}"
                                    );
                                }
                            }
                        },
                        ProgressCommand::Flush => {
                            if let Ok(mut db) = worker_db.lock()
                                && let Err(err) = db.flush()
                            {
                                eprintln!("failed to flush progress rows: {err}");
                            }
                        }
                        ProgressCommand::Shutdown => {
                            if let Ok(mut db) = worker_db.lock() {
                                let _ = db.flush();
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            db: shared,
            handle: Some(handle),
        })
    }

    /// Exposes shared access to the underlying database for analytics
    /// queries.
    #[must_use]
    pub fn db(&self) -> Arc<Mutex<ProgressDb>> {
        Arc::clone(&self.db)
    }

    /// Request an immediate flush of buffered rows.
    pub fn flush(&self) {
        let _ = self.tx.send(ProgressCommand::Flush);
    }
}

impl ProgressStore for ProgressPipeline {
    fn load(&mut self, identity: u64) -> Option<AgentProgress> {
        let mut db = match self.db.lock() {
            Ok(db) => db,
            Err(poisoned) => poisoned.into_inner(),
        };
        match db.fetch(identity) {
            Ok(record) => record,
            Err(err) => {
                eprintln!("failed to load progress for {identity}: {err}");
                None
            }
        }
    }

    fn save(&mut self, identity: u64, progress: &AgentProgress) {
        if self
            .tx
            .send(ProgressCommand::Save(identity, progress.clone()))
            .is_err()
        {
            eprintln!("storage worker channel closed; progress for {identity} dropped");
        }
    }
}

impl Drop for ProgressPipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(ProgressCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            eprintln!("storage worker thread panicked: {err:?}");
        }
    }
}
