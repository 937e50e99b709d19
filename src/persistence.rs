//! Durable storage for pattern records and test run history.
//!
//! The analysis path never touches the database. Stores push `HistoryEvent`s
//! into an unbounded channel; a background task buffers them and flushes to
//! SQLite on an interval. A failed flush keeps the buffer for the next
//! attempt and flips the shared health flag, which the stores read to decide
//! whether history can be trusted. Buffered runs and stored runs are both
//! bounded: the buffer drops its oldest runs when full, and each flush keeps
//! only the newest `run_window` rows per test.

use crate::error::PersistenceError;
use crate::flaky::{RunEntry, RunStatus};
use crate::history::{PatternRecord, ResolutionStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

/// Runs kept per test when none is configured.
pub const DEFAULT_RUN_WINDOW: usize = 20;

/// Runs held in memory while the database is unreachable.
pub const MAX_BUFFERED_RUNS: usize = 10_000;

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Pattern(PatternRecord),
    Run { test_name: String, entry: RunEntry },
}

/// Cloneable handle the stores write through.
#[derive(Clone)]
pub struct PersistenceSink {
    sender: mpsc::UnboundedSender<HistoryEvent>,
    health: Arc<AtomicBool>,
}

impl PersistenceSink {
    pub fn new(sender: mpsc::UnboundedSender<HistoryEvent>, health: Arc<AtomicBool>) -> Self {
        Self { sender, health }
    }

    pub fn submit(&self, event: HistoryEvent) {
        if let Err(e) = self.sender.send(event) {
            if self.health.swap(false, Ordering::SeqCst) {
                log::warn!("Failed to queue history event: {e}");
            }
        }
    }

    pub fn health(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.health)
    }

    pub fn is_available(&self) -> bool {
        self.health.load(Ordering::SeqCst)
    }
}

pub struct HistoryDatabase {
    conn: Connection,
    run_window: usize,
}

impl HistoryDatabase {
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn,
            run_window: DEFAULT_RUN_WINDOW,
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn,
            run_window: DEFAULT_RUN_WINDOW,
        })
    }

    /// Runs retained per test on flush.
    pub fn with_run_window(mut self, window: usize) -> Self {
        self.run_window = window.max(1);
        self
    }

    fn init(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pattern_records (
                pattern_hash TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL DEFAULT 0,
                test_names TEXT NOT NULL,
                resolution_status TEXT NOT NULL,
                occurrences TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS test_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL,
                pattern_hash TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_test_runs_name ON test_runs (test_name, id)",
            [],
        )?;
        Ok(())
    }

    pub fn load_patterns(&self) -> Result<Vec<PatternRecord>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_hash, summary, first_seen, last_seen, occurrence_count,
                    test_names, resolution_status, occurrences
             FROM pattern_records ORDER BY pattern_hash",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (hash, summary, first_seen, last_seen, count, names, status, occurrences) in rows {
            let test_names: BTreeSet<String> =
                serde_json::from_str(&names).map_err(|e| corrupt("pattern_records", e))?;
            let occurrences: VecDeque<DateTime<Utc>> =
                serde_json::from_str(&occurrences).map_err(|e| corrupt("pattern_records", e))?;
            let resolution_status = ResolutionStatus::parse(&status)
                .ok_or_else(|| corrupt("pattern_records", format!("unknown status {status}")))?;
            records.push(PatternRecord {
                pattern_hash: hash,
                summary,
                first_seen: parse_time("pattern_records", &first_seen)?,
                last_seen: parse_time("pattern_records", &last_seen)?,
                occurrence_count: u64::try_from(count).unwrap_or(0),
                test_names,
                resolution_status,
                occurrences,
            });
        }
        Ok(records)
    }

    /// The most recent `window` runs per test, oldest first.
    pub fn load_runs(&self, window: usize) -> Result<HashMap<String, Vec<RunEntry>>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT test_name, timestamp, status, pattern_hash FROM (
                SELECT id, test_name, timestamp, status, pattern_hash,
                       ROW_NUMBER() OVER (PARTITION BY test_name ORDER BY id DESC) AS recent
                FROM test_runs
             )
             WHERE recent <= ?
             ORDER BY test_name, id",
        )?;
        let rows = stmt
            .query_map(params![sql_limit(window)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut runs: HashMap<String, Vec<RunEntry>> = HashMap::new();
        for (test_name, timestamp, status, pattern_hash) in rows {
            let status = RunStatus::parse(&status)
                .ok_or_else(|| corrupt("test_runs", format!("unknown status {status}")))?;
            runs.entry(test_name).or_default().push(RunEntry {
                timestamp: parse_time("test_runs", &timestamp)?,
                status,
                pattern_hash,
            });
        }
        Ok(runs)
    }

    pub fn flush(
        &mut self,
        patterns: &HashMap<String, PatternRecord>,
        runs: &[(String, RunEntry)],
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;

        for record in patterns.values() {
            let test_names = serde_json::to_string(&record.test_names)
                .map_err(|e| corrupt("pattern_records", e))?;
            let occurrences = serde_json::to_string(&record.occurrences)
                .map_err(|e| corrupt("pattern_records", e))?;
            tx.execute(
                "INSERT OR REPLACE INTO pattern_records
                 (pattern_hash, summary, first_seen, last_seen, occurrence_count,
                  test_names, resolution_status, occurrences)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.pattern_hash,
                    record.summary,
                    record.first_seen.to_rfc3339(),
                    record.last_seen.to_rfc3339(),
                    i64::try_from(record.occurrence_count).unwrap_or(i64::MAX),
                    test_names,
                    record.resolution_status.as_str(),
                    occurrences,
                ],
            )?;
        }

        for (test_name, entry) in runs {
            tx.execute(
                "INSERT INTO test_runs (test_name, timestamp, status, pattern_hash)
                 VALUES (?, ?, ?, ?)",
                params![
                    test_name,
                    entry.timestamp.to_rfc3339(),
                    entry.status.as_str(),
                    entry.pattern_hash,
                ],
            )?;
        }

        let touched: BTreeSet<&str> = runs.iter().map(|(test_name, _)| test_name.as_str()).collect();
        for test_name in touched {
            tx.execute(
                "DELETE FROM test_runs WHERE test_name = ?1 AND id NOT IN (
                     SELECT id FROM test_runs WHERE test_name = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![test_name, sql_limit(self.run_window)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn sql_limit(window: usize) -> i64 {
    i64::try_from(window).unwrap_or(i64::MAX)
}

fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Corrupt {
        table,
        reason: reason.to_string(),
    }
}

fn parse_time(table: &'static str, value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("bad timestamp {value}: {e}")))
}

struct Buffer {
    patterns: HashMap<String, PatternRecord>,
    runs: VecDeque<(String, RunEntry)>,
    max_runs: usize,
    dropped_runs: usize,
}

impl Buffer {
    fn new(max_runs: usize) -> Self {
        Self {
            patterns: HashMap::new(),
            runs: VecDeque::new(),
            max_runs: max_runs.max(1),
            dropped_runs: 0,
        }
    }

    fn push(&mut self, event: HistoryEvent) {
        match event {
            HistoryEvent::Pattern(record) => {
                self.patterns.insert(record.pattern_hash.clone(), record);
            }
            HistoryEvent::Run { test_name, entry } => {
                if self.runs.len() >= self.max_runs {
                    self.runs.pop_front();
                    if self.dropped_runs == 0 {
                        log::warn!(
                            "History buffer holds {} runs, dropping the oldest until the store is reachable",
                            self.max_runs
                        );
                    }
                    self.dropped_runs += 1;
                }
                self.runs.push_back((test_name, entry));
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.runs.is_empty()
    }

    fn clear(&mut self) {
        self.patterns.clear();
        self.runs.clear();
        self.dropped_runs = 0;
    }
}

/// Background task draining history events into the database.
pub struct PersistenceWriter {
    sink: PersistenceSink,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl PersistenceWriter {
    /// Must be called from within a tokio runtime.
    pub fn spawn(database: HistoryDatabase, flush_interval_seconds: u64) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let health = Arc::new(AtomicBool::new(true));
        let sink = PersistenceSink::new(sender, Arc::clone(&health));

        let handle = tokio::spawn(Self::writer_loop(
            database,
            receiver,
            shutdown_rx,
            health,
            flush_interval_seconds.max(1),
        ));

        Self {
            sink,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn sink(&self) -> PersistenceSink {
        self.sink.clone()
    }

    /// Flush whatever is buffered and stop the task.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.handle.await {
            log::error!("History writer task failed: {e}");
        }
    }

    async fn writer_loop(
        mut database: HistoryDatabase,
        mut receiver: mpsc::UnboundedReceiver<HistoryEvent>,
        mut shutdown: oneshot::Receiver<()>,
        health: Arc<AtomicBool>,
        flush_interval_seconds: u64,
    ) {
        let mut buffer = Buffer::new(MAX_BUFFERED_RUNS);
        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds));

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => buffer.push(event),
                        None => break,
                    }
                }
                _ = flush_timer.tick() => {
                    Self::flush(&mut database, &mut buffer, &health);
                }
                _ = &mut shutdown => break,
            }
        }

        while let Ok(event) = receiver.try_recv() {
            buffer.push(event);
        }
        Self::flush(&mut database, &mut buffer, &health);
        log::debug!("History writer stopped");
    }

    fn flush(database: &mut HistoryDatabase, buffer: &mut Buffer, health: &AtomicBool) {
        if buffer.is_empty() {
            return;
        }
        match database.flush(&buffer.patterns, buffer.runs.make_contiguous()) {
            Ok(()) => {
                log::debug!(
                    "Flushed {} pattern records and {} runs",
                    buffer.patterns.len(),
                    buffer.runs.len()
                );
                if buffer.dropped_runs > 0 {
                    log::warn!(
                        "{} runs were dropped while the history store was unreachable",
                        buffer.dropped_runs
                    );
                }
                buffer.clear();
                if !health.swap(true, Ordering::SeqCst) {
                    log::info!("History store reachable again");
                }
            }
            Err(e) => {
                log::error!("Failed to flush history: {e}");
                health.store(false, Ordering::SeqCst);
            }
        }
    }
}
