//! Event log implementations
//!
//! The backtest default keeps everything in memory and hands the full
//! history to the metrics engine at the end of the run. The sqlite variant
//! persists events and the machine state to disk with the same semantics,
//! for runs whose output should survive the process.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::BacktestError;
use crate::ports::{AlgoState, EventFilter, EventLogPort};
use crate::types::{AlgoEvent, SwapEvent};

/// In-memory append-only event log.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    algo_events: Vec<AlgoEvent>,
    swap_events: Vec<SwapEvent>,
    state: Option<AlgoState>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogPort for MemoryEventLog {
    async fn log_algo_event(&mut self, event: AlgoEvent) -> Result<(), BacktestError> {
        self.algo_events.push(event);
        Ok(())
    }

    async fn log_swap_event(&mut self, swap: SwapEvent) -> Result<(), BacktestError> {
        self.swap_events.push(swap);
        Ok(())
    }

    async fn get_algo_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<AlgoEvent>, BacktestError> {
        let mut out: Vec<AlgoEvent> = self
            .algo_events
            .iter()
            .filter(|e| {
                filter.matches(e.timestamp(), e.bar_index()) && filter.matches_type(e.event_type())
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get_swap_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<SwapEvent>, BacktestError> {
        let mut out: Vec<SwapEvent> = self
            .swap_events
            .iter()
            .filter(|s| filter.matches(s.timestamp, s.bar_index))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn save_state(&mut self, state: &AlgoState) -> Result<(), BacktestError> {
        self.state = Some(state.clone());
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<AlgoState>, BacktestError> {
        Ok(self.state.clone())
    }
}

/// Sqlite-backed event log with the same append-only semantics.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BacktestError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS algo_events (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp  INTEGER NOT NULL,
                 bar_index  INTEGER NOT NULL,
                 payload    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS swap_events (
                 id         INTEGER PRIMARY KEY,
                 timestamp  INTEGER NOT NULL,
                 bar_index  INTEGER NOT NULL,
                 payload    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS algo_state (
                 id       INTEGER PRIMARY KEY CHECK (id = 1),
                 payload  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_algo_events_ts ON algo_events (timestamp);
             CREATE INDEX IF NOT EXISTS idx_swap_events_ts ON swap_events (timestamp);",
        )?;
        Ok(SqliteEventLog {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl EventLogPort for SqliteEventLog {
    async fn log_algo_event(&mut self, event: AlgoEvent) -> Result<(), BacktestError> {
        let payload = serde_json::to_string(&event)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO algo_events (timestamp, bar_index, payload) VALUES (?1, ?2, ?3)",
            params![event.timestamp(), event.bar_index() as i64, payload],
        )?;
        Ok(())
    }

    async fn log_swap_event(&mut self, swap: SwapEvent) -> Result<(), BacktestError> {
        let payload = serde_json::to_string(&swap)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO swap_events (id, timestamp, bar_index, payload) VALUES (?1, ?2, ?3, ?4)",
            params![swap.id as i64, swap.timestamp, swap.bar_index as i64, payload],
        )?;
        Ok(())
    }

    async fn get_algo_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<AlgoEvent>, BacktestError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM algo_events ORDER BY id")?;
        let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for payload in rows {
            let event: AlgoEvent = serde_json::from_str(&payload?)?;
            if filter.matches(event.timestamp(), event.bar_index())
                && filter.matches_type(event.event_type())
            {
                out.push(event);
            }
            if filter.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }

    async fn get_swap_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<SwapEvent>, BacktestError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM swap_events ORDER BY id")?;
        let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for payload in rows {
            let swap: SwapEvent = serde_json::from_str(&payload?)?;
            if filter.matches(swap.timestamp, swap.bar_index) {
                out.push(swap);
            }
            if filter.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }

    async fn save_state(&mut self, state: &AlgoState) -> Result<(), BacktestError> {
        let payload = serde_json::to_string(state)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO algo_state (id, payload) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
            params![payload],
        )?;
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<AlgoState>, BacktestError> {
        let payload: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT payload FROM algo_state WHERE id = 1", params![], |row| {
                row.get(0)
            })
            .optional()?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}
