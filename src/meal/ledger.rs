use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::update::SessionId;

/// A settled meal, ready to be written to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct MealRecord {
    pub session: SessionId,
    pub meal_date: DateTime<Local>,
    pub purchaser: String,
    pub total_bill: f64,
    pub participants: Vec<String>,
    pub individual_share: f64,
}

/// SQLite-backed history of settled meals
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create the ledger database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger: {}", path.display()))?;

        // journal_mode PRAGMA returns the resulting mode
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Meal ledger initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meal_costs (
                id TEXT PRIMARY KEY,
                session TEXT NOT NULL,
                meal_date TEXT NOT NULL,
                purchaser TEXT NOT NULL,
                total_bill REAL NOT NULL,
                participants TEXT NOT NULL,
                individual_share REAL NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_meal_costs_session
                ON meal_costs(session, recorded_at);
            ",
        )
        .context("Failed to run ledger migrations")?;
        Ok(())
    }

    /// Append a settled meal. Returns the new row id.
    pub async fn record(&self, meal: &MealRecord) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let meal_date = meal.meal_date.format("%Y-%m-%d %H:%M:%S").to_string();
        let participants = meal.participants.join(", ");

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO meal_costs
                (id, session, meal_date, purchaser, total_bill, participants, individual_share)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                &id,
                meal.session.as_str(),
                &meal_date,
                &meal.purchaser,
                meal.total_bill,
                &participants,
                meal.individual_share,
            ],
        )
        .context("Failed to record meal")?;

        debug!(
            "Recorded meal {} for session {} ({} participants)",
            id,
            meal.session,
            meal.participants.len()
        );
        Ok(id)
    }

    /// Number of meals recorded for a session
    pub async fn count(&self, session: &SessionId) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM meal_costs WHERE session = ?1",
            rusqlite::params![session.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    #[cfg(test)]
    async fn lookup(&self, id: &str) -> Result<(String, f64, String, f64)> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT purchaser, total_bill, participants, individual_share
             FROM meal_costs WHERE id = ?1",
            rusqlite::params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(row)
    }
}
