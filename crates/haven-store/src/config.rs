use chrono::Utc;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// String key-value configuration (LLM endpoint, model names, thresholds).
#[derive(Clone)]
pub struct ConfigRepo {
    db: Database,
}

impl ConfigRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .ok();
            Ok(value)
        })
    }

    #[instrument(skip(self, value))]
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                rusqlite::params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}
