use chrono::Utc;
use rusqlite::Row;
use tracing::instrument;

use haven_core::ids::RuleId;
use haven_core::rules::{CameraRef, ExecuteInfo, TriggerFilter, TriggerRule};

use crate::database::Database;
use crate::error::StoreError;

/// CRUD surface for trigger rules. The scheduler keeps its own in-memory
/// copy; callers are responsible for the add/remove sync calls.
#[derive(Clone)]
pub struct RuleRepo {
    db: Database,
}

impl RuleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_rule(row: &Row<'_>) -> Result<TriggerRule, rusqlite::Error> {
        let cameras_raw: String = row.get(3)?;
        let execute_raw: String = row.get(5)?;
        let filter_raw: String = row.get(6)?;

        let cameras: Vec<CameraRef> = serde_json::from_str(&cameras_raw).unwrap_or_default();
        let execute_info: ExecuteInfo = serde_json::from_str(&execute_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        let filter: TriggerFilter = serde_json::from_str(&filter_raw).unwrap_or_default();

        Ok(TriggerRule {
            id: RuleId::from_raw(row.get::<_, String>(0)?),
            name: row.get(1)?,
            enabled: row.get::<_, i64>(2)? != 0,
            cameras,
            condition: row.get(4)?,
            execute_info,
            filter,
        })
    }

    const COLUMNS: &'static str = "id, name, enabled, cameras, condition, execute_info, filter";

    /// Load every rule at startup, enabled or not.
    #[instrument(skip(self))]
    pub fn load_all(&self) -> Result<Vec<TriggerRule>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM rules ORDER BY created_at",
                Self::COLUMNS
            ))?;
            let rows = stmt
                .query_map([], Self::row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self), fields(rule_id = %id))]
    pub fn get(&self, id: &RuleId) -> Result<TriggerRule, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM rules WHERE id = ?1", Self::COLUMNS),
                [id.as_str()],
                Self::row_to_rule,
            )
            .map_err(|_| StoreError::NotFound(format!("rule {id}")))
        })
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub fn create(&self, rule: &TriggerRule) -> Result<(), StoreError> {
        let cameras = serde_json::to_string(&rule.cameras)?;
        let execute_info = serde_json::to_string(&rule.execute_info)?;
        let filter = serde_json::to_string(&rule.filter)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rules (id, name, enabled, cameras, condition, execute_info, filter, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    rule.id.as_str(),
                    rule.name,
                    rule.enabled as i64,
                    cameras,
                    rule.condition,
                    execute_info,
                    filter,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub fn update(&self, rule: &TriggerRule) -> Result<(), StoreError> {
        let cameras = serde_json::to_string(&rule.cameras)?;
        let execute_info = serde_json::to_string(&rule.execute_info)?;
        let filter = serde_json::to_string(&rule.filter)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE rules SET name = ?2, enabled = ?3, cameras = ?4, condition = ?5,
                 execute_info = ?6, filter = ?7, updated_at = ?8 WHERE id = ?1",
                rusqlite::params![
                    rule.id.as_str(),
                    rule.name,
                    rule.enabled as i64,
                    cameras,
                    rule.condition,
                    execute_info,
                    filter,
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("rule {}", rule.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(rule_id = %id))]
    pub fn delete(&self, id: &RuleId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM rules WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("rule {id}")));
            }
            Ok(())
        })
    }
}
