use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::instrument;

use haven_core::ids::{RuleId, RuleLogId};
use haven_core::rules::{ConditionResult, ExecuteResult, TriggerRuleLog};

use crate::database::Database;
use crate::error::StoreError;

/// Append-mostly store for firing records. A row is written once at firing
/// time; dynamic executions update its execute_result exactly once more.
#[derive(Clone)]
pub struct RuleLogRepo {
    db: Database,
}

impl RuleLogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_log(row: &Row<'_>) -> Result<TriggerRuleLog, rusqlite::Error> {
        let fired_raw: String = row.get(3)?;
        let results_raw: String = row.get(4)?;
        let execute_raw: String = row.get(5)?;

        let fired_at = DateTime::parse_from_rfc3339(&fired_raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        let condition_results: Vec<ConditionResult> =
            serde_json::from_str(&results_raw).unwrap_or_default();
        let execute_result: ExecuteResult = serde_json::from_str(&execute_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;

        Ok(TriggerRuleLog {
            id: RuleLogId::from_raw(row.get::<_, String>(0)?),
            rule_id: RuleId::from_raw(row.get::<_, String>(1)?),
            rule_name: row.get(2)?,
            fired_at,
            condition_results,
            execute_result,
        })
    }

    const COLUMNS: &'static str =
        "id, rule_id, rule_name, fired_at, condition_results, execute_result";

    #[instrument(skip(self, log), fields(rule_id = %log.rule_id, log_id = %log.id))]
    pub fn append(&self, log: &TriggerRuleLog) -> Result<(), StoreError> {
        let condition_results = serde_json::to_string(&log.condition_results)?;
        let execute_result = serde_json::to_string(&log.execute_result)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rule_logs (id, rule_id, rule_name, fired_at, condition_results, execute_result, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    log.id.as_str(),
                    log.rule_id.as_str(),
                    log.rule_name,
                    log.fired_at.to_rfc3339(),
                    condition_results,
                    execute_result,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(log_id = %id))]
    pub fn get(&self, id: &RuleLogId) -> Result<TriggerRuleLog, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM rule_logs WHERE id = ?1", Self::COLUMNS),
                [id.as_str()],
                Self::row_to_log,
            )
            .map_err(|_| StoreError::NotFound(format!("rule log {id}")))
        })
    }

    /// The single post-write mutation: a dynamic execution recording its
    /// outcome.
    #[instrument(skip(self, result), fields(log_id = %id))]
    pub fn update_execute_result(
        &self,
        id: &RuleLogId,
        result: &ExecuteResult,
    ) -> Result<(), StoreError> {
        let execute_result = serde_json::to_string(result)?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE rule_logs SET execute_result = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), execute_result],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("rule log {id}")));
            }
            Ok(())
        })
    }

    /// Most recent firings, newest first.
    #[instrument(skip(self))]
    pub fn list_recent(&self, limit: u32) -> Result<Vec<TriggerRuleLog>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM rule_logs ORDER BY fired_at DESC LIMIT ?1",
                Self::COLUMNS
            ))?;
            let rows = stmt
                .query_map([limit], Self::row_to_log)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Retention: drop rows fired before the cutoff. Returns how many went.
    #[instrument(skip(self))]
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM rule_logs WHERE fired_at < ?1",
                [cutoff.to_rfc3339()],
            )?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::rules::{ActionOutcome, ConditionCode, ExecuteStatus};

    fn sample_log(rule_id: &RuleId) -> TriggerRuleLog {
        TriggerRuleLog {
            id: RuleLogId::new(),
            rule_id: rule_id.clone(),
            rule_name: "porch watch".into(),
            fired_at: Utc::now(),
            condition_results: vec![ConditionResult {
                camera_id: "cam_front".into(),
                channel: 0,
                code: ConditionCode::NewOccurrence,
                frame_paths: vec!["frames/ab/cd.jpg".into()],
            }],
            execute_result: ExecuteResult::pending(),
        }
    }

    fn repo() -> RuleLogRepo {
        RuleLogRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn append_and_get() {
        let repo = repo();
        let rule_id = RuleId::new();
        let log = sample_log(&rule_id);
        repo.append(&log).unwrap();

        let fetched = repo.get(&log.id).unwrap();
        assert_eq!(fetched.rule_id, rule_id);
        assert_eq!(fetched.condition_results.len(), 1);
        assert_eq!(
            fetched.condition_results[0].code,
            ConditionCode::NewOccurrence
        );
        assert_eq!(fetched.execute_result.status, ExecuteStatus::Pending);
    }

    #[test]
    fn update_execute_result_once() {
        let repo = repo();
        let log = sample_log(&RuleId::new());
        repo.append(&log).unwrap();

        let result = ExecuteResult {
            status: ExecuteStatus::Success,
            summary: Some("porch light on".into()),
            action_outcomes: vec![ActionOutcome {
                tool_source_id: "hue".into(),
                tool_name: "toggle".into(),
                success: true,
                output: "on".into(),
            }],
            transcript: vec![],
        };
        repo.update_execute_result(&log.id, &result).unwrap();

        let fetched = repo.get(&log.id).unwrap();
        assert_eq!(fetched.execute_result.status, ExecuteStatus::Success);
        assert_eq!(fetched.execute_result.summary.as_deref(), Some("porch light on"));
    }

    #[test]
    fn update_missing_is_not_found() {
        let repo = repo();
        let err = repo
            .update_execute_result(&RuleLogId::new(), &ExecuteResult::pending())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_recent_newest_first() {
        let repo = repo();
        let rule_id = RuleId::new();
        for i in 0..5 {
            let mut log = sample_log(&rule_id);
            log.fired_at = Utc::now() - chrono::Duration::minutes(10 - i);
            repo.append(&log).unwrap();
        }

        let recent = repo.list_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].fired_at >= recent[1].fired_at);
    }

    #[test]
    fn prune_before_removes_old_rows() {
        let repo = repo();
        let rule_id = RuleId::new();

        let mut old = sample_log(&rule_id);
        old.fired_at = Utc::now() - chrono::Duration::days(30);
        repo.append(&old).unwrap();

        let fresh = sample_log(&rule_id);
        repo.append(&fresh).unwrap();

        let removed = repo
            .prune_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get(&old.id).is_err());
        assert!(repo.get(&fresh.id).is_ok());
    }
}
