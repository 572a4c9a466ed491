use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule;
use tracing::warn;

use haven_core::rules::TriggerRule;

/// Unconditional floor between two actual firings of one rule, layered under
/// whatever frequency/interval the rule configures.
pub const MIN_FIRE_COOLDOWN_SECS: i64 = 60;

/// Cheap admission check run before any frame fetch or LLM cost.
/// `firings` is the rule's bounded history, oldest first.
pub fn pre_filter(rule: &TriggerRule, firings: &[DateTime<Utc>], now: DateTime<Utc>) -> bool {
    if !rule.enabled {
        return false;
    }

    if let Some(expr) = &rule.filter.cron_period {
        match Schedule::from_str(expr) {
            Ok(schedule) => {
                if !minute_matches(&schedule, now) {
                    return false;
                }
            }
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "invalid cron period, rejecting rule");
                return false;
            }
        }
    }

    if let Some(interval) = rule.filter.interval_secs {
        if let Some(last) = firings.last() {
            if now - *last < Duration::seconds(interval as i64) {
                return false;
            }
        }
    }

    if let Some(freq) = rule.filter.frequency {
        let window_start = now - Duration::seconds(freq.window_secs as i64);
        let recent = firings.iter().filter(|t| **t > window_start).count();
        if recent >= freq.count as usize {
            return false;
        }
    }

    true
}

/// Whether the current minute falls inside the cron period.
fn minute_matches(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    schedule.includes(minute)
}

/// Final admission check at firing time, independent of configured filters.
pub fn post_filter(last_firing: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_firing {
        None => true,
        Some(last) => now - last >= Duration::seconds(MIN_FIRE_COOLDOWN_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::ids::RuleId;
    use haven_core::rules::{ExecuteInfo, ExecuteMode, FrequencyFilter, TriggerFilter};

    fn rule(filter: TriggerFilter) -> TriggerRule {
        TriggerRule {
            id: RuleId::new(),
            name: "test".into(),
            enabled: true,
            cameras: vec![],
            condition: "anything".into(),
            execute_info: ExecuteInfo {
                mode: ExecuteMode::Static,
                actions: vec![],
                action_descriptions: vec![],
                tool_source_ids: vec![],
                notification: None,
            },
            filter,
        }
    }

    #[test]
    fn disabled_rule_rejected() {
        let mut r = rule(TriggerFilter::default());
        r.enabled = false;
        assert!(!pre_filter(&r, &[], Utc::now()));
    }

    #[test]
    fn no_filters_admits() {
        assert!(pre_filter(&rule(TriggerFilter::default()), &[], Utc::now()));
    }

    #[test]
    fn frequency_window_rejects_until_elapsed() {
        let r = rule(TriggerFilter {
            frequency: Some(FrequencyFilter {
                count: 1,
                window_secs: 60,
            }),
            ..Default::default()
        });
        let t0 = Utc::now();
        let fired = vec![t0];

        // Any check before t0+60s is rejected, even under continuous motion.
        assert!(!pre_filter(&r, &fired, t0 + Duration::seconds(1)));
        assert!(!pre_filter(&r, &fired, t0 + Duration::seconds(59)));
        assert!(pre_filter(&r, &fired, t0 + Duration::seconds(61)));
    }

    #[test]
    fn interval_measures_from_last_firing() {
        let r = rule(TriggerFilter {
            interval_secs: Some(300),
            ..Default::default()
        });
        let t0 = Utc::now();
        let fired = vec![t0 - Duration::seconds(600), t0];

        assert!(!pre_filter(&r, &fired, t0 + Duration::seconds(299)));
        assert!(pre_filter(&r, &fired, t0 + Duration::seconds(300)));
    }

    #[test]
    fn cron_period_gates_by_minute() {
        // Fires only at minute 30 of any hour.
        let r = rule(TriggerFilter {
            cron_period: Some("0 30 * * * *".into()),
            ..Default::default()
        });
        let at_30 = Utc::now()
            .with_minute(30)
            .and_then(|t| t.with_second(10))
            .unwrap();
        let at_31 = at_30.with_minute(31).unwrap();

        assert!(pre_filter(&r, &[], at_30));
        assert!(!pre_filter(&r, &[], at_31));
    }

    #[test]
    fn invalid_cron_rejects() {
        let r = rule(TriggerFilter {
            cron_period: Some("not a cron".into()),
            ..Default::default()
        });
        assert!(!pre_filter(&r, &[], Utc::now()));
    }

    #[test]
    fn cooldown_floor() {
        let t0 = Utc::now();
        assert!(post_filter(None, t0));
        assert!(!post_filter(Some(t0), t0 + Duration::seconds(30)));
        assert!(post_filter(Some(t0), t0 + Duration::seconds(60)));
    }
}
