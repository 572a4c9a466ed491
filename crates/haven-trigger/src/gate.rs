use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use haven_core::ids::RuleId;

/// Ring capacity for per-rule firing history. Enough for any sane frequency
/// window; the oldest entries fall off first.
const FIRING_HISTORY_CAP: usize = 32;

/// A busy flag older than this is treated as leaked (a lost evaluation task)
/// and may be re-acquired.
const BUSY_STALE_SECS: i64 = 300;

#[derive(Debug, Default)]
struct RuleGate {
    busy: bool,
    busy_since: Option<DateTime<Utc>>,
    firings: VecDeque<DateTime<Utc>>,
}

/// Per-rule single-flight gates plus bounded firing history.
///
/// Check-and-set happens under one lock with no await between, so one tick's
/// decision can never interleave with another's for the same rule.
#[derive(Default)]
pub struct GateRegistry {
    gates: Mutex<HashMap<RuleId, RuleGate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the rule for one evaluation round. Returns false while a
    /// previous round is still in flight.
    pub fn try_acquire(&self, rule_id: &RuleId, now: DateTime<Utc>) -> bool {
        let mut gates = self.gates.lock();
        let gate = gates.entry(rule_id.clone()).or_default();

        if gate.busy {
            let stale = gate
                .busy_since
                .map(|since| now - since > Duration::seconds(BUSY_STALE_SECS))
                .unwrap_or(true);
            if !stale {
                return false;
            }
            warn!(rule_id = %rule_id, "reclaiming stale rule gate");
        }

        gate.busy = true;
        gate.busy_since = Some(now);
        true
    }

    pub fn release(&self, rule_id: &RuleId) {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get_mut(rule_id) {
            gate.busy = false;
            gate.busy_since = None;
        }
    }

    /// Record an actual firing into the bounded ring.
    pub fn record_firing(&self, rule_id: &RuleId, at: DateTime<Utc>) {
        let mut gates = self.gates.lock();
        let gate = gates.entry(rule_id.clone()).or_default();
        if gate.firings.len() == FIRING_HISTORY_CAP {
            gate.firings.pop_front();
        }
        gate.firings.push_back(at);
    }

    /// Firing timestamps, oldest first.
    pub fn firings(&self, rule_id: &RuleId) -> Vec<DateTime<Utc>> {
        self.gates
            .lock()
            .get(rule_id)
            .map(|g| g.firings.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn last_firing(&self, rule_id: &RuleId) -> Option<DateTime<Utc>> {
        self.gates
            .lock()
            .get(rule_id)
            .and_then(|g| g.firings.back().copied())
    }

    /// Drop all state for a removed rule.
    pub fn remove(&self, rule_id: &RuleId) {
        self.gates.lock().remove(rule_id);
    }
}

/// Debounce state: per (rule, camera, channel), the content key of the last
/// frame sequence that updated it. Distinguishes "new occurrence" from "still
/// the same occurrence" across ticks.
#[derive(Default)]
pub struct MotionMemory {
    entries: Mutex<HashMap<(RuleId, String, u32), String>>,
}

impl MotionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, rule_id: &RuleId, camera_id: &str, channel: u32, key: String) {
        self.entries
            .lock()
            .insert((rule_id.clone(), camera_id.to_string(), channel), key);
    }

    pub fn last(&self, rule_id: &RuleId, camera_id: &str, channel: u32) -> Option<String> {
        self.entries
            .lock()
            .get(&(rule_id.clone(), camera_id.to_string(), channel))
            .cloned()
    }

    pub fn forget_rule(&self, rule_id: &RuleId) {
        self.entries.lock().retain(|(id, _, _), _| id != rule_id);
    }
}
