#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use vt_core::GuardKind;

/// How a value ended up represented in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapDecision {
    /// Baked in as a compile-time constant.
    Specialized,
    /// Fresh runtime input of the compiled artifact.
    GraphInput,
    /// Registered as a named sub-component.
    SubComponent,
    /// Numeric input left unspecialized.
    Unspecialized,
    /// Container whose children were wrapped individually.
    Container,
    /// Opaque handle; not traced through.
    Opaque,
    /// Returned the variable already tracked for this identity.
    Aliased,
    /// Result of a traced operation.
    Materialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    /// Source name, or the node name for materialized results.
    pub source: String,
    pub rule: String,
    pub decision: WrapDecision,
    pub guard_kinds: Vec<GuardKind>,
    pub timestamp_unix_ms: u128,
}

impl DecisionRecord {
    #[must_use]
    pub fn new(
        decision_id: String,
        source: impl Into<String>,
        rule: impl Into<String>,
        decision: WrapDecision,
        guard_kinds: Vec<GuardKind>,
    ) -> Self {
        Self {
            decision_id,
            source: source.into(),
            rule: rule.into(),
            decision,
            guard_kinds,
            timestamp_unix_ms: now_unix_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLedger {
    entries: Vec<DecisionRecord>,
}

impl DecisionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Identifier for the next record, `d{n}`.
    #[must_use]
    pub fn next_id(&self) -> String {
        format!("d{}", self.entries.len())
    }

    pub fn record(
        &mut self,
        source: impl Into<String>,
        rule: impl Into<String>,
        decision: WrapDecision,
        guard_kinds: Vec<GuardKind>,
    ) {
        let id = self.next_id();
        self.entries
            .push(DecisionRecord::new(id, source, rule, decision, guard_kinds));
    }

    pub fn append(&mut self, entry: DecisionRecord) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[DecisionRecord] {
        &self.entries
    }

    /// Records for one source name, in insertion order.
    pub fn for_source<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a DecisionRecord> {
        self.entries
            .iter()
            .filter(move |entry| entry.source == source)
    }

    #[must_use]
    pub fn count(&self, decision: WrapDecision) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.decision == decision)
            .count()
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use super::{DecisionLedger, WrapDecision};
    use vt_core::GuardKind;

    #[test]
    fn records_get_sequential_ids_and_timestamps() {
        let mut ledger = DecisionLedger::new();
        assert!(ledger.is_empty());
        ledger.record(
            "L['x']",
            "sequence",
            WrapDecision::Container,
            vec![GuardKind::EqualsMatch],
        );
        ledger.record("L['x'][0]", "literal", WrapDecision::Specialized, vec![]);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[1].decision_id, "d1");
        assert!(ledger.entries()[0].timestamp_unix_ms > 0);
        assert_eq!(ledger.count(WrapDecision::Specialized), 1);
        assert_eq!(ledger.for_source("L['x']").count(), 1);
    }

    #[test]
    fn ledger_serializes_as_json() {
        let mut ledger = DecisionLedger::new();
        ledger.record("G['w']", "tensor", WrapDecision::GraphInput, vec![GuardKind::TensorMatch]);
        let encoded = serde_json::to_string(&ledger).expect("serialize");
        assert!(encoded.contains("\"graph_input\""));
        assert!(encoded.contains("\"tensor_match\""));
        let decoded: DecisionLedger = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded.entries()[0].rule, "tensor");
    }
}
