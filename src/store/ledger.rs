use std::collections::HashMap;

use crate::models::ValidationVerdict;

/// Verdicts already persisted when a run starts. Read once, before any
/// worker launches.
#[derive(Debug, Clone, Default)]
pub struct ResumeLedger {
    verdicts: HashMap<String, ValidationVerdict>,
}

impl ResumeLedger {
    pub fn new(verdicts: HashMap<String, ValidationVerdict>) -> Self {
        Self { verdicts }
    }

    /// True when the id already has a verdict that a resumed run must not redo.
    pub fn is_decided(&self, vulnerability_id: &str) -> bool {
        self.verdicts
            .get(vulnerability_id)
            .is_some_and(ValidationVerdict::is_decided)
    }

    pub fn get(&self, vulnerability_id: &str) -> Option<&ValidationVerdict> {
        self.verdicts.get(vulnerability_id)
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn decided_count(&self) -> usize {
        self.verdicts.values().filter(|v| v.is_decided()).count()
    }

    /// All verdicts sorted by id.
    pub fn sorted(&self) -> Vec<&ValidationVerdict> {
        let mut all: Vec<&ValidationVerdict> = self.verdicts.values().collect();
        all.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));
        all
    }

    pub fn into_sorted(self) -> Vec<ValidationVerdict> {
        let mut all: Vec<ValidationVerdict> = self.verdicts.into_values().collect();
        all.sort_by(|a, b| a.vulnerability_id.cmp(&b.vulnerability_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerdictStatus;

    fn ledger() -> ResumeLedger {
        let mut map = HashMap::new();
        for (id, status) in [
            ("CVE-3", VerdictStatus::Timeout),
            ("CVE-1", VerdictStatus::Resolved),
            ("CVE-2", VerdictStatus::Error),
            ("CVE-4", VerdictStatus::PatchApplyFailed),
        ] {
            map.insert(id.to_string(), ValidationVerdict::new(id, status));
        }
        ResumeLedger::new(map)
    }

    #[test]
    fn test_error_verdicts_stay_eligible() {
        let ledger = ledger();
        assert!(ledger.is_decided("CVE-1"));
        assert!(!ledger.is_decided("CVE-2"));
        assert!(ledger.is_decided("CVE-3"));
        assert!(ledger.is_decided("CVE-4"));
        assert!(!ledger.is_decided("CVE-5"));
        assert_eq!(ledger.decided_count(), 3);
    }

    #[test]
    fn test_terminal_error_is_decided() {
        let mut map = HashMap::new();
        let mut gone = ValidationVerdict::new("CVE-9", VerdictStatus::Error);
        gone.terminal = true;
        map.insert("CVE-9".to_string(), gone);
        let ledger = ResumeLedger::new(map);
        assert!(ledger.is_decided("CVE-9"));
        assert_eq!(ledger.decided_count(), 1);
    }

    #[test]
    fn test_sorted_by_id() {
        let ids: Vec<String> = ledger().into_sorted().into_iter().map(|v| v.vulnerability_id).collect();
        assert_eq!(ids, vec!["CVE-1", "CVE-2", "CVE-3", "CVE-4"]);
    }
}
