// ── MacroProgressContainer ──
//
// One logical operation fanned out over several devices (managed-set
// synchronization, firmware rollout). Each member keeps its own container;
// this type only groups them under a label.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use tracing::{info, warn};

use super::{ProgressContainer, ProgressSnapshot};
use crate::error::CoreError;

#[derive(Debug, Clone, Default)]
pub struct MacroProgressContainer {
    members: Vec<(String, ProgressContainer)>,
}

impl MacroProgressContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member container under `label` (typically a device serial).
    pub fn add(&mut self, label: impl Into<String>, progress: ProgressContainer) {
        self.members.push((label.into(), progress));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &ProgressContainer)> {
        self.members.iter().map(|(label, p)| (label.as_str(), p))
    }

    /// `true` once every member reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.members.iter().all(|(_, p)| p.is_terminal())
    }

    /// Members that ended in error, keyed by label.
    pub fn failed(&self) -> BTreeMap<String, CoreError> {
        self.members
            .iter()
            .filter_map(|(label, p)| p.error().map(|e| (label.clone(), e)))
            .collect()
    }

    /// Wait for every member and return their final snapshots in insertion order.
    pub async fn wait_for_end(&self) -> Vec<(String, ProgressSnapshot)> {
        let snapshots = join_all(self.members.iter().map(|(_, p)| p.wait_for_end())).await;
        self.members
            .iter()
            .map(|(label, _)| label.clone())
            .zip(snapshots)
            .collect()
    }

    /// Wait for every member, logging each outcome. Returns the failures.
    pub async fn trace_progress(&self, operation: &str) -> BTreeMap<String, CoreError> {
        for (label, snap) in self.wait_for_end().await {
            match snap.error {
                Some(e) => warn!(operation, member = %label, error = %e, "member failed"),
                None => info!(operation, member = %label, "member complete"),
            }
        }
        self.failed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::progress::TaskOutput;

    #[tokio::test]
    async fn failed_exposes_only_erroring_members() {
        let ok = ProgressContainer::new("A1");
        let bad = ProgressContainer::new("B2");
        let mut all = MacroProgressContainer::new();
        all.add("A1", ok.clone());
        all.add("B2", bad.clone());
        assert!(!all.is_complete());

        ok.set_complete_with(TaskOutput::Done);
        bad.set_error(CoreError::Busy {
            entity: "device B2".into(),
        });

        let failures = all.trace_progress("synchronize").await;
        assert!(all.is_complete());
        assert_eq!(failures.len(), 1);
        assert!(failures.contains_key("B2"));
    }

    #[tokio::test]
    async fn wait_for_end_keeps_member_order() {
        let mut all = MacroProgressContainer::new();
        for serial in ["C3", "A1", "B2"] {
            let p = ProgressContainer::new(serial);
            p.set_complete();
            all.add(serial, p);
        }
        let labels: Vec<_> = all.wait_for_end().await.into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels, ["C3", "A1", "B2"]);
    }

    #[tokio::test]
    async fn empty_aggregate_is_complete() {
        let all = MacroProgressContainer::new();
        assert!(all.is_complete());
        assert!(all.wait_for_end().await.is_empty());
    }
}
