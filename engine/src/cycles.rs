// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The cycle reporter (C6, §4.6): formats a detected cycle's participants using a per-key-family
//! heuristic, and remembers which cycles it has already reported (canonicalized by rotation to
//! their lexicographically-minimal participant) so that the same cycle surfaced from multiple
//! entry points in one build is only logged once.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::key::NodeKey;

/// The participants of one dependency cycle, in discovery order (`k -> ... -> d -> k`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleInfo {
    pub participants: Vec<NodeKey>,
}

impl CycleInfo {
    pub fn new(participants: Vec<NodeKey>) -> Self {
        CycleInfo { participants }
    }

    /// Rotates the participant list so that its lexicographically-smallest (by `Display`) member
    /// comes first, giving two reports of the same cycle (discovered starting from different
    /// participants) an identical canonical form.
    pub fn canonical(&self) -> Vec<String> {
        let rendered: Vec<String> = self.participants.iter().map(|n| n.to_string()).collect();
        if rendered.is_empty() {
            return rendered;
        }
        let min_index = rendered
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        rendered[min_index..]
            .iter()
            .chain(rendered[..min_index].iter())
            .cloned()
            .collect()
    }

    fn family_formatter(&self) -> &'static str {
        match self.participants.first() {
            Some(NodeKey::ConfiguredTarget { .. }) => "configured targets",
            Some(NodeKey::Package(_)) => "packages",
            Some(NodeKey::ActionExecution(_)) => "actions",
            Some(NodeKey::DirectoryListing(_)) | Some(NodeKey::FileState(_)) => "filesystem",
            Some(NodeKey::BuildVariable(_)) => "build variables",
            None => "unknown",
        }
    }

    /// Renders the cycle as a human-readable diagnostic, choosing phrasing appropriate to the
    /// family of its participants (a cycle among `ConfiguredTarget`s reads as a dependency cycle
    /// between targets; one among `FileState`/`DirectoryListing` reads as a symlink loop).
    pub fn format(&self, requested: &NodeKey) -> String {
        let chain = self
            .canonical()
            .join("\n  -> ");
        match self.family_formatter() {
            "configured targets" => format!(
                "Dependency cycle detected among targets while evaluating {requested}:\n  {chain}"
            ),
            "packages" => format!(
                "Cycle detected among packages while evaluating {requested}:\n  {chain}"
            ),
            "actions" => format!(
                "Cycle detected among action executions while evaluating {requested}:\n  {chain}"
            ),
            "filesystem" => format!(
                "Filesystem cycle (likely a symlink loop) detected while evaluating {requested}:\n  {chain}"
            ),
            _ => format!("Dependency cycle detected while evaluating {requested}:\n  {chain}"),
        }
    }
}

/// Deduplicates cycles across a single build and formats each exactly once.
#[derive(Default)]
pub struct CycleReporter {
    reported: Mutex<HashSet<Vec<String>>>,
}

impl CycleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `cycle` against `requested` if it hasn't already been reported this build, returning
    /// the formatted diagnostic on first report and `None` on a duplicate.
    pub fn report(&self, requested: &NodeKey, cycle: &CycleInfo) -> Option<String> {
        let canonical = cycle.canonical();
        let mut reported = self.reported.lock();
        if reported.contains(&canonical) {
            return None;
        }
        reported.insert(canonical);
        Some(cycle.format(requested))
    }

    pub fn reset(&self) {
        self.reported.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_rotation_invariant() {
        let a = CycleInfo::new(vec![
            NodeKey::Package("a".to_string()),
            NodeKey::Package("b".to_string()),
            NodeKey::Package("c".to_string()),
        ]);
        let b = CycleInfo::new(vec![
            NodeKey::Package("b".to_string()),
            NodeKey::Package("c".to_string()),
            NodeKey::Package("a".to_string()),
        ]);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn reporter_deduplicates_rotations() {
        let reporter = CycleReporter::new();
        let requested = NodeKey::Package("a".to_string());
        let a = CycleInfo::new(vec![
            NodeKey::Package("a".to_string()),
            NodeKey::Package("b".to_string()),
        ]);
        let b = CycleInfo::new(vec![
            NodeKey::Package("b".to_string()),
            NodeKey::Package("a".to_string()),
        ]);

        assert!(reporter.report(&requested, &a).is_some());
        assert!(reporter.report(&requested, &b).is_none());
    }
}
