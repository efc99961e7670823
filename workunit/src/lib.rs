// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Minimal run-identity and metrics types shared between the evaluator and the façade.
//!
//! The upstream `workunit_store` crate this is trimmed from also carries a full span/trace tree
//! for the console UI; that UI layer is out of scope here; only `RunId` (needed by the evaluator
//! to distinguish "uncacheable" results produced on different runs) and a small set of build-wide
//! counters survive.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// A unique id for a single evaluation (one call to an `evaluate_*` façade method, or one
/// `--loop` iteration) against a given evaluator instance.
///
/// RunIds are not comparable across evaluator instances, and only equality is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

impl RunId {
    pub fn new() -> RunId {
        RunId(rand::rng().random())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Build-wide counters, incremented by the evaluator's progress hooks (C5) and read back by the
/// façade to report end-of-build summaries (packages loaded, files invalidated, and so on).
#[derive(Default, Debug)]
pub struct EngineMetrics {
    pub nodes_built_fresh: AtomicU64,
    pub nodes_reused_clean: AtomicU64,
    pub nodes_failed: AtomicU64,
    pub nodes_invalidated: AtomicU64,
    pub cycles_detected: AtomicU64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            nodes_built_fresh: self.nodes_built_fresh.load(Ordering::SeqCst),
            nodes_reused_clean: self.nodes_reused_clean.load(Ordering::SeqCst),
            nodes_failed: self.nodes_failed.load(Ordering::SeqCst),
            nodes_invalidated: self.nodes_invalidated.load(Ordering::SeqCst),
            cycles_detected: self.cycles_detected.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub nodes_built_fresh: u64,
    pub nodes_reused_clean: u64,
    pub nodes_failed: u64,
    pub nodes_invalidated: u64,
    pub cycles_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_not_all_equal() {
        // Not a strict guarantee, but collisions across a handful of draws would indicate a
        // broken RNG wiring.
        let ids: Vec<_> = (0..8).map(|_| RunId::new()).collect();
        assert!(ids.iter().any(|id| *id != ids[0]));
    }

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = EngineMetrics::default();
        metrics.nodes_built_fresh.fetch_add(3, Ordering::SeqCst);
        metrics.nodes_reused_clean.fetch_add(1, Ordering::SeqCst);
        let snap = metrics.snapshot();
        assert_eq!(snap.nodes_built_fresh, 3);
        assert_eq!(snap.nodes_reused_clean, 1);
        assert_eq!(snap.nodes_failed, 0);
    }
}
