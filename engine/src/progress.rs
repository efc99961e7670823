// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The progress receiver (C5): a sink the façade pushes one event to per Node completion, so a
//! caller can render a progress bar or stream build events without polling the graph. Modeled on
//! the way `workunit_store` lets multiple subscribers observe the same span in upstream pants,
//! simplified here to a single fan-out list of trait objects rather than a tracing span tree.

use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;

use parking_lot::Mutex;

use crate::key::NodeKey;

/// How a Node's evaluation concluded, from the caller's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The Node had no usable previous result and its function was invoked.
    BuiltFresh,
    /// A previous result was reused without re-invoking the Node's function (§4.4.4).
    ReusedClean,
    /// The Node's function ran and returned an error, or cleaning failed.
    Failed,
}

/// Receives one event per Node completion during an evaluation.
pub trait ProgressReceiver: Send + Sync {
    fn node_started(&self, _node: &NodeKey) {}
    fn node_finished(&self, node: &NodeKey, outcome: Outcome);
}

/// A `ProgressReceiver` that fans one event out to any number of subscribers, registered and
/// deregistered at runtime by the façade's session layer.
#[derive(Clone, Default)]
pub struct FanOut {
    receivers: Arc<Mutex<Vec<Arc<dyn ProgressReceiver>>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, receiver: Arc<dyn ProgressReceiver>) {
        self.receivers.lock().push(receiver);
    }

    pub fn clear(&self) {
        self.receivers.lock().clear();
    }
}

impl ProgressReceiver for FanOut {
    fn node_started(&self, node: &NodeKey) {
        for receiver in self.receivers.lock().iter() {
            receiver.node_started(node);
        }
    }

    fn node_finished(&self, node: &NodeKey, outcome: Outcome) {
        for receiver in self.receivers.lock().iter() {
            receiver.node_finished(node, outcome.clone());
        }
    }
}

/// A `ProgressReceiver` that counts outcomes, useful for tests and for the façade's own summary
/// logging at the end of an `evaluate_*` call.
#[derive(Default)]
pub struct Counters {
    pub built_fresh: std::sync::atomic::AtomicUsize,
    pub reused_clean: std::sync::atomic::AtomicUsize,
    pub failed: std::sync::atomic::AtomicUsize,
}

impl ProgressReceiver for Counters {
    fn node_finished(&self, _node: &NodeKey, outcome: Outcome) {
        match outcome {
            Outcome::BuiltFresh => self.built_fresh.fetch_add(1, SeqCst),
            Outcome::ReusedClean => self.reused_clean.fetch_add(1, SeqCst),
            Outcome::Failed => self.failed.fetch_add(1, SeqCst),
        };
    }
}

/// Feeds the same per-Node events into the build-wide counters the façade reports at the end of
/// an evaluation (§6 "Construct" mentions an event sink; this is the sink upstream pants' own
/// `workunit_store` metrics would be updated from).
impl ProgressReceiver for workunit::EngineMetrics {
    fn node_finished(&self, _node: &NodeKey, outcome: Outcome) {
        match outcome {
            Outcome::BuiltFresh => self.nodes_built_fresh.fetch_add(1, SeqCst),
            Outcome::ReusedClean => self.nodes_reused_clean.fetch_add(1, SeqCst),
            Outcome::Failed => self.nodes_failed.fetch_add(1, SeqCst),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let fan_out = FanOut::new();
        let counters_a = Arc::new(Counters::default());
        let counters_b = Arc::new(Counters::default());
        fan_out.register(counters_a.clone());
        fan_out.register(counters_b.clone());

        fan_out.node_finished(&NodeKey::BuildVariable("x".to_string()), Outcome::BuiltFresh);

        assert_eq!(counters_a.built_fresh.load(SeqCst), 1);
        assert_eq!(counters_b.built_fresh.load(SeqCst), 1);
    }

    #[test]
    fn engine_metrics_tracks_outcomes() {
        let metrics = workunit::EngineMetrics::default();
        metrics.node_finished(&NodeKey::BuildVariable("x".to_string()), Outcome::BuiltFresh);
        metrics.node_finished(&NodeKey::BuildVariable("y".to_string()), Outcome::ReusedClean);
        metrics.node_finished(&NodeKey::BuildVariable("z".to_string()), Outcome::Failed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.nodes_built_fresh, 1);
        assert_eq!(snapshot.nodes_reused_clean, 1);
        assert_eq!(snapshot.nodes_failed, 1);
    }
}
