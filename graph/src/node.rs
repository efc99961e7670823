// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use async_trait::async_trait;
use petgraph::stable_graph;

use crate::context::Context;

// 2^32 Nodes ought to be more than enough for anyone.
pub type EntryId = stable_graph::NodeIndex<u32>;

/// The identity of one memoized computation: a key in the evaluator's key/value registry (C1).
///
/// A `Node` is both the key (its own fields are the dependency-invariant input) and the
/// dispatcher for the pure function that computes its value: `run` is invoked with an
/// environment (`Context<Self>`) through which it discovers its dependencies dynamically, by
/// requesting other `Node`s and awaiting their values.
#[async_trait]
pub trait Node: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {
    /// Ambient, non-dependency-tracked data available to every invocation: build variables are
    /// requested like any other Node, but things like an executor handle or a build-root path are
    /// often more convenient to thread through as plain context.
    type Context: Clone + Send + Sync + 'static;

    type Item: Clone + Debug + PartialEq + Send + Sync + 'static;
    type Error: NodeError;

    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;

    /// Whether this Node's value may be reused across versions at all. Nodes representing
    /// inherently run-scoped values (e.g. a wall-clock reading) return `false`.
    fn cacheable(&self) -> bool {
        true
    }

    /// A further refinement of `cacheable`: some Nodes are cacheable in general, but produced an
    /// output on this particular run that must not be reused (e.g. it observed uncacheable
    /// dependencies).
    fn cacheable_item(&self, _item: &Self::Item) -> bool {
        true
    }

    /// Whether invalidation is allowed to pass "through" this Node to its dependents. A
    /// non-restartable Node (most commonly, one representing an external side effect that can only
    /// run once per process) suppresses re-running of its dependents when it is itself dirtied.
    fn restartable(&self) -> bool {
        true
    }

    /// Builds the error to report to every participant in a dependency cycle.
    fn cyclic_error(path: &[&Self]) -> Self::Error;
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync + 'static {
    /// An error representing that a Node's value was invalidated while a caller awaited it.
    /// Callers that can retry (see `Graph::get`) swallow this error and re-request the Node.
    fn invalidated() -> Self;

    /// A catch-all for engine-detected invariant violations that don't fit a family's own error
    /// type (a cycle, a request for a dependency after the requesting Node has already
    /// completed, and so on).
    fn generic(message: String) -> Self;
}
