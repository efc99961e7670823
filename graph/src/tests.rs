// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use task_executor::Executor;

use crate::context::Context;
use crate::{Graph, InvalidationResult, Node, NodeError};

fn empty_graph() -> Arc<Graph<TNode>> {
    Arc::new(Graph::new(Executor::new(2).unwrap()))
}

/// A trivial arithmetic language: `Const` is a leaf, `Sum` adds the values of its operands. Used
/// to exercise memoization, change pruning, and cycle detection without needing a real build
/// graph's worth of node families.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum TNode {
    Const(u8),
    Sum(u8),
}

impl TNode {
    fn id(&self) -> u8 {
        match self {
            TNode::Const(id) => *id,
            TNode::Sum(id) => *id,
        }
    }
}

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TNode({})", self.id())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum TError {
    Invalidated,
    Cyclic,
    Generic(String),
}

impl NodeError for TError {
    fn invalidated() -> Self {
        TError::Invalidated
    }

    fn generic(message: String) -> Self {
        TError::Generic(message)
    }
}

#[derive(Clone)]
struct TContext {
    runs: Arc<Mutex<Vec<TNode>>>,
    values: Arc<HashMap<u8, i64>>,
    deps: Arc<HashMap<u8, Vec<u8>>>,
}

impl TContext {
    fn new(values: HashMap<u8, i64>, deps: HashMap<u8, Vec<u8>>) -> TContext {
        TContext {
            runs: Arc::default(),
            values: Arc::new(values),
            deps: Arc::new(deps),
        }
    }

    fn runs(&self) -> Vec<TNode> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl Node for TNode {
    type Context = TContext;
    type Item = i64;
    type Error = TError;

    async fn run(self, context: Context<Self>) -> Result<i64, TError> {
        context.runs.lock().push(self.clone());
        match &self {
            TNode::Const(id) => Ok(*context.values.get(id).unwrap_or(&0)),
            TNode::Sum(id) => {
                let operand_ids = context.deps.get(id).cloned().unwrap_or_default();
                let mut total = 0i64;
                for operand_id in operand_ids {
                    let operand = TNode::Const(operand_id);
                    total += context.get(operand).await?;
                }
                Ok(total)
            }
        }
    }

    fn cyclic_error(path: &[&Self]) -> TError {
        let _ = path;
        TError::Cyclic
    }
}

/// A pair of Nodes that each depend on the other: used only to drive the cycle-detection test,
/// which does not go through `TNode::run`'s normal dependency walk.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct CycleNode(u8);

impl fmt::Display for CycleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CycleNode({})", self.0)
    }
}

#[async_trait]
impl Node for CycleNode {
    type Context = ();
    type Item = ();
    type Error = TError;

    async fn run(self, context: Context<Self>) -> Result<(), TError> {
        context.get(CycleNode(1 - self.0)).await
    }

    fn cyclic_error(path: &[&Self]) -> TError {
        let _ = path;
        TError::Cyclic
    }
}

#[tokio::test]
async fn create_and_memoize() {
    let graph = empty_graph();
    let mut values = HashMap::new();
    values.insert(0, 1);
    values.insert(1, 2);
    let mut deps = HashMap::new();
    deps.insert(2, vec![0, 1]);
    let context = graph.new_context(TContext::new(values, deps));

    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(3));
    // Requesting the same Node again must not re-run it: only the two Const leaves and the one
    // Sum computation should have run.
    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(3));
    assert_eq!(context.runs().len(), 3);
}

#[tokio::test]
async fn invalidate_and_clean() {
    let graph = empty_graph();
    let mut values = HashMap::new();
    values.insert(0, 1);
    values.insert(1, 2);
    let mut deps = HashMap::new();
    deps.insert(2, vec![0, 1]);
    let context = graph.new_context(TContext::new(values, deps));

    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(3));

    // Invalidating a leaf that didn't actually change should dirty its dependent, but the
    // dependent's re-run should still observe the same value, so nothing downstream re-runs.
    assert_eq!(
        graph.invalidate_from_roots(true, |n| matches!(n, TNode::Const(0))),
        InvalidationResult {
            cleared: 1,
            dirtied: 1,
        }
    );

    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(3));
}

#[tokio::test]
async fn invalidate_and_rerun() {
    let graph = empty_graph();
    let mut values = HashMap::new();
    values.insert(0, 1);
    values.insert(1, 2);
    let mut deps = HashMap::new();
    deps.insert(2, vec![0, 1]);
    let context = graph.new_context(TContext::new(values.clone(), deps.clone()));

    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(3));

    assert_eq!(
        graph.invalidate_from_roots(true, |n| matches!(n, TNode::Const(0))),
        InvalidationResult {
            cleared: 1,
            dirtied: 1,
        }
    );

    // A context whose Const(0) value actually changed must cause Sum to observe a new total.
    let mut changed_values = values;
    changed_values.insert(0, 10);
    let context = graph.new_context(TContext::new(changed_values, deps));
    assert_eq!(graph.create(TNode::Sum(2), &context).await, Ok(12));
}

#[tokio::test]
async fn cycle_is_reported_and_does_not_hang() {
    let graph = Arc::new(Graph::new(Executor::new(2).unwrap()));
    let context = graph.new_context(());

    // Both halves of the cycle must eventually resolve to a cyclic error rather than hang
    // forever; the background cycle-check task runs every 500ms, so allow a generous timeout.
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        graph.create(CycleNode(0), &context),
    )
    .await
    .expect("cycle was not detected in time");

    assert_eq!(result, Err(TError::Cyclic));
}

#[tokio::test]
async fn stats_count_runs_and_cleans() {
    let graph = empty_graph();
    let mut values = HashMap::new();
    values.insert(0, 1);
    let mut deps = HashMap::new();
    deps.insert(1, vec![0]);
    let context = graph.new_context(TContext::new(values, deps));

    graph
        .create(TNode::Sum(1), &context)
        .await
        .unwrap();
    assert_atomic_usize_eq(&context.stats().ran, 2);

    graph.invalidate_from_roots(true, |n| matches!(n, TNode::Const(0)));
    graph
        .create(TNode::Sum(1), &context)
        .await
        .unwrap();
    // Const(0) must re-run (it was cleared), and Sum(1) should be cleaned rather than re-run
    // since its only dependency produced the same value.
    assert_atomic_usize_eq(&context.stats().ran, 3);
    assert_atomic_usize_eq(&context.stats().cleaning_succeeded, 1);
}

fn assert_atomic_usize_eq(actual: &AtomicUsize, expected: usize) {
    assert_eq!(actual.load(atomic::Ordering::SeqCst), expected);
}
