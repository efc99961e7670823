// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! The evaluation engine's key/value registry and dependency graph (components C1/C2/C3 of the
//! incremental build orchestrator): `Node` is the key/value pair (§C1), `Graph` is the versioned
//! DAG of memoized results (§C2), and `Graph::invalidate_from_roots`/`Graph::bump_version` play
//! the role of the Differencer (§C3), converting an externally observed change into a minimal set
//! of dirtied Nodes.

pub mod context;
pub mod entry;
mod node;

pub use crate::context::Context;
pub use crate::entry::{Entry, EntryState};
use crate::entry::{Generation, RunToken};

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use futures::future;
use parking_lot::Mutex;
use petgraph::dot;
use petgraph::graph::DiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use petgraph::Direction;
use task_executor::Executor;
use tokio::time::sleep;
use workunit::RunId;

pub use crate::node::{Node, NodeError};

pub type EntryId = petgraph::graph::NodeIndex<u32>;

type PGraph<N> = DiGraph<Entry<N>, (), u32>;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

type Nodes<N> = HashMap<N, EntryId>;

struct InnerGraph<N: Node> {
    nodes: Nodes<N>,
    pg: PGraph<N>,
}

impl<N: Node> InnerGraph<N> {
    fn entry_id(&self, node: &N) -> Option<&EntryId> {
        self.nodes.get(node)
    }

    fn entry_for_id(&self, id: EntryId) -> Option<&Entry<N>> {
        self.pg.node_weight(id)
    }

    fn entry_for_id_mut(&mut self, id: EntryId) -> Option<&mut Entry<N>> {
        self.pg.node_weight_mut(id)
    }

    fn unsafe_entry_for_id(&self, id: EntryId) -> &Entry<N> {
        self.pg
            .node_weight(id)
            .expect("The unsafe_entry_for_id method should only be used in read-only methods!")
    }

    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }
        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    ///
    /// Locates all* cycles in running nodes in the graph, and terminates one Node in each of them
    /// (§4.4.5). A Node that is genuinely part of a cycle is awaiting a dependency that
    /// (transitively) awaits it back, and so will never complete on its own; this periodic scan is
    /// what breaks the deadlock.
    ///
    /// * Finding "all simple cycles" in a graph is apparently best accomplished with Johnson's
    /// algorithm, which uses the strongly connected components but goes a bit further. Because
    /// this method runs repeatedly, we don't worry about that, and just kill one member of each
    /// SCC per pass.
    ///
    fn terminate_cycles(&mut self) {
        let running_graph = self.pg.filter_map(
            |node_idx, node_weight| {
                if node_weight.is_running() {
                    Some(node_idx)
                } else {
                    None
                }
            },
            |_edge_idx, _edge_weight| Some(()),
        );
        let running_sccs = petgraph::algo::kosaraju_scc(&running_graph);

        for running_scc in running_sccs {
            if running_scc.len() <= 1 {
                continue;
            }

            // Bias toward terminating nodes which are being cleaned, since they can form false
            // cycles with nodes that are running from scratch. If none are cleaning, terminate the
            // running node with the highest id.
            let (running_candidate, should_terminate) = if let Some(dirty_candidate) = running_scc
                .iter()
                .filter(|&id| self.pg[running_graph[*id]].is_cleaning())
                .max_by_key(|&id| running_graph[*id])
            {
                (dirty_candidate, false)
            } else {
                (
                    running_scc
                        .iter()
                        .max_by_key(|&id| running_graph[*id])
                        .unwrap(),
                    true,
                )
            };

            test_trace_log!(
                "Cycle {:?}",
                running_scc
                    .iter()
                    .map(|id| {
                        let entry = &self.pg[running_graph[*id]];
                        format!("{:?}: is_cleaning: {}", entry.node(), entry.is_cleaning())
                    })
                    .collect::<Vec<_>>(),
            );

            let running_predecessor = running_graph
                .neighbors_directed(*running_candidate, Direction::Incoming)
                .find(|id| running_scc.contains(id))
                .unwrap();
            let running_path: Vec<_> = petgraph::algo::all_simple_paths(
                &running_graph,
                *running_candidate,
                running_predecessor,
                0,
                None,
            )
            .next()
            .unwrap();

            let candidate = running_graph[*running_candidate];
            if should_terminate {
                let path = running_path
                    .into_iter()
                    .map(|rni| self.pg[running_graph[rni]].node())
                    .collect::<Vec<_>>();
                let error = N::cyclic_error(&path);
                self.pg[candidate].terminate(error);
            } else {
                let node = self.pg[candidate].node().clone();
                self.invalidate_from_roots(true, |n| &node == n);
            }
        }
    }

    fn walk<F: Fn(&EntryId) -> bool>(
        &self,
        roots: VecDeque<EntryId>,
        direction: Direction,
        stop_walking_predicate: F,
    ) -> Walk<'_, N, F> {
        Walk {
            graph: self,
            direction,
            deque: roots,
            walked: self.pg.visit_map(),
            stop_walking_predicate,
        }
    }

    fn clear(&mut self) {
        for eid in self.nodes.values() {
            if let Some(entry) = self.pg.node_weight_mut(*eid) {
                entry.clear(true);
            }
        }
    }

    ///
    /// Clears the values of all "invalidation root" Nodes and dirties their transitive dependents
    /// (the Differencer's C3 responsibility: turning an externally observed change into a set of
    /// dirtied Nodes).
    ///
    /// An "invalidation root" is a Node that can be invalidated for a reason other than having had
    /// its dependencies changed (a changed input file, a cleared build variable, and so on).
    ///
    fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &mut self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let root_ids: HashSet<_> = self
            .nodes
            .iter()
            .filter_map(|(node, &entry_id)| {
                // A NotStarted entry does not need clearing: we can assume its dependents have
                // never observed a value for it, or are already dirtied. Filtering these redundant
                // events "debounces" invalidation.
                if predicate(node) && self.unsafe_entry_for_id(entry_id).is_started() {
                    Some(entry_id)
                } else {
                    None
                }
            })
            .collect();

        // NB: We only dirty "through" a Node and into its dependents if it is Node::restartable.
        let transitive_ids: Vec<_> = self
            .walk(
                root_ids.iter().cloned().collect(),
                Direction::Incoming,
                |&entry_id| {
                    let entry = self.unsafe_entry_for_id(entry_id);
                    !entry.node().restartable() && entry.is_running()
                },
            )
            .filter(|eid| !root_ids.contains(eid))
            .collect();

        let invalidation_result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive_ids.len(),
        };

        if root_ids.is_empty() {
            return invalidation_result;
        }

        for id in &root_ids {
            if let Some(entry) = self.pg.node_weight_mut(*id) {
                entry.clear(false);
            }
        }
        self.pg.retain_edges(|pg, edge| {
            if let Some((src, _)) = pg.edge_endpoints(edge) {
                !root_ids.contains(&src)
            } else {
                true
            }
        });

        for id in &transitive_ids {
            if let Some(entry) = self.pg.node_weight_mut(*id) {
                if log_dirtied {
                    log::info!("Dirtying {}", entry.node());
                }
                entry.dirty();
            }
        }

        invalidation_result
    }

    fn visualize(&self, roots: &[N], path: &Path, context: &Context<N>) -> io::Result<()> {
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);

        let root_ids = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect();
        let included = self
            .walk(root_ids, Direction::Outgoing, |_| false)
            .collect::<HashSet<_>>();

        let graph = self.pg.filter_map(
            |node_id, node| {
                if included.contains(&node_id) {
                    Some(node.format(context))
                } else {
                    None
                }
            },
            |_, _| Some("".to_owned()),
        );

        f.write_all(
            format!(
                "{}",
                dot::Dot::with_config(&graph, &[dot::Config::EdgeNoLabel])
            )
            .as_bytes(),
        )?;

        Ok(())
    }

    fn live_reachable<'g>(
        &'g self,
        roots: &[N],
        context: &Context<N>,
    ) -> impl Iterator<Item = (&'g N, N::Item)> + 'g {
        let root_ids = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect();
        self.live_internal(
            self.walk(root_ids, Direction::Outgoing, |_| false)
                .collect(),
            context,
        )
    }

    fn live<'g>(&'g self, context: &Context<N>) -> impl Iterator<Item = (&'g N, N::Item)> + 'g {
        self.live_internal(self.pg.node_indices().collect(), context)
    }

    fn live_internal<'g>(
        &'g self,
        entryids: Vec<EntryId>,
        context: &Context<N>,
    ) -> impl Iterator<Item = (&'g N, N::Item)> + 'g {
        let context = context.clone();
        entryids
            .into_iter()
            .filter_map(move |eid| self.entry_for_id(eid))
            .filter_map(move |entry| entry.peek(&context).map(|i| (entry.node(), i)))
    }
}

///
/// A DAG (enforced on mutation) of Entries: the memoizing evaluator of components C1-C3. Each
/// distinct `Node` value is a vertex; an edge from A to B means "A's last run requested B's
/// value". `version` is bumped on every batch of external invalidation, giving callers (the
/// façade's progress/session layer) a cheap way to tell whether anything changed between two
/// evaluations without walking the graph.
///
pub struct Graph<N: Node> {
    inner: Arc<Mutex<InnerGraph<N>>>,
    pub(crate) executor: Executor,
    invalidation_delay: Duration,
    version: Arc<AtomicU64>,
}

impl<N: Node> Graph<N> {
    pub fn new(executor: Executor) -> Graph<N> {
        Self::new_with_invalidation_delay(executor, Duration::from_millis(500))
    }

    pub fn new_with_invalidation_delay(
        executor: Executor,
        invalidation_delay: Duration,
    ) -> Graph<N> {
        let inner = Arc::new(Mutex::new(InnerGraph {
            nodes: HashMap::default(),
            pg: DiGraph::new(),
        }));
        let _join = executor.spawn(Self::cycle_check_task(Arc::downgrade(&inner)));

        Graph {
            inner,
            executor,
            invalidation_delay,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn new_context(&self, context: N::Context) -> Context<N>
    where
        N: Clone,
    {
        Context::new(self.clone(), context, self.generate_run_id())
    }

    pub(crate) fn generate_run_id(&self) -> RunId {
        RunId::new()
    }

    ///
    /// The current invalidation version: incremented each time `invalidate_from_roots` clears at
    /// least one root, so callers can cheaply notice "nothing changed since I last checked".
    ///
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    ///
    /// A task which periodically checks for cycles in Running nodes. Doing this in the background
    /// allows for batching and laziness: Nodes that don't form cycles may complete without ever
    /// being checked.
    ///
    async fn cycle_check_task(inner: Weak<Mutex<InnerGraph<N>>>) {
        loop {
            sleep(Duration::from_millis(500)).await;

            if let Some(inner) = Weak::upgrade(&inner) {
                inner.lock().terminate_cycles();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len()
    }

    async fn get_inner(
        &self,
        src_id: Option<EntryId>,
        context: &Context<N>,
        dst_node: N,
    ) -> (Result<N::Item, N::Error>, Generation, bool) {
        let (dst_retry, entry, entry_id) = {
            let mut inner = self.inner.lock();

            let dst_id = inner.ensure_entry(dst_node);
            let dst_retry = if let Some(src_id) = src_id {
                test_trace_log!(
                    "Adding dependency from {:?} to {:?}",
                    inner.entry_for_id(src_id).unwrap().node(),
                    inner.entry_for_id(dst_id).unwrap().node()
                );
                inner.pg.add_edge(src_id, dst_id, ());
                !inner.entry_for_id(src_id).unwrap().node().restartable()
            } else {
                test_trace_log!(
                    "Requesting node {:?}",
                    inner.entry_for_id(dst_id).unwrap().node()
                );
                true
            };

            let dst_entry = inner.entry_for_id(dst_id).cloned().unwrap();
            (dst_retry, dst_entry, dst_id)
        };

        if dst_retry {
            loop {
                let (result, generation, _uncacheable, was_rerun) =
                    entry.get_node_result(context, entry_id).await;
                match result {
                    Err(err) if err == N::Error::invalidated() => {
                        let node = {
                            let inner = self.inner.lock();
                            inner.unsafe_entry_for_id(entry_id).node().clone()
                        };
                        log::info!(
                            "Node changed while running: retrying `{}` in {:?}...",
                            node,
                            self.invalidation_delay
                        );
                        sleep(self.invalidation_delay).await;
                        continue;
                    }
                    other => break (other, generation, was_rerun),
                }
            }
        } else {
            let (result, generation, _uncacheable, was_rerun) =
                entry.get_node_result(context, entry_id).await;
            (result, generation, was_rerun)
        }
    }

    ///
    /// Compares the Generations of the dependencies recorded for `entry_id` the last time it ran
    /// to their current values (recursing to recompute or clean them first, if necessary), to
    /// decide whether `entry_id`'s own cached value can be reused without re-running it. Returns
    /// `Ok(has_uncacheable_deps)` if every dependency's Generation is unchanged, `Err(())` if any
    /// of them changed (or failed), meaning `entry_id` must be re-run.
    ///
    pub(crate) async fn attempt_cleaning(
        &self,
        entry_id: EntryId,
        previous_dep_generations: &[(EntryId, Generation)],
        context: &Context<N>,
    ) -> Result<bool, ()> {
        let _ = entry_id;
        let deps: Vec<(Entry<N>, EntryId, Generation)> = {
            let inner = self.inner.lock();
            previous_dep_generations
                .iter()
                .map(|&(dep_id, generation)| {
                    let dep_entry = inner
                        .entry_for_id(dep_id)
                        .unwrap_or_else(|| panic!("Dependency not present in Graph."))
                        .clone();
                    (dep_entry, dep_id, generation)
                })
                .collect()
        };

        let checks = deps
            .into_iter()
            .map(|(dep_entry, dep_id, previous_generation)| {
                let context = context.clone();
                async move {
                    let (result, generation, has_uncacheable, _was_rerun) =
                        dep_entry.get_node_result(&context, dep_id).await;
                    result.map_err(|_| ())?;
                    if generation == previous_generation {
                        Ok(has_uncacheable)
                    } else {
                        Err(())
                    }
                }
            });

        // try_join_all speculatively runs all branches and fails fast on the first mismatch,
        // canceling the remaining cleaning work.
        let results = future::try_join_all(checks).await?;
        Ok(results.into_iter().any(|has_uncacheable| has_uncacheable))
    }

    ///
    /// Request the given dst Node, optionally in the context of the given src Node.
    ///
    /// If there is no src Node, or the src Node is not restartable, this method retries for
    /// invalidation until the Node completes.
    ///
    pub async fn get(
        &self,
        src_id: Option<EntryId>,
        context: &Context<N>,
        dst_node: N,
    ) -> Result<N::Item, N::Error> {
        let (res, _generation, _was_rerun) = self.get_inner(src_id, context, dst_node).await;
        res
    }

    ///
    /// Return the value of the given Node. Shorthand for `self.get(None, context, node)`.
    ///
    pub async fn create(&self, node: N, context: &Context<N>) -> Result<N::Item, N::Error> {
        self.get(None, context, node).await
    }

    ///
    /// Like `create`, but also reports whether the Node's function was actually invoked (`true`)
    /// versus reused from a cache hit or successful cleaning (`false`): the signal the progress
    /// receiver's `BuiltFresh`/`ReusedClean` distinction (§4.5) is derived from.
    ///
    pub async fn create_with_outcome(
        &self,
        node: N,
        context: &Context<N>,
    ) -> (Result<N::Item, N::Error>, bool) {
        let (res, _generation, was_rerun) = self.get_inner(None, context, node).await;
        (res, was_rerun)
    }

    ///
    /// Clears the state of all Nodes in the Graph by dropping their state fields.
    ///
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.clear()
    }

    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let result = {
            let mut inner = self.inner.lock();
            inner.invalidate_from_roots(log_dirtied, predicate)
        };
        if result.cleared > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    ///
    /// Invalidates every Node whose cached result is an Err, without requiring a dependency or
    /// external-input change: used to force a retry of only the Nodes that failed on the last
    /// build (the façade's `invalidate_errors` operation).
    ///
    pub fn invalidate_errors(&self, context: &Context<N>) -> InvalidationResult {
        let failing: HashSet<N> = {
            let inner = self.inner.lock();
            inner
                .pg
                .node_weights()
                .filter_map(|entry| match entry.peek(context) {
                    None if entry.is_started() && !entry.is_running() => Some(entry.node().clone()),
                    _ => None,
                })
                .collect()
        };
        self.invalidate_from_roots(false, move |n| failing.contains(n))
    }

    pub fn visualize(&self, roots: &[N], path: &Path, context: &Context<N>) -> io::Result<()> {
        let inner = self.inner.lock();
        inner.visualize(roots, path, context)
    }

    pub fn visit_live_reachable(
        &self,
        roots: &[N],
        context: &Context<N>,
        mut f: impl FnMut(&N, N::Item),
    ) {
        let inner = self.inner.lock();
        for (n, v) in inner.live_reachable(roots, context) {
            f(n, v);
        }
    }

    pub fn visit_live(&self, context: &Context<N>, mut f: impl FnMut(&N, N::Item)) {
        let inner = self.inner.lock();
        for (n, v) in inner.live(context) {
            f(n, v);
        }
    }
}

impl<N: Node> Clone for Graph<N> {
    fn clone(&self) -> Self {
        Graph {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            invalidation_delay: self.invalidation_delay,
            version: self.version.clone(),
        }
    }
}

///
/// Represents the state of a particular walk through a Graph. Implements Iterator and has the same
/// lifetime as the Graph itself.
///
struct Walk<'a, N: Node, F>
where
    F: Fn(&EntryId) -> bool,
{
    graph: &'a InnerGraph<N>,
    direction: Direction,
    deque: VecDeque<EntryId>,
    walked: FixedBitSet,
    stop_walking_predicate: F,
}

impl<'a, N: Node + 'a, F: Fn(&EntryId) -> bool> Iterator for Walk<'a, N, F> {
    type Item = EntryId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            if !self.walked.visit(id) || (self.stop_walking_predicate)(&id) {
                continue;
            }

            self.deque
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

#[cfg(test)]
mod tests;
