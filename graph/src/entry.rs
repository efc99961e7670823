// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::mem;
use std::sync::atomic;
use std::sync::Arc;

use crate::context::{Context, DepState};
use crate::node::{EntryId, Node, NodeError};
use crate::test_trace_log;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use workunit::RunId;

///
/// A token that uniquely identifies one run of a Node in the Graph. Each run of a Node has a
/// different RunToken associated with it. When a run completes, if the current RunToken of its
/// Node no longer matches the RunToken of the spawned work (because the Node was `cleared`), the
/// work is discarded. See `Entry::complete` for more information.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunToken(u32);

impl RunToken {
    pub fn initial() -> RunToken {
        RunToken(0)
    }

    fn next(self) -> RunToken {
        RunToken(self.0 + 1)
    }
}

///
/// A token associated with a Node that is incremented whenever its output value has (or might
/// have) changed. Unlike the RunToken (incremented on every re-run), the Generation only advances
/// when the output actually differs, which is what makes §4.4.4 change pruning possible: a
/// dependent can compare the Generation it observed last time to the dependency's current
/// Generation without re-running either side.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u32);

impl Generation {
    pub fn initial() -> Generation {
        Generation(0)
    }

    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

/// A result from running (or cleaning) a Node: the outcome, the Generation it produced, whether it
/// carries uncacheable dependencies, and whether the Node's function was actually invoked (`true`)
/// versus reused from a clean cache hit or a successful §4.4.4 cleaning (`false`). The last field
/// is what the progress receiver's `BuiltFresh`/`ReusedClean` distinction (§4.5) is derived from.
pub type NodeResult<N> = (
    Result<<N as Node>::Item, <N as Node>::Error>,
    Generation,
    bool,
    bool,
);

///
/// The value half of an Entry's state. Distinct from `EntryState` because a Node can be Running
/// while still holding on to a previous `EntryResult` to fall back to (a Completed node that was
/// dirtied keeps its last good value until the in-flight re-run decides whether to replace it).
///
#[derive(Clone, Debug)]
pub enum EntryResult<N: Node> {
    /// A value that is immediately readable by any consumer, with no constraints.
    Clean(N::Item),
    /// A consumer should check whether the dependencies of the Node have the same values as they
    /// did when this Node was last run; if so, the value can be re-used (and can move to Clean).
    Dirty(N::Item),
    /// Like Clean, but the value may only be consumed in the same evaluation run that produced it.
    Uncacheable(N::Item, RunId),
    /// A value computed from an Uncacheable dependency: Clean within the producing run, Dirty
    /// outside of it.
    UncacheableDependencies(N::Item, RunId),
}

impl<N: Node> EntryResult<N> {
    fn new(
        item: N::Item,
        context: &Context<N>,
        cacheable: bool,
        has_uncacheable_deps: bool,
    ) -> EntryResult<N> {
        if !cacheable {
            EntryResult::Uncacheable(item, context.run_id())
        } else if has_uncacheable_deps {
            EntryResult::UncacheableDependencies(item, context.run_id())
        } else {
            EntryResult::Clean(item)
        }
    }

    fn is_clean(&self, context: &Context<N>) -> bool {
        match self {
            EntryResult::Clean(..) => true,
            EntryResult::Uncacheable(_, run_id) => context.run_id() == *run_id,
            EntryResult::UncacheableDependencies(.., run_id) => context.run_id() == *run_id,
            EntryResult::Dirty(..) => false,
        }
    }

    fn has_uncacheable_deps(&self) -> bool {
        matches!(
            self,
            EntryResult::Uncacheable(..) | EntryResult::UncacheableDependencies(..)
        )
    }

    fn peek(&self, context: &Context<N>) -> Option<N::Item> {
        self.is_clean(context).then(|| self.as_ref().clone())
    }

    /// If the value is in a Clean(-ish) state, mark it Dirty.
    fn dirty(&mut self) {
        match self {
            EntryResult::Clean(v)
            | EntryResult::UncacheableDependencies(v, _)
            | EntryResult::Uncacheable(v, _) => {
                *self = EntryResult::Dirty(v.clone());
            }
            EntryResult::Dirty(_) => {}
        }
    }

    /// Assert that the value is Dirty (or run-scoped), and move it back to a clean variant.
    fn clean(&mut self, context: &Context<N>, cacheable: bool, has_uncacheable_deps: bool) {
        let value = match self {
            EntryResult::Dirty(value) => value.clone(),
            EntryResult::UncacheableDependencies(value, _) => value.clone(),
            x => unreachable!("A node in state {:?} should not have been cleaned.", x),
        };
        *self = EntryResult::new(value, context, cacheable, has_uncacheable_deps);
    }
}

impl<N: Node> AsRef<N::Item> for EntryResult<N> {
    fn as_ref(&self) -> &N::Item {
        match self {
            EntryResult::Clean(v) => v,
            EntryResult::Dirty(v) => v,
            EntryResult::Uncacheable(v, _) => v,
            EntryResult::UncacheableDependencies(v, _) => v,
        }
    }
}

/// A Shared future yielding a NodeResult: every caller that asks for the same Node while it is
/// Running clones this handle and awaits it independently, and the underlying task (spawned once)
/// computes the value exactly once. See §4.4.1 guarantee 2.
type RunningFuture<N> = Shared<BoxFuture<'static, NodeResult<N>>>;

#[derive(Debug)]
pub(crate) enum EntryState<N: Node> {
    /// Not yet started, or explicitly cleared. `previous_result` is never valid for direct use in
    /// this state: it exists only so the next run can diff against it to decide whether the
    /// Generation should advance.
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous_result: Option<EntryResult<N>>,
    },
    /// Running (or being cleaned, a no-op re-run that just revalidates dependencies).
    ///
    /// `kill` lets the cycle-detection background task (§4.4.5) force this run to fail with a
    /// cycle error without waiting for its natural completion, which is otherwise impossible for a
    /// task that is itself deadlocked awaiting a cyclic dependency.
    Running {
        run_token: RunToken,
        generation: Generation,
        previous_result: Option<EntryResult<N>>,
        dirtied: bool,
        is_cleaning: bool,
        kill: Option<oneshot::Sender<N::Error>>,
        future: RunningFuture<N>,
    },
    /// Completed, and possibly since marked Dirty (via `result`, see `EntryResult::Dirty`).
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: EntryResult<N>,
        dep_generations: Vec<(EntryId, Generation)>,
    },
}

impl<N: Node> EntryState<N> {
    fn initial() -> EntryState<N> {
        EntryState::NotStarted {
            run_token: RunToken::initial(),
            generation: Generation::initial(),
            previous_result: None,
        }
    }
}

///
/// An Entry and its adjacencies. Cheaply cloneable: the actual state lives behind an `Arc<Mutex>`.
///
#[derive(Clone, Debug)]
pub(crate) struct Entry<N: Node> {
    node: Arc<N>,
    state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::initial())),
        }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    fn cacheable_with_output(&self, output: Option<&N::Item>) -> bool {
        let output_cacheable = match output {
            Some(item) => self.node.cacheable_item(item),
            None => false,
        };
        output_cacheable && self.node.cacheable()
    }

    /// If this Node is currently complete and clean with the given context, returns a clone of its
    /// value without starting (or waiting for) any work.
    pub fn peek(&self, context: &Context<N>) -> Option<N::Item> {
        match &*self.state.lock() {
            EntryState::Completed { result, .. } => result.peek(context),
            _ => None,
        }
    }

    ///
    /// Spawns (or re-spawns, for cleaning) the execution of this Node on the Graph's Executor.
    ///
    fn spawn_node_execution(
        context: &Context<N>,
        entry: Entry<N>,
        entry_id: EntryId,
        run_token: RunToken,
        generation: Generation,
        previous_dep_generations: Option<Vec<(EntryId, Generation)>>,
        previous_result: Option<EntryResult<N>>,
    ) -> EntryState<N> {
        let run_token = run_token.next();
        let node_context = context.clone_for(entry_id);
        let is_cleaning = previous_dep_generations.is_some();
        let (kill_send, kill_recv) = oneshot::channel();

        let run_or_clean = {
            let node_context = node_context.clone();
            let entry_for_run = entry.clone();
            async move {
                let clean_with_dep_state = if let Some(previous_dep_generations) =
                    previous_dep_generations
                {
                    match node_context
                        .graph()
                        .attempt_cleaning(entry_id, &previous_dep_generations, &node_context)
                        .await
                    {
                        Ok(has_uncacheable_deps) => {
                            node_context.stats().cleaning_succeeded.fetch_add(1, atomic::Ordering::SeqCst);
                            Some(DepState {
                                generations: previous_dep_generations,
                                has_uncacheable_deps,
                            })
                        }
                        Err(()) => {
                            node_context.stats().cleaning_failed.fetch_add(1, atomic::Ordering::SeqCst);
                            None
                        }
                    }
                } else {
                    None
                };

                match clean_with_dep_state {
                    Some(dep_state) => (None, dep_state),
                    None => {
                        let res = entry_for_run.node().clone().run(node_context.clone()).await;
                        node_context.stats().ran.fetch_add(1, atomic::Ordering::SeqCst);
                        let dep_state = node_context.complete(entry_for_run.node());
                        (Some(res), dep_state)
                    }
                }
            }
        };

        let entry_for_complete = entry.clone();
        let node_context_for_complete = node_context.clone();
        let task = async move {
            futures::pin_mut!(run_or_clean);
            let raced = futures::future::select(kill_recv, run_or_clean).await;
            let (maybe_res, dep_state) = match raced {
                future::Either::Left((killed, _)) => {
                    let err = killed.unwrap_or_else(|_| N::Error::invalidated());
                    (Some(Err(err)), DepState::default())
                }
                future::Either::Right((computed, _)) => computed,
            };
            entry_for_complete.complete(
                &node_context_for_complete,
                run_token,
                generation,
                dep_state.generations,
                dep_state.has_uncacheable_deps,
                maybe_res,
            )
        };

        let join = node_context.graph().executor.spawn(task);
        let future = async move {
            join.await
                .unwrap_or_else(|_| (Err(N::Error::invalidated()), generation.next(), true, false))
        }
        .boxed()
        .shared();

        EntryState::Running {
            run_token,
            generation,
            previous_result,
            dirtied: false,
            is_cleaning,
            kill: Some(kill_send),
            future,
        }
    }

    ///
    /// Returns a Future for the Node's value and Generation, starting (or resuming) execution if
    /// necessary.
    ///
    pub(crate) fn get_node_result(
        &self,
        context: &Context<N>,
        entry_id: EntryId,
    ) -> BoxFuture<'static, NodeResult<N>> {
        let mut state = self.state.lock();

        match &*state {
            EntryState::Running { future, .. } => {
                return future.clone().boxed();
            }
            EntryState::Completed { result, generation, .. } if result.is_clean(context) => {
                return future::ready((
                    Ok(result.as_ref().clone()),
                    *generation,
                    result.has_uncacheable_deps(),
                    false,
                ))
                .boxed();
            }
            _ => (),
        }

        let next_state = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::NotStarted {
                run_token,
                generation,
                previous_result,
            } => Self::spawn_node_execution(
                context,
                self.clone(),
                entry_id,
                run_token,
                generation,
                None,
                previous_result,
            ),
            EntryState::Completed {
                run_token,
                generation,
                result,
                dep_generations,
            } => {
                test_trace_log!("Re-starting node {:?}. It was: {:?}", self.node, result);
                debug_assert!(
                    !result.is_clean(context),
                    "A clean Node should not reach this point: {result:?}"
                );
                let previous_dep_generations =
                    self.cacheable_with_output(Some(result.as_ref())).then_some(dep_generations);
                Self::spawn_node_execution(
                    context,
                    self.clone(),
                    entry_id,
                    run_token,
                    generation,
                    previous_dep_generations,
                    Some(result),
                )
            }
            s @ EntryState::Running { .. } => s,
        };

        let future = match &next_state {
            EntryState::Running { future, .. } => future.clone(),
            _ => unreachable!("spawn_node_execution always returns Running"),
        };
        *state = next_state;
        future.boxed()
    }

    ///
    /// Called by the spawned task when it finishes running (or cleaning). `result` is `None` if
    /// the Node was found to be clean by dependency-generation comparison.
    ///
    fn complete(
        &self,
        context: &Context<N>,
        result_run_token: RunToken,
        mut generation: Generation,
        dep_generations: Vec<(EntryId, Generation)>,
        has_uncacheable_deps: bool,
        result: Option<Result<N::Item, N::Error>>,
    ) -> NodeResult<N> {
        let mut state = self.state.lock();

        let dirtied_during_run = match &*state {
            EntryState::Running { run_token, .. } if *run_token == result_run_token => {
                matches!(&*state, EntryState::Running { dirtied: true, .. })
            }
            _ => {
                test_trace_log!("Not completing node {:?}: it was invalidated.", self.node);
                // A race we don't own (e.g. the node was `clear`ed out from under us): report an
                // invalidation so the caller retries instead of trusting a stale value.
                return (Err(N::Error::invalidated()), generation.next(), true, false);
            }
        };

        let (next_state, node_result) = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                mut previous_result,
                ..
            } => match result {
                Some(Err(e)) => {
                    if let Some(previous) = previous_result.as_mut() {
                        previous.dirty();
                    }
                    generation = generation.next();
                    let node_result = (Err(e), generation, true, true);
                    (
                        EntryState::NotStarted {
                            run_token: run_token.next(),
                            generation,
                            previous_result,
                        },
                        node_result,
                    )
                }
                Some(Ok(value)) => {
                    let cacheable = self.cacheable_with_output(Some(&value));
                    let mut next_result = EntryResult::new(value, context, cacheable, has_uncacheable_deps);
                    if Some(next_result.as_ref()) != previous_result.as_ref().map(EntryResult::as_ref) {
                        generation = generation.next();
                    }
                    if dirtied_during_run {
                        next_result.dirty();
                    }
                    let node_result = (
                        Ok(next_result.as_ref().clone()),
                        generation,
                        next_result.has_uncacheable_deps(),
                        true,
                    );
                    (
                        EntryState::Completed {
                            run_token,
                            generation,
                            result: next_result,
                            dep_generations,
                        },
                        node_result,
                    )
                }
                None => {
                    let mut result = previous_result
                        .expect("A Node cannot be marked clean without a previous result.");
                    result.clean(context, self.cacheable_with_output(Some(result.as_ref())), has_uncacheable_deps);
                    if dirtied_during_run {
                        result.dirty();
                    }
                    let node_result = (
                        Ok(result.as_ref().clone()),
                        generation,
                        result.has_uncacheable_deps(),
                        false,
                    );
                    (
                        EntryState::Completed {
                            run_token,
                            generation,
                            result,
                            dep_generations,
                        },
                        node_result,
                    )
                }
            },
            s => (s, (Err(N::Error::invalidated()), generation.next(), true, false)),
        };

        *state = next_state;
        node_result
    }

    ///
    /// Clears this Node's state, forcing it to be recomputed from scratch on next access.
    ///
    pub(crate) fn clear(&mut self, dirty_previous_result: bool) {
        let mut state = self.state.lock();

        let (run_token, generation, mut previous_result) =
            match mem::replace(&mut *state, EntryState::initial()) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                } => (run_token, generation, previous_result),
                EntryState::Running {
                    run_token,
                    generation,
                    previous_result,
                    ..
                } => (run_token, generation, previous_result),
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    ..
                } => (run_token, generation, Some(result)),
            };

        test_trace_log!("Clearing node {:?}", self.node);

        if dirty_previous_result {
            if let Some(previous_result) = previous_result.as_mut() {
                previous_result.dirty();
            }
        }

        *state = EntryState::NotStarted {
            run_token: run_token.next(),
            generation,
            previous_result,
        };
    }

    ///
    /// Dirties this Node: it will re-examine its dependencies (and re-run if any changed) the next
    /// time it is requested.
    ///
    pub(crate) fn dirty(&mut self) {
        let mut state = self.state.lock();
        test_trace_log!("Dirtying node {:?}", self.node);
        match &mut *state {
            EntryState::Completed { result, .. } => {
                result.dirty();
            }
            EntryState::NotStarted { .. } => {}
            EntryState::Running { dirtied, .. } => {
                *dirtied = true;
            }
        }
    }

    ///
    /// Forces this Node to fail with `err` if it is currently Running. Used exclusively by cycle
    /// resolution (§4.4.5): a Node stuck awaiting a cyclic dependency will never complete on its
    /// own, so the cycle-detection task breaks the deadlock by terminating one participant.
    ///
    pub(crate) fn terminate(&mut self, err: N::Error) {
        let mut state = self.state.lock();
        test_trace_log!("Terminating node {:?} with {:?}", self.node, err);
        if let EntryState::Running { kill, .. } = &mut *state {
            if let Some(kill) = kill.take() {
                let _ = kill.send(err);
            }
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(&*self.state.lock(), EntryState::NotStarted { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), EntryState::Running { .. })
    }

    pub fn is_cleaning(&self) -> bool {
        matches!(&*self.state.lock(), EntryState::Running { is_cleaning: true, .. })
    }

    pub(crate) fn format(&self, context: &Context<N>) -> String {
        let state = match self.peek(context) {
            Some(ref item) => {
                let item = format!("{item:?}");
                if item.len() <= 1024 {
                    item
                } else {
                    item.chars().take(1024).collect()
                }
            }
            None => "<None>".to_string(),
        };
        format!("{} == {}", self.node, state)
    }
}
