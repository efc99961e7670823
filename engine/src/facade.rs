// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The driver façade (C7, §4.7): the single stateful object a caller actually holds. It owns the
//! graph, the build variables that stand in for the differencer's "injection" half (C3), the
//! cycle reporter (C6), and a fan-out progress receiver (C5); it translates `set_external_input`
//! and `notify_modified_paths` into graph invalidation and exposes the build-phase entry points
//! named in §6.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_latch::AsyncLatch;
use log::info;
use task_executor::Executor;
use tokio::sync::Mutex as AsyncMutex;

use crate::cycles::{CycleInfo, CycleReporter};
use crate::key::{EngineContext, EngineError, NodeKey};
use crate::progress::{FanOut, Outcome, ProgressReceiver};
use crate::value::NodeValue;
use options::BuildOptions;

/// The closed set of build-variable names the façade understands (§6 "Build variables"). Callers
/// may inject others, but only these are reinjected automatically by `reset`.
pub mod build_variables {
    pub const DEFAULT_VISIBILITY: &str = "default-visibility";
    pub const DEFAULTS_PACKAGE_CONTENTS: &str = "defaults-package-contents";
    pub const PACKAGE_LOCATOR: &str = "package-locator";
    pub const TEST_ENVIRONMENT_VARIABLES: &str = "test-environment-variables";
    pub const BUILD_ID: &str = "build-id";
    pub const WORKSPACE_STATUS_ACTION: &str = "workspace-status-action";
    pub const BUILD_INFO_FACTORIES: &str = "build-info-factories";
    pub const TOP_LEVEL_ARTIFACT_CONTEXT: &str = "top-level-artifact-context";
    pub const BAD_ACTIONS_SET: &str = "bad-actions-set";

    pub const ALL: &[&str] = &[
        DEFAULT_VISIBILITY,
        DEFAULTS_PACKAGE_CONTENTS,
        PACKAGE_LOCATOR,
        TEST_ENVIRONMENT_VARIABLES,
        BUILD_ID,
        WORKSPACE_STATUS_ACTION,
        BUILD_INFO_FACTORIES,
        TOP_LEVEL_ARTIFACT_CONTEXT,
        BAD_ACTIONS_SET,
    ];
}

/// The façade-level error taxonomy (§6 "Errors surfaced"). Per-key evaluation failures are carried
/// as `EngineError` inside an `EvaluationResult`; these are the failures that prevent an
/// `evaluate_*` call from producing a result map at all.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("no such package: {0}")]
    NoSuchPackage(String),
    #[error("BUILD file contains errors: {0}")]
    BuildFileContainsErrors(String),
    #[error("abrupt exit with code {0}")]
    AbruptExit(i32),
    #[error("interrupted")]
    Interrupted,
    #[error("{0} cycle(s) reported")]
    CyclesReported(usize),
}

impl From<EngineError> for FacadeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoSuchPackage(p) => FacadeError::NoSuchPackage(p),
            EngineError::BuildFileContainsErrors(m) => FacadeError::BuildFileContainsErrors(m),
            EngineError::Cyclic(path) => FacadeError::CyclesReported(path.len()),
            other => FacadeError::InvalidConfiguration(other.to_string()),
        }
    }
}

/// The per-key outcome of an `evaluate_*` call: `Value` and `Error` per §4.4.1; `Missing` is
/// folded into `Error` here, since this engine's evaluator (unlike the Missing/reinvoke protocol
/// in §9) only returns once a key is fully resolved or has definitively failed — see DESIGN.md for
/// the async/await substitution this simplifies away.
pub type EvaluationResult = BTreeMap<NodeKey, Result<NodeValue, EngineError>>;

/// Owns one evaluator instance for the lifetime of a build. Construct once per process (or per
/// `reset`); `evaluate_*` calls serialize on an internal async mutex, matching §4.7's "at most one
/// `evaluate_*` call in progress at a time".
pub struct Facade {
    options: Arc<BuildOptions>,
    executor: Executor,
    graph: graph::Graph<NodeKey>,
    engine_context: EngineContext,
    analysis_progress: FanOut,
    execution_progress: FanOut,
    cycle_reporter: Arc<CycleReporter>,
    metrics: Arc<workunit::EngineMetrics>,
    evaluate_lock: AsyncMutex<()>,
    /// Cooperative cancellation (§4.4.7, §6 `Interrupted`): `cancel()` trips this, and
    /// `evaluate_many` checks it between keys rather than awaiting an uninterruptible future.
    cancel: AsyncLatch,
}

impl Facade {
    pub fn new(options: BuildOptions, executor: Executor) -> Self {
        let options = Arc::new(options);
        let graph = graph::Graph::new_with_invalidation_delay(
            executor.clone(),
            std::time::Duration::from_millis(options.invalidation_delay_ms),
        );
        let engine_context = EngineContext::new(options.build_root.clone());
        let metrics = Arc::new(workunit::EngineMetrics::default());
        let facade = Facade {
            options,
            executor,
            graph,
            engine_context,
            analysis_progress: FanOut::new(),
            execution_progress: FanOut::new(),
            cycle_reporter: Arc::new(CycleReporter::new()),
            metrics: metrics.clone(),
            evaluate_lock: AsyncMutex::new(()),
            cancel: AsyncLatch::new(),
        };
        facade.analysis_progress.register(metrics.clone());
        facade.execution_progress.register(metrics);
        facade.inject_constant_build_variables();
        facade
    }

    /// Build-wide counters accumulated across every `evaluate_*` call made so far (§6 "Construct"
    /// event sink).
    pub fn metrics(&self) -> workunit::EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn inject_constant_build_variables(&self) {
        self.engine_context.set_build_variable(
            build_variables::DEFAULT_VISIBILITY,
            serde_json::json!(self.options.default_visibility),
        );
        self.engine_context.set_build_variable(
            build_variables::TEST_ENVIRONMENT_VARIABLES,
            serde_json::json!(self.options.test_environment_variables),
        );
        // Embedded-artifact injection (§4.7): these are invariant for the lifetime of one
        // evaluator instance, so they're seeded once here rather than computed by a registry
        // function.
        self.engine_context
            .set_build_variable(build_variables::BAD_ACTIONS_SET, serde_json::json!([]));
    }

    fn context(&self) -> graph::Context<NodeKey> {
        self.graph.new_context(self.engine_context.clone())
    }

    pub fn register_target_deps(&self, target: NodeKey, deps: Vec<NodeKey>) {
        self.engine_context.set_declared_deps(target, deps);
    }

    pub fn register_analysis_progress_receiver(&self, receiver: Arc<dyn ProgressReceiver>) {
        self.analysis_progress.register(receiver);
    }

    pub fn register_execution_progress_receiver(&self, receiver: Arc<dyn ProgressReceiver>) {
        self.execution_progress.register(receiver);
    }

    ///
    /// Trips the cooperative cancellation flag (§4.4.7): in-flight `evaluate_*` calls stop
    /// scheduling further keys and return `FacadeError::Interrupted` with whatever was already
    /// recorded. Idempotent, like `AsyncLatch::trigger` itself.
    ///
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.poll_triggered()
    }

    ///
    /// Injects a build variable (§4.7 `set_external_input`) and invalidates the corresponding
    /// `BuildVariable` key so that the next request for it observes the new value.
    ///
    pub fn set_external_input(&self, var: &str, value: serde_json::Value) {
        self.engine_context.set_build_variable(var, value);
        let key = NodeKey::BuildVariable(var.to_string());
        self.record_invalidation(self.graph.invalidate_from_roots(false, move |n| *n == key));

        if var == build_variables::PACKAGE_LOCATOR {
            self.invalidate_package_locator_dependents();
        }
    }

    /// Folds an invalidation's cleared+dirtied counts into the build-wide metrics (§6 "Construct"
    /// event sink) so a caller can observe how much of the graph a single injection touched.
    fn record_invalidation(&self, result: graph::InvalidationResult) {
        let touched = (result.cleared + result.dirtied) as u64;
        if touched > 0 {
            self.metrics
                .nodes_invalidated
                .fetch_add(touched, std::sync::atomic::Ordering::SeqCst);
        }
    }

    ///
    /// When the package search path changes, invalidate every key family whose value depends
    /// directly on the locator. This is a static allowlist (§4.7), not inferred from the graph.
    ///
    fn invalidate_package_locator_dependents(&self) {
        let result = self.graph.invalidate_from_roots(true, |n| {
            matches!(
                n,
                NodeKey::FileState(_) | NodeKey::DirectoryListing(_) | NodeKey::Package(_)
            )
        });
        self.record_invalidation(result);
    }

    ///
    /// Translates modified filesystem paths into `FileState`/`DirectoryListing` invalidations
    /// (§4.7 `notify_modified_paths`). `root`-relative paths are used as-is; each path also
    /// invalidates the listing of its parent directory, since a file's appearance or disappearance
    /// changes what its parent directory lists.
    ///
    pub fn notify_modified_paths(&self, paths: &[PathBuf]) {
        let paths: std::collections::HashSet<PathBuf> = paths.iter().cloned().collect();
        let parents: std::collections::HashSet<PathBuf> = paths
            .iter()
            .filter_map(|p| p.parent().map(|p| p.to_path_buf()))
            .collect();

        let result = self
            .graph
            .invalidate_from_roots(true, move |n| match n {
                NodeKey::FileState(p) => paths.contains(p),
                NodeKey::DirectoryListing(p) => parents.contains(p) || paths.contains(p),
                _ => false,
            });
        self.record_invalidation(result);
    }

    async fn evaluate_many(
        &self,
        keys: Vec<NodeKey>,
        keep_going: bool,
        progress: &FanOut,
    ) -> Result<EvaluationResult, FacadeError> {
        if self.is_cancelled() {
            return Err(FacadeError::Interrupted);
        }

        let context = self.context();
        let mut result = BTreeMap::new();

        if keep_going {
            // Cancellation is checked once up front rather than mid-batch: every key in the batch
            // has already been dispatched to the executor by the time any one of them could
            // observe the flag, so there is no finer-grained point to cut in.
            let futures = keys.into_iter().map(|key| {
                let context = context.clone();
                let key_for_progress = key.clone();
                progress.node_started(&key_for_progress);
                async move {
                    let (outcome, was_rerun) =
                        self.graph.create_with_outcome(key.clone(), &context).await;
                    (key, outcome, was_rerun)
                }
            });
            for (key, outcome, was_rerun) in futures::future::join_all(futures).await {
                self.report_and_record(&key, outcome, was_rerun, progress, &mut result);
            }
        } else {
            for key in keys {
                if self.is_cancelled() {
                    return Err(FacadeError::Interrupted);
                }
                progress.node_started(&key);
                let (outcome, was_rerun) =
                    self.graph.create_with_outcome(key.clone(), &context).await;
                let is_err = outcome.is_err();
                self.report_and_record(&key, outcome, was_rerun, progress, &mut result);
                if is_err {
                    break;
                }
            }
        }

        Ok(result)
    }

    fn report_and_record(
        &self,
        key: &NodeKey,
        outcome: Result<NodeValue, EngineError>,
        was_rerun: bool,
        progress: &FanOut,
        result: &mut EvaluationResult,
    ) {
        if let Err(EngineError::Cyclic(participants)) = &outcome {
            let cycle = CycleInfo::new(participants.clone());
            if let Some(diagnostic) = self.cycle_reporter.report(key, &cycle) {
                log::error!("{diagnostic}");
                self.metrics
                    .cycles_detected
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let progress_outcome = match (&outcome, was_rerun) {
            (Ok(_), true) => Outcome::BuiltFresh,
            (Ok(_), false) => Outcome::ReusedClean,
            (Err(_), _) => Outcome::Failed,
        };
        progress.node_finished(key, progress_outcome);
        result.insert(key.clone(), outcome);
    }

    ///
    /// Drives the evaluator for the `ConfigurationCollection` singleton (§4.7
    /// `evaluate_configurations`), returning the built configuration.
    ///
    pub async fn evaluate_configurations(
        &self,
        keep_going: bool,
    ) -> Result<NodeValue, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let result = self
            .evaluate_many(
                vec![NodeKey::ConfigurationCollection],
                keep_going,
                &self.analysis_progress,
            )
            .await?;
        result
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .expect("requested exactly one key")
            .map_err(FacadeError::from)
    }

    ///
    /// Evaluates one `Package` key per target pattern (§4.7 `evaluate_target_patterns`).
    ///
    pub async fn evaluate_target_patterns(
        &self,
        patterns: &[String],
        keep_going: bool,
    ) -> Result<EvaluationResult, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let keys = patterns
            .iter()
            .map(|p| NodeKey::Package(p.clone()))
            .collect();
        let result = self
            .evaluate_many(keys, keep_going, &self.analysis_progress)
            .await?;
        if !keep_going {
            if let Some((_, Err(err))) = result.iter().find(|(_, v)| v.is_err()) {
                return Err(FacadeError::from(err.clone()));
            }
        }
        Ok(result)
    }

    ///
    /// Builds configured-target values (§4.7 `analyze`).
    ///
    pub async fn analyze(
        &self,
        targets: &[(String, String)],
        keep_going: bool,
    ) -> Result<EvaluationResult, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let keys = targets
            .iter()
            .map(|(address, configuration)| NodeKey::ConfiguredTarget {
                address: address.clone(),
                configuration: configuration.clone(),
            })
            .collect();
        self.evaluate_many(keys, keep_going, &self.analysis_progress)
            .await
    }

    ///
    /// Builds artifact values (§4.7 `execute`): installs the execution-phase progress receiver and
    /// runs with the execution worker-pool sizing from `BuildOptions`.
    ///
    pub async fn execute(
        &self,
        actions: &[String],
        keep_going: bool,
    ) -> Result<EvaluationResult, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        info!(
            "Executing {} action(s) with {} workers",
            actions.len(),
            self.options.num_threads_execution
        );
        let keys = actions
            .iter()
            .map(|id| NodeKey::ActionExecution(id.clone()))
            .collect();
        self.evaluate_many(keys, keep_going, &self.execution_progress)
            .await
    }

    ///
    /// Rebuilds the evaluator from scratch (§4.7 `reset`): a fresh `Graph`, a cleared cycle-report
    /// memo, and reinjection of the constant build variables.
    ///
    pub fn reset(&mut self) {
        self.graph = graph::Graph::new_with_invalidation_delay(
            self.executor.clone(),
            std::time::Duration::from_millis(self.options.invalidation_delay_ms),
        );
        self.cycle_reporter.reset();
        self.engine_context.clear_deleted_packages();
        self.inject_constant_build_variables();
        self.cancel = AsyncLatch::new();
    }

    pub fn invalidate_errors(&self) {
        let context = self.context();
        let result = self.graph.invalidate_errors(&context);
        self.record_invalidation(result);
    }

    pub fn drop_configured_targets(&self) {
        let result = self
            .graph
            .invalidate_from_roots(true, |n| matches!(n, NodeKey::ConfiguredTarget { .. }));
        self.record_invalidation(result);
    }

    pub fn invalidate_configuration_collection(&self) {
        let result = self
            .graph
            .invalidate_from_roots(true, |n| matches!(n, NodeKey::ConfigurationCollection));
        self.record_invalidation(result);
    }

    ///
    /// Declares `package` deleted: the next evaluation of its `Package` key fails with
    /// `NoSuchPackage`, regardless of what's still on disk. Reverting (via `unmark_package_deleted`)
    /// restores the prior behavior without forcing a re-parse if the underlying files are
    /// unchanged, since the change-pruning check in §4.4.4 applies to the dependents either way.
    ///
    pub fn set_deleted_packages(&self, packages: &[String]) {
        for package in packages {
            self.engine_context.mark_package_deleted(package.clone());
        }
        let deleted: std::collections::HashSet<String> = packages.iter().cloned().collect();
        let result = self
            .graph
            .invalidate_from_roots(true, move |n| match n {
                NodeKey::Package(name) => deleted.contains(name),
                _ => false,
            });
        self.record_invalidation(result);
    }

    pub fn unset_deleted_packages(&self, packages: &[String]) {
        for package in packages {
            self.engine_context.unmark_package_deleted(package);
        }
        let restored: std::collections::HashSet<String> = packages.iter().cloned().collect();
        let result = self
            .graph
            .invalidate_from_roots(true, move |n| match n {
                NodeKey::Package(name) => restored.contains(name),
                _ => false,
            });
        self.record_invalidation(result);
    }

    ///
    /// Approximates §4.7's `delete_old_nodes(window)`: evicts every currently-failing node. This
    /// engine's `Entry` doesn't track the graph version a node was last dirtied at, so `window` is
    /// accepted for interface fidelity but not consulted; see DESIGN.md.
    ///
    pub fn delete_old_nodes(&self, _window: u64) {
        let context = self.context();
        let result = self.graph.invalidate_errors(&context);
        self.record_invalidation(result);
    }

    pub async fn get_configured_target(
        &self,
        address: &str,
        configuration: &str,
    ) -> Result<NodeValue, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let context = self.context();
        self.graph
            .create(
                NodeKey::ConfiguredTarget {
                    address: address.to_string(),
                    configuration: configuration.to_string(),
                },
                &context,
            )
            .await
            .map_err(FacadeError::from)
    }

    pub async fn get_generating_action(&self, artifact: &str) -> Result<NodeValue, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let context = self.context();
        self.graph
            .create(NodeKey::ActionExecution(artifact.to_string()), &context)
            .await
            .map_err(FacadeError::from)
    }

    pub async fn get_package(&self, id: &str) -> Result<NodeValue, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let context = self.context();
        self.graph
            .create(NodeKey::Package(id.to_string()), &context)
            .await
            .map_err(FacadeError::from)
    }

    pub async fn get_workspace_status_artifacts(&self) -> Result<NodeValue, FacadeError> {
        let _permit = self.evaluate_lock.lock().await;
        let context = self.context();
        self.graph
            .create(
                NodeKey::BuildVariable(build_variables::WORKSPACE_STATUS_ACTION.to_string()),
                &context,
            )
            .await
            .map_err(FacadeError::from)
    }

    pub fn graph_version(&self) -> u64 {
        self.graph.version()
    }

    pub fn visualize(&self, roots: &[NodeKey], path: &Path) -> std::io::Result<()> {
        let context = self.context();
        self.graph.visualize(roots, path, &context)
    }
}

///
/// Runs `f` to completion regardless of the surrounding task's cancellation: a plain `await` on a
/// local future already has this property (dropping the enclosing future doesn't reach in and
/// cancel `f` independently), so this exists only to name the call sites where that guarantee is
/// load-bearing rather than incidental.
///
pub async fn call_uninterruptibly<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    f.await
}
