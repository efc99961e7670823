// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Key half of the Key/Value registry (§3 "Key", §4.1) and the pure functions that compute
//! each family's Value: `NodeKey` is the tagged union of key families, and `impl graph::Node for
//! NodeKey` is the dispatcher that the evaluator (C4) calls to run one.
//!
//! The registry's concrete functions (how a `Package` is actually parsed, how an `ActionExecution`
//! actually runs a process) are not specified: this engine only owns scheduling, memoization, and
//! invalidation. What's implemented below are small, deterministic stand-ins, grounded in the same
//! "declared dependency" shape the graph crate's own `TNode::Sum` test fixture uses: a family's
//! dependencies come from a side-table (`EngineContext::deps`) keyed on the requesting `NodeKey`,
//! not from fields baked into the key itself.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use graph::{Context, Node, NodeError};
use parking_lot::Mutex;

use crate::value::{FileStateValue, NodeValue};

/// Ambient data threaded through every `NodeKey::run`: the pieces of `options::BuildOptions` the
/// registry functions need, plus the declared-dependency side-table that stands in for the (out of
/// scope) BUILD-file/action-graph parser. Both maps are mutable behind a lock so that the façade
/// (C7) can inject build variables and register target dependencies between evaluations without
/// rebuilding the whole Context.
#[derive(Clone)]
pub struct EngineContext {
    pub build_root: PathBuf,
    pub build_variables: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    pub deps: Arc<Mutex<HashMap<NodeKey, Vec<NodeKey>>>>,
    pub deleted_packages: Arc<Mutex<HashSet<String>>>,
}

impl EngineContext {
    pub fn new(build_root: PathBuf) -> Self {
        EngineContext {
            build_root,
            build_variables: Arc::new(Mutex::new(HashMap::default())),
            deps: Arc::new(Mutex::new(HashMap::default())),
            deleted_packages: Arc::new(Mutex::new(HashSet::default())),
        }
    }

    pub fn set_build_variable(&self, name: impl Into<String>, value: serde_json::Value) {
        self.build_variables.lock().insert(name.into(), value);
    }

    pub fn get_build_variable(&self, name: &str) -> Option<serde_json::Value> {
        self.build_variables.lock().get(name).cloned()
    }

    pub fn set_declared_deps(&self, key: NodeKey, deps: Vec<NodeKey>) {
        self.deps.lock().insert(key, deps);
    }

    fn declared_deps(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.deps.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn mark_package_deleted(&self, package: impl Into<String>) {
        self.deleted_packages.lock().insert(package.into());
    }

    pub fn unmark_package_deleted(&self, package: &str) {
        self.deleted_packages.lock().remove(package);
    }

    pub fn clear_deleted_packages(&self) {
        self.deleted_packages.lock().clear();
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum NodeKey {
    BuildVariable(String),
    FileState(PathBuf),
    DirectoryListing(PathBuf),
    Package(String),
    ConfiguredTarget { address: String, configuration: String },
    ActionExecution(String),
    /// The singleton key the façade's `evaluate_configurations` drives: the built configuration,
    /// assembled from the `default-visibility` and `test-environment-variables` build variables.
    ConfigurationCollection,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::BuildVariable(name) => write!(f, "BuildVariable({name})"),
            NodeKey::FileState(path) => write!(f, "FileState({})", path.display()),
            NodeKey::DirectoryListing(path) => write!(f, "DirectoryListing({})", path.display()),
            NodeKey::Package(name) => write!(f, "Package({name})"),
            NodeKey::ConfiguredTarget { address, configuration } => {
                write!(f, "ConfiguredTarget({address}@{configuration})")
            }
            NodeKey::ActionExecution(id) => write!(f, "ActionExecution({id})"),
            NodeKey::ConfigurationCollection => write!(f, "ConfigurationCollection"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("no such package: {0}")]
    NoSuchPackage(String),
    #[error("build file contains errors: {0}")]
    BuildFileContainsErrors(String),
    #[error("{0}")]
    Io(String),
    #[error("dependency cycle among {} participant(s)", .0.len())]
    Cyclic(Vec<NodeKey>),
    #[error("value was invalidated while awaited")]
    Invalidated,
    #[error("{0}")]
    Generic(String),
}

impl NodeError for EngineError {
    fn invalidated() -> Self {
        EngineError::Invalidated
    }

    fn generic(message: String) -> Self {
        EngineError::Generic(message)
    }
}

#[async_trait]
impl Node for NodeKey {
    type Context = EngineContext;
    type Item = NodeValue;
    type Error = EngineError;

    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error> {
        match &self {
            NodeKey::BuildVariable(name) => {
                let value = context
                    .get_build_variable(name)
                    .ok_or_else(|| EngineError::Generic(format!("no such build variable: {name}")))?;
                Ok(NodeValue::BuildVariable(Arc::new(value)))
            }

            NodeKey::FileState(path) => {
                let full_path = context.build_root.join(path);
                let state = match std::fs::symlink_metadata(&full_path) {
                    Ok(meta) if meta.is_dir() => FileStateValue::Directory,
                    Ok(meta) => {
                        let mtime_secs = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);
                        FileStateValue::File { len: meta.len(), mtime_secs }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileStateValue::Missing,
                    Err(err) => return Err(EngineError::Io(err.to_string())),
                };
                Ok(NodeValue::FileState(state))
            }

            NodeKey::DirectoryListing(path) => {
                // Depend on the directory's own FileState so that an invalidated directory
                // (deleted, replaced with a file) dirties the listing too.
                context.get(NodeKey::FileState(path.clone())).await?;

                let full_path = context.build_root.join(path);
                let mut names: Vec<String> = std::fs::read_dir(&full_path)
                    .map_err(|err| EngineError::Io(err.to_string()))?
                    .map(|entry| {
                        entry
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .map_err(|err| EngineError::Io(err.to_string()))
                    })
                    .collect::<Result<_, _>>()?;
                names.sort();
                Ok(NodeValue::DirectoryListing(Arc::new(names)))
            }

            NodeKey::Package(name) => {
                if context.deleted_packages.lock().contains(name) {
                    return Err(EngineError::NoSuchPackage(name.clone()));
                }

                let package_dir = PathBuf::from(name.replace(':', "/"));
                let listing = context.get(NodeKey::DirectoryListing(package_dir)).await?;
                let target_names: Vec<String> = listing
                    .as_directory_listing()
                    .unwrap_or(&[])
                    .iter()
                    .filter(|n| !n.starts_with('.'))
                    .cloned()
                    .collect();

                // A Package with no declared targets and an empty directory is an error: it isn't
                // a package at all.
                if target_names.is_empty() && context.declared_deps(&self).is_empty() {
                    return Err(EngineError::NoSuchPackage(name.clone()));
                }

                let body = serde_json::json!({ "targets": target_names });
                Ok(NodeValue::Package(Arc::new(body)))
            }

            NodeKey::ConfiguredTarget { address, configuration } => {
                let package_name = address.split(':').next().unwrap_or(address).to_string();
                context.get(NodeKey::Package(package_name)).await?;

                let mut dep_results = BTreeMap::new();
                for dep in context.declared_deps(&self) {
                    let dep_label = dep.to_string();
                    let value = context.get(dep).await?;
                    if let Some(json) = value.as_json() {
                        dep_results.insert(dep_label, json.clone());
                    }
                }

                let body = serde_json::json!({
                    "address": address,
                    "configuration": configuration,
                    "dependencies": dep_results,
                });
                Ok(NodeValue::ConfiguredTarget(Arc::new(body)))
            }

            NodeKey::ActionExecution(_id) => {
                let mut inputs = Vec::new();
                for dep in context.declared_deps(&self) {
                    let value = context.get(dep.clone()).await?;
                    inputs.push((dep.to_string(), value.as_json().cloned()));
                }
                inputs.sort_by(|a, b| a.0.cmp(&b.0));

                let digest = format!("{:x}", fnv_hash(&inputs));
                let body = serde_json::json!({ "digest": digest, "input_count": inputs.len() });
                Ok(NodeValue::ActionResult(Arc::new(body)))
            }

            NodeKey::ConfigurationCollection => {
                let visibility = context
                    .get(NodeKey::BuildVariable("default-visibility".to_string()))
                    .await?;
                let test_env = context
                    .get(NodeKey::BuildVariable("test-environment-variables".to_string()))
                    .await?;
                let body = serde_json::json!({
                    "default_visibility": visibility.as_json().cloned(),
                    "test_environment_variables": test_env.as_json().cloned(),
                });
                Ok(NodeValue::ConfigurationCollection(Arc::new(body)))
            }
        }
    }

    fn cyclic_error(path: &[&Self]) -> Self::Error {
        EngineError::Cyclic(path.iter().map(|&n| n.clone()).collect())
    }
}

fn fnv_hash(inputs: &[(String, Option<serde_json::Value>)]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for (label, value) in inputs {
        for byte in label.bytes().chain(value.as_ref().map(|v| v.to_string()).unwrap_or_default().bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}
