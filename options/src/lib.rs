// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Build-time configuration for the façade (§6 "Construct"): the handful of knobs that size the
//! evaluator's worker pools, set the keep-going default, and seed the build variables the façade
//! injects as graph roots before the first evaluation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("Failed to read options file {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse options file {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

///
/// Mirrors the subset of `pants.toml`-style configuration that the façade needs at construction
/// time. Everything else (target-language-specific subsystem options) is out of scope: this
/// engine only cares about the knobs that affect scheduling and invalidation.
///
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Root of the workspace being built; paths in `notify_modified_paths` are relative to this.
    pub build_root: PathBuf,
    /// Worker count for the configure/analyze phases. `0` means "use the number of CPUs".
    pub num_threads_analysis: usize,
    /// Worker count for the execute phase, sized larger to absorb I/O waits on action execution.
    pub num_threads_execution: usize,
    /// Default value of `keep_going` for `evaluate_*` calls that don't override it.
    pub keep_going: bool,
    /// How long (ms) `Graph::get` waits before retrying a Node that was invalidated mid-flight.
    pub invalidation_delay_ms: u64,
    /// Age (in graph versions) after which a Dirty node becomes eligible for `delete_old_nodes`.
    pub dirty_node_gc_window: u64,
    /// The `default-visibility` build variable.
    pub default_visibility: Vec<String>,
    /// The `test-environment-variables` build variable.
    pub test_environment_variables: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            build_root: PathBuf::from("."),
            num_threads_analysis: 0,
            num_threads_execution: 200,
            keep_going: false,
            invalidation_delay_ms: 500,
            dirty_node_gc_window: 100,
            default_visibility: vec!["PUBLIC".to_string()],
            test_environment_variables: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    pub fn from_toml_str(contents: &str) -> Result<BuildOptions, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn from_file(path: &Path) -> Result<BuildOptions, OptionsError> {
        let contents = std::fs::read_to_string(path).map_err(|err| OptionsError::Io {
            path: path.to_path_buf(),
            err,
        })?;
        Self::from_toml_str(&contents).map_err(|err| OptionsError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    pub fn resolved_num_threads_analysis(&self) -> usize {
        if self.num_threads_analysis == 0 {
            num_cpus()
        } else {
            self.num_threads_analysis
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = BuildOptions::default();
        assert_eq!(options.num_threads_execution, 200);
        assert!(!options.keep_going);
    }

    #[test]
    fn parses_partial_toml() {
        let options = BuildOptions::from_toml_str(
            r#"
            keep_going = true
            num_threads_analysis = 8
            "#,
        )
        .unwrap();
        assert!(options.keep_going);
        assert_eq!(options.num_threads_analysis, 8);
        // Unset fields fall back to their defaults.
        assert_eq!(options.num_threads_execution, 200);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(BuildOptions::from_toml_str("keep_going = not-a-bool").is_err());
    }
}
