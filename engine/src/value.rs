// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Value half of the Key/Value registry (§3 "Value", §4.1): a tagged union parallel to
//! `NodeKey`, with one variant per key family. The concrete payload of each family (what a parsed
//! package looks like, what an action result contains) is out of scope for this engine per §1, so
//! family payloads are represented generically as `serde_json::Value`, wrapped in `Arc` so that
//! cloning a large parsed value out of the graph is cheap.

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileStateValue {
    Missing,
    File { len: u64, mtime_secs: i64 },
    Directory,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeValue {
    FileState(FileStateValue),
    DirectoryListing(Arc<Vec<String>>),
    Package(Arc<serde_json::Value>),
    ConfiguredTarget(Arc<serde_json::Value>),
    ActionResult(Arc<serde_json::Value>),
    BuildVariable(Arc<serde_json::Value>),
    ConfigurationCollection(Arc<serde_json::Value>),
}

impl NodeValue {
    pub fn as_file_state(&self) -> Option<&FileStateValue> {
        match self {
            NodeValue::FileState(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_directory_listing(&self) -> Option<&[String]> {
        match self {
            NodeValue::DirectoryListing(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            NodeValue::Package(v)
            | NodeValue::ConfiguredTarget(v)
            | NodeValue::ActionResult(v)
            | NodeValue::BuildVariable(v)
            | NodeValue::ConfigurationCollection(v) => Some(v),
            _ => None,
        }
    }
}
