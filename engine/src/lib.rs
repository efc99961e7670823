// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

//! The build-system orchestrator's driver façade (C7) and its key/value registry (C1): this crate
//! sits on top of `graph` (C2/C3, the memoizing dependency graph) and wires a concrete key family
//! (`NodeKey`), a progress receiver (C5), and a cycle reporter (C6) into the single stateful
//! `Facade` object a caller actually holds.

pub mod cycles;
pub mod facade;
pub mod key;
pub mod progress;
pub mod value;

pub use crate::cycles::{CycleInfo, CycleReporter};
pub use crate::facade::{build_variables, EvaluationResult, Facade, FacadeError};
pub use crate::key::{EngineContext, EngineError, NodeKey};
pub use crate::progress::{Counters, FanOut, Outcome, ProgressReceiver};
pub use crate::value::{FileStateValue, NodeValue};

#[cfg(test)]
mod tests;
