// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The ambient logging stack for the evaluator and its façade: a `log`-compatible global logger
//! (§C5's progress hooks, and every other component, log through it) plus the `fatal_log!`
//! bypass for code paths that must not risk re-entering the logging system.

///
/// Logs a line to `fatal.log`, bypassing the standard logging system entirely. Useful for code
/// paths that must not interact with the logger (e.g. while the logger itself is panicking).
///
#[macro_export]
macro_rules! fatal_log {
    ($($arg:tt)+) => {
      {
        use ::std::io::Write;
        let mut f = ::std::fs::OpenOptions::new().create(true).append(true).open("fatal.log").unwrap();
        writeln!(f, $($arg)+).unwrap()
      }
    };
}

pub mod logger;

pub use crate::logger::EngineLogger;

/// Installs `EngineLogger` as the global `log` logger at the given level. Safe to call more than
/// once; later calls are no-ops (matching `log::set_logger`'s own "first one wins" semantics).
pub fn init(level: log::LevelFilter, use_color: bool) {
    EngineLogger::init(level, use_color);
}
