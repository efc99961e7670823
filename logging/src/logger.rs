// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

const TIME_FORMAT_STR: &str = "%H:%M:%S%.3f";

fn engine_logger() -> &'static EngineLogger {
    static LOGGER: OnceLock<EngineLogger> = OnceLock::new();
    LOGGER.get_or_init(EngineLogger::new)
}

/// A minimal `log::Log` implementation: one line per record, colored by level when attached to a
/// terminal, with a wall-clock timestamp and the originating target. The evaluator and façade use
/// this directly rather than pulling in a full-featured logging framework, since their output
/// needs are a fixed format, not configurable sinks or filters beyond the level.
pub struct EngineLogger {
    use_color: AtomicBool,
    // Serializes writes so that concurrent evaluator workers don't interleave partial lines.
    lock: Mutex<()>,
}

impl EngineLogger {
    fn new() -> EngineLogger {
        EngineLogger {
            use_color: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    pub fn init(level: LevelFilter, use_color: bool) {
        let logger = engine_logger();
        logger.use_color.store(use_color, Ordering::SeqCst);
        log::set_max_level(level);
        if log::set_logger(logger).is_err() {
            log::debug!("Logging already initialized.");
        }
    }

    fn colorize(&self, level: Level, text: String) -> String {
        if !self.use_color.load(Ordering::SeqCst) {
            return text;
        }
        match level {
            Level::Error => text.red().to_string(),
            Level::Warn => text.yellow().to_string(),
            Level::Info => text.green().to_string(),
            Level::Debug => text.cyan().to_string(),
            Level::Trace => text.normal().to_string(),
        }
    }
}

impl Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = self.lock.lock();
        let now = chrono::Local::now().format(TIME_FORMAT_STR);
        let level = self.colorize(record.level(), format!("{:<5}", record.level()));
        eprintln!("{now} {level} {}] {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorize_noop_when_disabled() {
        let logger = EngineLogger::new();
        assert_eq!(logger.colorize(Level::Error, "boom".to_string()), "boom");
    }
}
