//! Global logger (SPEC_FULL.md §2.2).
//!
//! Wraps an `env_logger::Logger` so console formatting is exactly what
//! `env_logger::init()` would have produced, and additionally relays
//! every record onto the event bus as a `log` event (subject `None`):
//! the `log_debug`/`log_info`/`log_warning`/`log_error` plugins listen
//! for it to echo matching-level lines to attached clients, grounded on
//! Kalisko's global `log` hook (`ircpp_log.c`).

use std::sync::Arc;

use log::{Level, Log, Metadata, Record};

use crate::bus::{Arg, EventArgs, EventBus};

pub const EVENT_LOG: &str = "log";

struct BusLogger {
    inner: env_logger::Logger,
    bus: Arc<EventBus>,
}

impl Log for BusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.inner.log(record);

        let level_name = match record.level() {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };
        self.bus.trigger(
            None,
            EVENT_LOG,
            &EventArgs::of(vec![
                Arg::Text(level_name.to_string()),
                Arg::Text(record.args().to_string()),
            ]),
        );
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Installs the process-global logger. Must be called at most once,
/// before any `log::*!` call — same contract as `env_logger::init`.
pub fn init(bus: Arc<EventBus>) {
    let inner = env_logger::Builder::from_default_env().build();
    let max_level = inner.filter();
    log::set_max_level(max_level);
    if log::set_boxed_logger(Box::new(BusLogger { inner, bus })).is_err() {
        eprintln!("logger already installed, skipping");
    }
}
