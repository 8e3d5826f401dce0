//! A pluggable eight-level log sink table, installed once as the process's
//! `log::Log` implementor so that ordinary `log::info!`/`log::warn!`/etc.
//! call sites throughout this crate (mirroring the teacher's own use of the
//! `log` facade in `adapter.rs`/`gatt/local.rs`) reach whatever sinks the
//! host has registered, while still letting the host install per-level
//! sinks independently of any particular logging framework (syslog,
//! journald, or nothing at all).

use std::sync::RwLock;

/// The eight levels a host may hook independently. `Debug`/`Verbose`/`Info`/
/// `Status`/`Warning`/`Error`/`Fatal` correspond to increasingly severe
/// diagnostic output; `Always` is reserved for lines that should reach the
/// host regardless of any level-based filtering it applies downstream.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(usize)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Status = 3,
    Warning = 4,
    Error = 5,
    Fatal = 6,
    Always = 7,
}

const NUM_LEVELS: usize = 8;

/// A sink function: receives the rendered log line.
pub type SinkFn = Box<dyn Fn(&str) + Send + Sync>;

struct SinkTable {
    slots: RwLock<[Option<SinkFn>; NUM_LEVELS]>,
}

fn empty_slots() -> [Option<SinkFn>; NUM_LEVELS] {
    [None, None, None, None, None, None, None, None]
}

lazy_static::lazy_static! {
    static ref TABLE: SinkTable = SinkTable { slots: RwLock::new(empty_slots()) };
}

/// Installs (or clears, passing `None`) the sink for one level.
pub fn register(level: LogLevel, sink: Option<SinkFn>) {
    TABLE.slots.write().expect("sink table poisoned")[level as usize] = sink;
}

/// Removes every registered sink, restoring the default (silent) state.
pub fn clear_all() {
    *TABLE.slots.write().expect("sink table poisoned") = empty_slots();
}

/// Forwards `line` to the sink registered for `level`, if any.
pub fn dispatch(level: LogLevel, line: &str) {
    if let Some(sink) = &TABLE.slots.read().expect("sink table poisoned")[level as usize] {
        sink(line);
    }
}

fn map_log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warning,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Verbose,
    }
}

/// Bridges the standard `log` facade onto the sink table, so that
/// `log::info!`/`log::warn!`/etc. call sites reach whatever per-level sinks
/// the host installed via [`register`].
struct SinkTableLogger;

impl log::Log for SinkTableLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        dispatch(map_log_level(record.level()), &format!("{}", record.args()));
    }

    fn flush(&self) {}
}

/// Installs the sink-table bridge as the global `log` logger. Idempotent:
/// subsequent calls after the first are no-ops (the `log` crate only
/// accepts one logger per process).
pub fn install() {
    let _ = log::set_boxed_logger(Box::new(SinkTableLogger)).map(|()| log::set_max_level(log::LevelFilter::Trace));
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn register_and_dispatch_routes_to_sink() {
        let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let captured2 = captured.clone();
        register(LogLevel::Status, Some(Box::new(move |line| captured2.lock().unwrap().push(line.to_string()))));
        dispatch(LogLevel::Status, "adapter selected");
        dispatch(LogLevel::Error, "should not appear in Status sink");
        assert_eq!(*captured.lock().unwrap(), vec!["adapter selected".to_string()]);
        register(LogLevel::Status, None);
    }

    #[test]
    fn clearing_a_slot_silences_it() {
        register(LogLevel::Warning, Some(Box::new(|_| panic!("should have been cleared"))));
        register(LogLevel::Warning, None);
        dispatch(LogLevel::Warning, "dropped silently");
    }

    #[test]
    fn clear_all_resets_every_slot() {
        register(LogLevel::Info, Some(Box::new(|_| panic!("should have been cleared"))));
        clear_all();
        dispatch(LogLevel::Info, "dropped silently");
    }
}
