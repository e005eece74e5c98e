//! Captures log records emitted on the current thread so tests can assert on them.

use std::cell::RefCell;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String, String)>> = const { RefCell::new(Vec::new()) };
}

struct Capture;

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS.with(|records| {
            records.borrow_mut().push((
                record.level(),
                record.target().to_string(),
                record.args().to_string(),
            ))
        });
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;
static INIT: Once = Once::new();

/// Install the capturing logger (once per process) and forget anything this
/// thread logged so far.
pub fn start() {
    INIT.call_once(|| {
        if log::set_logger(&CAPTURE).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    RECORDS.with(|records| records.borrow_mut().clear());
}

/// Drain what this thread logged from `target`'s module since the last call.
pub fn take(target: &str) -> Vec<(Level, String)> {
    RECORDS.with(|records| {
        records
            .borrow_mut()
            .drain(..)
            .filter(|(_, t, _)| t == target)
            .map(|(level, _, message)| (level, message))
            .collect()
    })
}
