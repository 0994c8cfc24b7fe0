//! Report-once bookkeeping for recurring errors.
//!
//! Some conditions repeat for every task once they happen (a worker missing
//! a handler, a stray peer speaking for another master). The first
//! occurrence is logged at `warn`; repeats drop to `debug`.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What kind of recurring condition was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKey {
    /// A task named a handler the worker does not have.
    UnknownHandler(String),
    /// A result arrived stamped with another master's id.
    ForeignMaster(String),
    /// A result arrived for a task that is no longer in flight.
    StaleResult(String),
}

/// Tracks which error keys have been reported.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    reported: Mutex<HashMap<ErrorKey, bool>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `message` for `key`. Returns true the first time `key` is seen.
    pub fn report_once(&self, key: ErrorKey, message: &str) -> bool {
        let first = {
            let mut reported = self.reported.lock();
            let flag = reported.entry(key).or_insert(false);
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        };

        if first {
            warn!("{}", message);
        } else {
            debug!("{} (repeated)", message);
        }
        first
    }

    pub fn was_reported(&self, key: &ErrorKey) -> bool {
        self.reported.lock().get(key).copied().unwrap_or(false)
    }

    /// Forget a key so its next occurrence is reported again.
    pub fn reset(&self, key: &ErrorKey) {
        if let Some(flag) = self.reported.lock().get_mut(key) {
            *flag = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_first_report_warns() {
        let reporter = ErrorReporter::new();
        let key = ErrorKey::UnknownHandler("propagate".into());

        assert!(!reporter.was_reported(&key));
        assert!(reporter.report_once(key.clone(), "no handler named 'propagate'"));
        assert!(!reporter.report_once(key.clone(), "no handler named 'propagate'"));
        assert!(reporter.was_reported(&key));
        assert!(logs_contain("WARN"));
        assert!(logs_contain("(repeated)"));

        reporter.reset(&key);
        assert!(reporter.report_once(key, "no handler named 'propagate'"));
    }

    #[test]
    fn test_keys_are_independent() {
        let reporter = ErrorReporter::new();
        assert!(reporter.report_once(ErrorKey::ForeignMaster("a".into()), "a"));
        assert!(reporter.report_once(ErrorKey::ForeignMaster("b".into()), "b"));
        assert!(reporter.report_once(ErrorKey::StaleResult("a".into()), "a"));
    }
}
