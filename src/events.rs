//! Load signals for notifying the UI about finished imports.
//!
//! Every `load_report` call ends with exactly one signal, delivered to all
//! registered listeners.

use serde::{Deserialize, Serialize};

/// Event name constant
pub const LOAD_FINISHED_EVENT: &str = "statement_load_finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadSignal {
    Completed,
    Failed,
}

/// Receiver of load signals (the UI refreshes its views on `Completed`).
pub trait LoadListener {
    fn load_completed(&self);
    fn load_failed(&self);
}

/// Deliver a load signal to every listener
pub fn emit_load_signal(listeners: &[Box<dyn LoadListener>], signal: LoadSignal) {
    log::debug!(
        "Event: {} {:?} to {} listener(s)",
        LOAD_FINISHED_EVENT,
        signal,
        listeners.len()
    );
    for listener in listeners {
        match signal {
            LoadSignal::Completed => listener.load_completed(),
            LoadSignal::Failed => listener.load_failed(),
        }
    }
}

/// Listener that records received signals, for tests and headless callers
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    signals: std::rc::Rc<std::cell::RefCell<Vec<LoadSignal>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<LoadSignal> {
        self.signals.borrow().clone()
    }
}

impl LoadListener for RecordingListener {
    fn load_completed(&self) {
        self.signals.borrow_mut().push(LoadSignal::Completed);
    }

    fn load_failed(&self) {
        self.signals.borrow_mut().push(LoadSignal::Failed);
    }
}
