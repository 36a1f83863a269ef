//! Opaque settings / benchmark-cache store.
//!
//! The surrounding application persists option defaults and autotune
//! results; the core only ever sees a string key-value map and treats every
//! access as best effort. A missing or failing store costs a benchmark
//! re-run, never a conversion.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Best-effort key-value persistence supplied by the embedding application.
pub trait SettingsStore: Send + Sync {
    /// Fetch a value; `None` for missing keys or any backing failure.
    fn get(&self, key: &str) -> Option<String>;
    /// Store a value; silently dropped on backing failure.
    fn put(&self, key: &str, value: &str);
}

/// In-memory store used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemorySettings {
    map: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> MemorySettings {
        MemorySettings::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_owned(), value.to_owned());
    }
}
