use std::sync::{Mutex, MutexGuard};

pub mod bulk;
pub mod commands;
pub mod config;
pub mod estimators;
pub mod event_models;
pub mod immunity;
pub mod monitor;
pub mod parser;
pub mod pipeline;
pub mod store;

pub use config::AppConfig;
pub use event_models::{AttackOutcome, GameEvent, SaveKind};
pub use parser::LogParser;
pub use store::{DataStore, TimeTrackingMode};

/// Lock a shared component, recovering the guard when a panicked thread
/// left the mutex poisoned.
pub fn lock_shared<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
