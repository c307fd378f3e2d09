//! Services consumed from the host process.
//!
//! The monitor only talks to the operating system through these traits, so
//! the recovery logic can run against scripted hosts in tests.

mod system;

use std::time::Duration;

use crate::error::Result;

pub use system::{SystemHost, SystemModules};

/// Base address of a module loaded in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Module lookup and import-table redirection
pub trait Modules {
    /// Find a module that is already loaded. Never loads anything.
    fn find_loaded(&self, name: &str) -> Option<ModuleHandle>;

    /// Resolve an exported symbol to a callable address.
    fn resolve_symbol(&self, module: ModuleHandle, symbol: &str) -> Option<usize>;

    /// Point every loaded module's import of `module!symbol` at `replacement`.
    ///
    /// Returns the displaced import entries.
    fn redirect_import(&self, module: &str, symbol: &str, replacement: usize)
    -> Result<Vec<usize>>;
}

/// Bounded wait that wakes early when input is queued for the calling thread
pub trait EventPump {
    fn wait_for_events(&self, timeout: Duration);
}

/// Fire-and-forget user notification
pub trait Notifier {
    fn notify_unrecoverable(&self, title: &str, text: &str);
}

/// Everything the recovery loop needs from the host
pub trait Host: EventPump + Notifier + Send + Sync {}

impl<T: EventPump + Notifier + Send + Sync> Host for T {}
