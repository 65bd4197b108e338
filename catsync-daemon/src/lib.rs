//! catsync daemon: settings, the desired-state feed, and a runtime that
//! runs the cache and the syncer side by side.

mod error;
mod runtime;
pub mod settings;
pub mod source;

pub use error::DaemonError;
pub use runtime::{
    init_tracing, start, start_blocking, DaemonStatus, RuntimeHandle, SourceStats,
};
pub use settings::{load_at, Settings};
pub use source::{load_registrations_at, SourceError, SourceUpdate};
