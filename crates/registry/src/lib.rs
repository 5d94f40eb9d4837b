//! # Refork Registry
//!
//! Durable metadata about indexed sessions and the user's fork choices.
//!
//! The registry owns session rows; the vector store owns chunk bodies. Both
//! stay consistent because every chunk mutation and its registry write
//! happen under the indexer's per-session lock, and chunk counts reconcile
//! against the store on boot.

mod error;
mod fork_history;
mod preference;
mod registry;

pub use error::{RegistryError, Result};
pub use fork_history::{ForkEvent, ForkHistory, FORK_HISTORY_CAP};
pub use preference::{PreferenceRecord, PreferenceService};
pub use registry::{RegistryStats, SessionFilter, SessionMetadata, SessionRegistry, SessionUpdate};
