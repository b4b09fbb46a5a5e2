// Public modules
pub mod credential;
pub mod defaults;
pub mod error;
pub mod orchestrator;
pub mod release;
pub mod run;
pub mod ssh;
pub mod step;
pub mod target;
pub mod trigger;

// Internal modules - not part of public API
pub(crate) mod config;
pub(crate) mod paths;
pub(crate) mod store;

// Re-export common types for convenience
pub use config::read_json_spec_to_string;
pub use error::{Error, ErrorCode, Result};
