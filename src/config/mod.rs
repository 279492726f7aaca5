//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ReactorConfig (validated, immutable)
//!     → runtime.rs (NetConfig: durations, resolver, trust store)
//!     → shared via SchedulerHandle (ArcSwap) to all workers
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - The runtime view can be swapped while a scheduler is running

pub mod loader;
pub mod runtime;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use runtime::NetConfig;
pub use schema::ReactorConfig;
