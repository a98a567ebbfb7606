//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NodeConfig (validated, immutable)
//!     → handed to the channel at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → daemon swaps its ArcSwap<NodeConfig>
//!     → hot-reloadable settings (admission limit) applied in place
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Socket-level settings need a restart; only limits are live

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ConnectorConfig, InterceptorConfig, MembershipConfig, NodeConfig, ObservabilityConfig,
    SenderConfig,
};
pub use validation::{validate_config, ValidationError};
