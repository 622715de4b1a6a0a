//! Configuration module for the converge engine.
//!
//! This module handles everything about the desired-state document:
//! - Parsing and deserializing `converge.yaml`, with environment overrides
//! - Validation of document values
//! - Computing desired-state hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    DesiredStateDocument, EngineSettings, FailurePolicy, ProjectConfig, ProviderConfig,
    ProviderKind, RetrySettings, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
