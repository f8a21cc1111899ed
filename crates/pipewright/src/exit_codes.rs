//! Exit codes for the CLI

/// Success
pub const SUCCESS: i32 = 0;

/// General error, including a failed task
pub const ERROR: i32 = 1;

/// The pipeline could not be loaded or its configuration was rejected
pub const CONFIG_ERROR: i32 = 2;
