//! Shared plumbing for the CDU control services
//!
//! - logging bootstrap (console + daily rolling file)
//! - shutdown signal handling
//! - hex formatting for frame dumps

pub mod hex;
pub mod logging;
pub mod shutdown;

pub use logging::{init_logging, LogConfig, LogGuard};
pub use shutdown::wait_for_shutdown;
