//! # Mockbus Shared Library
//!
//! Shared utilities for the mockbus test harnesses. This crate provides the
//! common error taxonomy and the logging bootstrap used by the transport, the
//! mock service queue and the signal logger.
//!
//! ## Features
//!
//! - **Error Handling**: A single error type for recoverable setup and call failures
//! - **Logging**: `tracing` subscriber setup tuned for the test harness
//!
//! ## Design Principles
//!
//! - **Recoverable vs. fatal**: Setup failures are returned as values; broken
//!   test expectations are panics raised by the harness crates
//! - **Thread Safety**: All error types are `Send + Sync`

pub mod error;
pub mod logging;

// Re-export commonly used types for convenience
pub use error::{MockBusError, Result};
pub use logging::{init_logging, init_test_logging, LogLevel};
