//! # Utility Modules
//!
//! Helpers shared by the polling engine and the service loop.

pub mod logging;

pub use logging::{LogThrottle, ThrottleManager};
