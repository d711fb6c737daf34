//! Switchable logging macros scoped to a module.
//!
//! Every module that uses them defines two constants:
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//! const LOG_TARGET: &str = "audit::store";
//!
//! use crate::{log_info, log_warn};
//! log_info!("saved observation {id}");
//! ```
//!
//! `LOG_TARGET` becomes the `log` target, so `RUST_LOG=audit::reconcile=debug`
//! narrows output to a single component regardless of the Rust module path.

/// Info-level log under the calling module's `LOG_TARGET`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!(target: LOG_TARGET, $($arg)*);
        }
    };
}

/// Warn-level log under the calling module's `LOG_TARGET`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!(target: LOG_TARGET, $($arg)*);
        }
    };
}

/// Error-level log under the calling module's `LOG_TARGET`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!(target: LOG_TARGET, $($arg)*);
        }
    };
}

/// Debug-level log under the calling module's `LOG_TARGET`.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!(target: LOG_TARGET, $($arg)*);
        }
    };
}
