//! Core types for corekeep
//!
//! This module holds the error taxonomy shared by every supervisor component and the
//! presentation helpers the CLI uses to render failures.
//!
//! ## Error Management
//! - **Strongly-typed errors** ([`SupervisorError`]) with a stable [`ErrorCode`] per variant
//! - **User-friendly contexts** ([`ErrorContext`]) with actionable suggestions for CLI users
//! - **Automatic conversion** from IO, HTTP, JSON, TOML and YAML errors
//!
//! # Examples
//!
//! ```rust,no_run
//! use corekeep::core::{SupervisorError, user_friendly_error};
//!
//! fn handle(result: anyhow::Result<()>) {
//!     if let Err(e) = result {
//!         user_friendly_error(e).display();
//!     }
//! }
//!
//! handle(Err(SupervisorError::NotInstalled.into()));
//! ```

pub mod error;

pub use error::{
    ErrorCode, ErrorContext, Result, SupervisorError, create_error_context, user_friendly_error,
};
