//! CTP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the CTP ingestion workspace.
//!
//! # Overview
//!
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Keys**: deterministic surrogate keys for normalized tables
//!
//! # Example
//!
//! ```no_run
//! use ctp_common::keys::surrogate_key;
//! use ctp_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!
//!     let study_key = surrogate_key(&[Some("NCT00000102")]);
//!     tracing::info!(%study_key, "Derived study key");
//!     Ok(())
//! }
//! ```

pub mod keys;
pub mod logging;

pub use keys::surrogate_key;
