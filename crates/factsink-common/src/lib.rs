//! Factsink Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the factsink workspace.
//!
//! # Overview
//!
//! - **Facts**: the [`Fact`] record that flows from intake to every sink
//! - **Error Handling**: [`FactError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by binaries
//!
//! # Example
//!
//! ```no_run
//! use factsink_common::{Fact, Result};
//!
//! fn parse_line(line: &str) -> Result<Fact> {
//!     let fact = Fact::from_json_str(line)?;
//!     Ok(fact)
//! }
//! ```

pub mod error;
pub mod fact;
pub mod logging;

// Re-export commonly used types
pub use error::{FactError, Result};
pub use fact::Fact;
