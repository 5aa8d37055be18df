//! PromQL support
//!
//! - [`parser`] - parsing, AST inspection and the in-place rewriter
//! - [`translator`] - selector, window and aggregation construction
//! - [`types`] - label matchers and backend series
//! - [`error`] - error types for PromQL operations

pub mod error;
pub mod parser;
pub mod translator;
pub mod types;

pub use error::PromQLError;
