//! Structured query federation
//!
//! A [`structured::StructuredQuery`] is resolved sub-query by sub-query:
//! [`routing`] finds the physical tables and proxies, [`builder`] turns each
//! proxy group into a [`builder::PhysicalQuery`], and the results are
//! collected into a [`reference::QueryReference`]. The merge formula is then
//! translated to PromQL ([`promql`]) and backend output is normalized by
//! [`result`].

pub mod builder;
pub mod condition;
pub mod context;
pub mod downsample;
pub mod error;
pub mod promql;
pub mod reference;
pub mod result;
pub mod routing;
pub mod structured;
pub mod time;

pub use context::QueryContext;
pub use error::{QuerierError, Result};
