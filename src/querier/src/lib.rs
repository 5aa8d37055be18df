//! Time-series query federation and translation.
//!
//! Structured multi-metric queries are routed to physical storages,
//! translated to PromQL and executed through pluggable backend instances.

pub mod catalog;
pub mod instance;
pub mod query;
pub mod services;

pub use catalog::InMemoryCatalog;
pub use instance::{InMemoryStorageRegistry, Instance, QueryExpand, StorageRegistry};
pub use query::{QuerierError, QueryContext};
pub use services::{Collaborators, QueryService};
