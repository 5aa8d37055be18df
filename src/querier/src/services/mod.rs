pub mod query;

pub use query::{Collaborators, QueryService};
