//! Long-running DIMSE operations: query and retrieve tasks.
//!
//! A task owns one inbound request from start to finish. It registers
//! for cancel requests, streams pending responses while work remains,
//! and closes the exchange with a single terminal response.

pub mod query;
pub mod retrieve;

pub use query::{adjust, MatchSource, QueryTask};
pub use retrieve::{Progress, RetrieveTask};
