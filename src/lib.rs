//! relayflow - resumable dependency-graph task execution
//!
//! A [`Flow`] runs registered nodes in level-synchronous rounds, passing data
//! between them through a shared store. Its state can be encoded between
//! rounds and restored into a freshly built flow, which is how the
//! [`jobs`] loop resumes work across processes.

pub mod cli;
pub mod codec;
pub mod dag;
pub mod error;
pub mod executors;
pub mod flow;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod node;
pub mod parser;
pub mod store;
pub mod workflow;

pub use error::{FlowError, Result};
pub use flow::{Flow, NodeSummary, SeedArgs};
pub use models::{FlowStatus, JobState, NodeOutcome, NodeState};
pub use node::NodeContext;
pub use store::DataStore;
