//! Agent execution core: per-agent work queues, the bounded turn executor,
//! the cryptographic tool-approval protocol, checkpoint persistence, the
//! shell-command tier classifier, and the history-processor pipeline.
//!
//! Submitters (CLI, server) interact with this crate through
//! [`queue::WorkQueueRegistry`] and the payload types re-exported from
//! `autopoiesis-protocol`; everything else is per-agent machinery resolved
//! through [`runtime::AgentRegistry`].

pub mod approval;
pub mod checkpoint;
pub mod client;
pub mod client_common;
pub mod command_tier;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod exec_env;
pub mod history;
pub mod queue;
pub mod runtime;
pub mod stream;
pub mod subscriptions;
pub mod tools;
pub mod topics;
pub mod truncation;
pub mod turn;
pub mod util;
pub mod worker;
pub mod workspace;

pub use error::AutopoiesisErr;
pub use error::Result;
