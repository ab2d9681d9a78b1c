//! confab: a multi-conversation chat bot backend on top of a few expensive model engines.
//!
//! The core pieces:
//! - [`pool::SessionPool`] binds conversations to engine-backed session actors
//! - [`scheduler::Scheduler`] runs one task per inbound message, single-flight per conversation
//! - [`pipeline::ReplyPipeline`] drives a session through append, trigger, generate, finalize
//! - [`pool::sweeper`] evicts and persists idle sessions
//! - [`gateway::BotHandler`] glues a chat transport to all of the above

pub mod build_info;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod sync;
