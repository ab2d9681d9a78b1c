//! Sessions: one conversation bound to one engine.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────────┐        ┌───────────────┐
//!  │   SessionPool   │──owns──▶ SessionActor  │  (one per conversation, runs in a tokio task)
//!  │  (ID → Handle)  │        │  owns engine, │
//!  └────────┬────────┘        │  serializes   │
//!           │                 │  engine calls │
//!           │ lease           └───────▲───────┘
//!           ▼                         │ mpsc messages
//!  ┌─────────────────┐                │
//!  │  SessionHandle  │────────────────┘  (cheap cloneable sender)
//!  └─────────────────┘
//! ```
//!
//! - **SessionActor**: owns the engine; processes commands sequentially, so
//!   the engine is never used by two callers at once.
//! - **SessionHandle**: cloneable reference that sends commands to an actor.
//! - **InitCacheBuilder**: produces the per-model starting states sessions
//!   restore from.

mod actor;
mod actor_types;
mod handle;
mod init_cache;

pub use actor::SessionActor;
pub use actor_types::{
    ActorConfig, EngineSeed, RestoredFrom, SessionCommand, SessionError, SessionInfo,
};
pub use handle::SessionHandle;
pub use init_cache::{InitCacheBuilder, InitCacheError, InitCacheReport, render_preamble};
