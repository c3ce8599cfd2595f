#![deny(missing_docs, missing_debug_implementations)]

//! Serial event dispatch for AMQP1.0 providers.
//!
//! An AMQP engine turns the bytes read off a transport into structured endpoint events
//! (remote open, detach, close, delivery and flow updates). This crate owns what sits behind
//! that stream: the registry of live endpoints, the per-endpoint lifecycle state machine, and
//! the delivery and credit bookkeeping that has to stay consistent with the peer.
//!
//! Every engine event and every application command goes through one queue that is drained by
//! a single [`Dispatcher`] task, so no two items are ever processed concurrently against the
//! same endpoints and the core needs no locks.
//!
//! ```rust, ignore
//! let (engine, mut actions) = ChannelEngine::new();
//! let (handle, mut events, join) = Dispatcher::builder()
//!     .command_timeout(Duration::from_secs(5))
//!     .spawn(engine);
//!
//! // Opening completes once the peer's open has been reported back
//! let connection = handle.open(ResourceKind::Connection, None).await?.await?;
//! ```

pub mod control;
pub mod dispatcher;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod provider;

mod registry;
mod util;

pub use control::{Command, WorkItem};
pub use dispatcher::{Builder, Dispatcher, Pending, ProviderEvents, ProviderHandle};
pub use endpoint::{
    EndpointId, EventSink, LocalState, RemoteState, ResourceKind, ResourceSnapshot, Role,
};
pub use engine::{ChannelEngine, DeliveryUpdate, Engine, EngineAction, EngineError, EngineEvent};
pub use error::{Error, ErrorKind};
pub use provider::{Provider, ProviderEvent};

/// Message payload as already encoded by the engine collaborator
pub type Payload = bytes::Bytes;
