//! Endpoint identities, state axes and the event-sink capability set
//!
//! Event              Connection  Session  Link
//! =============================================
//! remote open            H          H       H
//! remote detach                             H
//! remote close           H          H       H
//! delivery update                           H
//! flow update                               H
//! transfer                                  H
//! ---------------------------------------------
//! Key:
//!     H: handled by the endpoint
//!
//! An event of a kind the endpoint does not handle is a protocol violation.

use std::fmt;

use fe2o3_amqp_types::definitions;

use crate::{engine::DeliveryUpdate, error::Error, provider::Provider, Payload};

mod link;
pub(crate) use self::link::*;

mod resource;
pub(crate) use self::resource::*;

/// Engine-assigned endpoint handle
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u32);

impl From<u32> for EndpointId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<EndpointId> for u32 {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of a link
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends transfers and consumes credit granted by the peer
    Sender,

    /// Receives transfers and grants credit to the peer
    Receiver,
}

/// Kind of an endpoint. Ownership is strictly hierarchical: a session belongs to a
/// connection and a link belongs to a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// AMQP connection
    Connection,

    /// AMQP session
    Session,

    /// AMQP link
    Link(Role),
}

impl ResourceKind {
    /// Whether an endpoint of this kind may be owned by an endpoint of kind `parent`.
    /// `None` means a root endpoint.
    pub fn accepts_parent(&self, parent: Option<ResourceKind>) -> bool {
        matches!(
            (self, parent),
            (ResourceKind::Connection, None)
                | (ResourceKind::Session, Some(ResourceKind::Connection))
                | (ResourceKind::Link(_), Some(ResourceKind::Session))
        )
    }

    /// Whether this is a link
    pub fn is_link(&self) -> bool {
        matches!(self, ResourceKind::Link(_))
    }
}

/// Local lifecycle state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LocalState {
    /// Known to the registry but not opened locally
    Idle,

    /// A local open has been emitted, waiting for the peer
    Opening,

    /// Both sides have opened
    Active,

    /// A local close has been emitted, waiting for the peer
    Closing,

    /// Closed locally
    Closed,
}

impl LocalState {
    /// Whether new children and new work may still be attached to the endpoint
    pub fn is_open(&self) -> bool {
        matches!(self, LocalState::Opening | LocalState::Active)
    }
}

/// Remote lifecycle state, as last reported by the engine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RemoteState {
    /// The peer has not opened the endpoint
    Idle,

    /// The peer has opened the endpoint
    Active,

    /// The peer has detached the link without closing it
    Detached,

    /// The peer has closed the endpoint
    Closed,
}

impl RemoteState {
    /// Whether the peer side of the endpoint is gone
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteState::Detached | RemoteState::Closed)
    }
}

/// Point-in-time view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Handle of the endpoint
    pub endpoint: EndpointId,
    /// Kind of the endpoint
    pub kind: ResourceKind,
    /// Owning endpoint
    pub parent: Option<EndpointId>,
    /// Owned endpoints, in handle order
    pub children: Vec<EndpointId>,
    /// Local state
    pub local: LocalState,
    /// Remote state
    pub remote: RemoteState,
    /// Credit window of a link
    pub credit: Option<u32>,
    /// Number of unsettled deliveries on a link
    pub unsettled: usize,
    /// Number of sends waiting for credit on a link
    pub blocked: usize,
}

/// Callbacks through which an endpoint receives the events reported by the engine.
///
/// Handlers run on the dispatcher's serial context. Any further protocol action goes through
/// the [`Provider`] facade. Returning a fatal error (see [`Error::is_fatal`]) closes the
/// endpoint and its children; any other error is reported and the loop continues.
pub trait EventSink {
    /// The peer opened this endpoint
    fn on_remote_open(&mut self, provider: &mut Provider<'_>) -> Result<(), Error>;

    /// The peer detached this link without closing it
    fn on_remote_detach(
        &mut self,
        provider: &mut Provider<'_>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error>;

    /// The peer closed this endpoint
    fn on_remote_close(
        &mut self,
        provider: &mut Provider<'_>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error>;

    /// The peer updated the state of deliveries on this link
    fn on_delivery_updates(
        &mut self,
        provider: &mut Provider<'_>,
        updates: Vec<DeliveryUpdate>,
    ) -> Result<(), Error>;

    /// The engine reported a new link-credit value for this link
    fn on_flow_updates(&mut self, provider: &mut Provider<'_>, credit: u32) -> Result<(), Error>;

    /// A transfer arrived on this link
    fn on_transfer(
        &mut self,
        provider: &mut Provider<'_>,
        tag: definitions::DeliveryTag,
        payload: Payload,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::{RemoteState, ResourceKind, Role};

    #[test]
    fn hierarchy_is_connection_session_link() {
        let link = ResourceKind::Link(Role::Sender);
        assert!(ResourceKind::Connection.accepts_parent(None));
        assert!(ResourceKind::Session.accepts_parent(Some(ResourceKind::Connection)));
        assert!(link.accepts_parent(Some(ResourceKind::Session)));

        assert!(!ResourceKind::Session.accepts_parent(None));
        assert!(!link.accepts_parent(Some(ResourceKind::Connection)));
        assert!(!ResourceKind::Connection.accepts_parent(Some(ResourceKind::Session)));
    }

    #[test]
    fn detached_and_closed_are_terminal() {
        assert!(RemoteState::Detached.is_terminal());
        assert!(RemoteState::Closed.is_terminal());
        assert!(!RemoteState::Active.is_terminal());
    }
}
