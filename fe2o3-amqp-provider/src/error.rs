//! Errors surfaced by the dispatcher and the endpoint state machines

use fe2o3_amqp_types::definitions::{self, AmqpError, LinkError};
use tokio::sync::{mpsc, oneshot};

use crate::{
    endpoint::{EndpointId, ResourceKind},
    engine::EngineError,
};

/// The category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Peer behaviour is inconsistent with the endpoint's current state
    ProtocolViolation,

    /// An item references a handle that is not in the registry
    UnknownResource,

    /// The peer detached or closed a link
    LinkRemotelyClosed,

    /// The peer ended a session
    SessionRemotelyClosed,

    /// The peer closed the connection
    ConnectionRemotelyClosed,

    /// The command was withdrawn before the dispatcher reached it
    Cancelled,

    /// A local guard on credit or buffering tripped
    ResourceExhausted,

    /// The command is not valid for the resource's kind or current state
    IllegalState,

    /// The resource was closed locally while the command was pending
    ResourceClosed,

    /// The application stopped waiting for the completion
    TimedOut,

    /// The engine collaborator failed to encode or emit an action
    Engine,

    /// The dispatcher event loop is no longer running
    DispatcherStopped,
}

/// Errors associated with the provider core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Peer behaviour is inconsistent with the endpoint's current state
    #[error("Protocol violation on {endpoint}: {description}")]
    ProtocolViolation {
        /// The offending endpoint
        endpoint: EndpointId,
        /// What the peer did wrong
        description: String,
    },

    /// The item references a handle that is not in the registry
    #[error("Unknown resource {0}")]
    UnknownResource(EndpointId),

    /// The peer detached or closed a link
    #[error("Link {endpoint} remotely closed {error:?}")]
    LinkRemotelyClosed {
        /// The link
        endpoint: EndpointId,
        /// Error condition carried by the peer's detach
        error: Option<definitions::Error>,
    },

    /// The peer ended a session
    #[error("Session {endpoint} remotely closed {error:?}")]
    SessionRemotelyClosed {
        /// The session
        endpoint: EndpointId,
        /// Error condition carried by the peer's end
        error: Option<definitions::Error>,
    },

    /// The peer closed the connection
    #[error("Connection {endpoint} remotely closed {error:?}")]
    ConnectionRemotelyClosed {
        /// The connection
        endpoint: EndpointId,
        /// Error condition carried by the peer's close
        error: Option<definitions::Error>,
    },

    /// The command was cancelled before execution
    #[error("Command cancelled before execution")]
    Cancelled,

    /// A local guard on credit or buffering tripped
    #[error("Resource exhausted on {endpoint}: {description}")]
    ResourceExhausted {
        /// The endpoint whose guard tripped
        endpoint: EndpointId,
        /// Which guard
        description: String,
    },

    /// The command is not valid for the resource's kind or current state
    #[error("Illegal state on {endpoint:?}: {description}")]
    IllegalState {
        /// The endpoint the command targeted, if any
        endpoint: Option<EndpointId>,
        /// Why the command was refused
        description: String,
    },

    /// The resource was closed locally while the command was pending
    #[error("Resource {0} has been closed")]
    ResourceClosed(EndpointId),

    /// Timed out waiting for the completion
    #[error("Timed out waiting for completion")]
    TimedOut,

    /// The engine collaborator failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The dispatcher event loop has stopped
    #[error("Dispatcher event loop has stopped")]
    DispatcherStopped,
}

impl Error {
    /// Returns the category of the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Error::UnknownResource(_) => ErrorKind::UnknownResource,
            Error::LinkRemotelyClosed { .. } => ErrorKind::LinkRemotelyClosed,
            Error::SessionRemotelyClosed { .. } => ErrorKind::SessionRemotelyClosed,
            Error::ConnectionRemotelyClosed { .. } => ErrorKind::ConnectionRemotelyClosed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::IllegalState { .. } => ErrorKind::IllegalState,
            Error::ResourceClosed(_) => ErrorKind::ResourceClosed,
            Error::TimedOut => ErrorKind::TimedOut,
            Error::Engine(_) => ErrorKind::Engine,
            Error::DispatcherStopped => ErrorKind::DispatcherStopped,
        }
    }

    /// Whether the error is fatal to the endpoint it was raised on.
    ///
    /// A fatal error raised on a connection is fatal to the whole tree, and an engine error is
    /// always connection-fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation { .. } | Error::ResourceExhausted { .. } | Error::Engine(_)
        )
    }

    /// The endpoint the error refers to, if any
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self {
            Error::ProtocolViolation { endpoint, .. }
            | Error::LinkRemotelyClosed { endpoint, .. }
            | Error::SessionRemotelyClosed { endpoint, .. }
            | Error::ConnectionRemotelyClosed { endpoint, .. }
            | Error::ResourceExhausted { endpoint, .. } => Some(*endpoint),
            Error::UnknownResource(endpoint) | Error::ResourceClosed(endpoint) => Some(*endpoint),
            Error::IllegalState { endpoint, .. } => *endpoint,
            Error::Cancelled | Error::TimedOut | Error::Engine(_) | Error::DispatcherStopped => {
                None
            }
        }
    }

    pub(crate) fn protocol_violation(endpoint: EndpointId, description: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            endpoint,
            description: description.into(),
        }
    }

    pub(crate) fn resource_exhausted(endpoint: EndpointId, description: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            endpoint,
            description: description.into(),
        }
    }

    pub(crate) fn illegal_state(
        endpoint: impl Into<Option<EndpointId>>,
        description: impl Into<String>,
    ) -> Self {
        Self::IllegalState {
            endpoint: endpoint.into(),
            description: description.into(),
        }
    }

    /// Peer-initiated teardown of an endpoint of the given kind
    pub(crate) fn remotely_closed(
        kind: ResourceKind,
        endpoint: EndpointId,
        error: Option<definitions::Error>,
    ) -> Self {
        match kind {
            ResourceKind::Connection => Self::ConnectionRemotelyClosed { endpoint, error },
            ResourceKind::Session => Self::SessionRemotelyClosed { endpoint, error },
            ResourceKind::Link(_) => Self::LinkRemotelyClosed { endpoint, error },
        }
    }

    /// The AMQP error condition sent to the peer when this error closes an endpoint
    pub(crate) fn to_condition(&self) -> definitions::Error {
        match self {
            Error::ResourceExhausted { description, .. } => definitions::Error::new(
                LinkError::TransferLimitExceeded,
                Some(description.clone()),
                None,
            ),
            Error::ProtocolViolation { description, .. } => {
                definitions::Error::new(AmqpError::IllegalState, Some(description.clone()), None)
            }
            other => definitions::Error::new(AmqpError::InternalError, Some(other.to_string()), None),
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::DispatcherStopped
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::DispatcherStopped
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{self, LinkError};

    use crate::endpoint::{EndpointId, ResourceKind, Role};

    use super::{Error, ErrorKind};

    #[test]
    fn remotely_closed_follows_resource_kind() {
        let id = EndpointId(3);
        assert_eq!(
            Error::remotely_closed(ResourceKind::Connection, id, None).kind(),
            ErrorKind::ConnectionRemotelyClosed
        );
        assert_eq!(
            Error::remotely_closed(ResourceKind::Session, id, None).kind(),
            ErrorKind::SessionRemotelyClosed
        );
        assert_eq!(
            Error::remotely_closed(ResourceKind::Link(Role::Sender), id, None).kind(),
            ErrorKind::LinkRemotelyClosed
        );
    }

    #[test]
    fn resource_exhausted_is_fatal_like_protocol_violation() {
        let exhausted = Error::resource_exhausted(EndpointId(1), "credit underflow");
        let violation = Error::protocol_violation(EndpointId(1), "duplicate open");
        assert!(exhausted.is_fatal());
        assert!(violation.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::UnknownResource(EndpointId(1)).is_fatal());

        assert_eq!(
            exhausted.to_condition(),
            definitions::Error::new(
                LinkError::TransferLimitExceeded,
                Some(String::from("credit underflow")),
                None
            )
        );
    }
}
