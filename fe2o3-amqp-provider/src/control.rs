//! Work items drained by the dispatcher

use std::{fmt, time::Duration};

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag},
    messaging::Outcome,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Pending,
    endpoint::{EndpointId, ResourceKind, ResourceSnapshot},
    engine::EngineEvent,
    error::Error,
    Payload,
};

/// Creates a completion channel.
///
/// The [`Responder`] travels with a [`Command`] into the dispatcher, the [`Pending`] stays
/// with the application. Both share one cancellation token.
pub fn channel<T>(timeout: Option<Duration>) -> (Responder<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let token = CancellationToken::new();
    let responder = Responder {
        tx,
        token: token.clone(),
    };
    (responder, Pending::new(rx, token, timeout))
}

/// Dispatcher side of a command completion
pub struct Responder<T> {
    tx: oneshot::Sender<Result<T, Error>>,
    token: CancellationToken,
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("cancelled", &self.token.is_cancelled())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> Responder<T> {
    /// Whether the application withdrew the command
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes the command.
    ///
    /// Completing after the application stopped waiting is a no-op.
    pub fn complete(self, result: Result<T, Error>) {
        let _ = self.tx.send(result);
    }

    /// Completes the command with an error
    pub fn fail(self, error: Error) {
        self.complete(Err(error))
    }
}

/// Application-originated work
#[derive(Debug)]
pub enum Command {
    /// Open a connection, session or link
    OpenResource {
        /// Kind of the endpoint
        kind: ResourceKind,
        /// Owning endpoint, `None` for a connection
        parent: Option<EndpointId>,
        /// Completes with the new handle once the peer has opened
        responder: Responder<EndpointId>,
    },

    /// Close an endpoint and everything it owns
    CloseResource {
        /// The endpoint
        endpoint: EndpointId,
        /// Error condition sent to the peer
        error: Option<definitions::Error>,
        /// Completes once the peer has closed
        responder: Responder<()>,
    },

    /// Transfer a message on a sender link
    Send {
        /// The link
        link: EndpointId,
        /// Encoded message
        payload: Payload,
        /// Completes with the peer's outcome once the delivery is settled
        responder: Responder<Outcome>,
    },

    /// Settle a delivery locally with the given outcome
    Settle {
        /// The link
        link: EndpointId,
        /// Delivery tag
        tag: DeliveryTag,
        /// Outcome sent to the peer
        outcome: Outcome,
        /// Completes once the disposition has been emitted
        responder: Responder<()>,
    },

    /// Grant link credit on a receiver link
    GrantCredit {
        /// The link
        link: EndpointId,
        /// New link credit
        credit: u32,
        /// Completes once the flow has been emitted
        responder: Responder<()>,
    },

    /// Take a snapshot of a registry entry
    Inspect {
        /// The endpoint
        endpoint: EndpointId,
        /// Completes with `None` if the endpoint is not in the registry
        responder: Responder<Option<ResourceSnapshot>>,
    },
}

impl Command {
    /// The endpoint the command targets. Opening a connection targets none.
    pub fn target(&self) -> Option<EndpointId> {
        match self {
            Command::OpenResource { parent, .. } => *parent,
            Command::CloseResource { endpoint, .. } | Command::Inspect { endpoint, .. } => {
                Some(*endpoint)
            }
            Command::Send { link, .. }
            | Command::Settle { link, .. }
            | Command::GrantCredit { link, .. } => Some(*link),
        }
    }

    /// Whether the application withdrew the command
    pub fn is_cancelled(&self) -> bool {
        match self {
            Command::OpenResource { responder, .. } => responder.is_cancelled(),
            Command::CloseResource { responder, .. }
            | Command::Settle { responder, .. }
            | Command::GrantCredit { responder, .. } => responder.is_cancelled(),
            Command::Send { responder, .. } => responder.is_cancelled(),
            Command::Inspect { responder, .. } => responder.is_cancelled(),
        }
    }

    /// Completes the command with an error without executing it
    pub fn fail(self, error: Error) {
        match self {
            Command::OpenResource { responder, .. } => responder.fail(error),
            Command::CloseResource { responder, .. }
            | Command::Settle { responder, .. }
            | Command::GrantCredit { responder, .. } => responder.fail(error),
            Command::Send { responder, .. } => responder.fail(error),
            Command::Inspect { responder, .. } => responder.fail(error),
        }
    }
}

/// One item of the dispatcher's queue
#[derive(Debug)]
pub enum WorkItem {
    /// Engine-originated
    Event(EngineEvent),

    /// Application-originated
    Command(Command),
}

impl From<EngineEvent> for WorkItem {
    fn from(event: EngineEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Command> for WorkItem {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}
