use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag},
    messaging::Outcome,
};
use tokio::sync::mpsc;

use crate::{
    control::{self, Command, Responder, WorkItem},
    endpoint::{EndpointId, ResourceKind, ResourceSnapshot},
    error::Error,
    provider::ProviderEvent,
    Payload,
};

use super::Pending;

/// Application side of the dispatcher. Cheap to clone and safe to use from any task.
///
/// Every command method returns once the command has been queued. The returned [`Pending`]
/// resolves when the dispatcher has completed it.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    queue: mpsc::Sender<WorkItem>,
    timeout: Option<Duration>,
}

impl ProviderHandle {
    pub(crate) fn new(queue: mpsc::Sender<WorkItem>, timeout: Option<Duration>) -> Self {
        Self { queue, timeout }
    }

    /// Queues an engine event or a command
    pub async fn submit(&self, item: impl Into<WorkItem>) -> Result<(), Error> {
        self.queue.send(item.into()).await.map_err(Into::into)
    }

    /// Whether the dispatcher has stopped
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    async fn command<T>(
        &self,
        command: impl FnOnce(Responder<T>) -> Command,
    ) -> Result<Pending<T>, Error> {
        let (responder, pending) = control::channel(self.timeout);
        self.submit(command(responder)).await?;
        Ok(pending)
    }

    /// Opens a connection (`parent` is `None`), a session or a link.
    ///
    /// Resolves with the engine-assigned handle once the peer has opened its side.
    pub async fn open(
        &self,
        kind: ResourceKind,
        parent: Option<EndpointId>,
    ) -> Result<Pending<EndpointId>, Error> {
        self.command(|responder| Command::OpenResource {
            kind,
            parent,
            responder,
        })
        .await
    }

    /// Closes an endpoint. Resolves once the peer has closed its side.
    pub async fn close(
        &self,
        endpoint: EndpointId,
        error: Option<definitions::Error>,
    ) -> Result<Pending<()>, Error> {
        self.command(|responder| Command::CloseResource {
            endpoint,
            error,
            responder,
        })
        .await
    }

    /// Sends a message on a sender link. Resolves with the outcome once the peer has settled
    /// the delivery.
    pub async fn send(
        &self,
        link: EndpointId,
        payload: impl Into<Payload>,
    ) -> Result<Pending<Outcome>, Error> {
        let payload = payload.into();
        self.command(|responder| Command::Send {
            link,
            payload,
            responder,
        })
        .await
    }

    /// Settles a delivery with the given outcome
    pub async fn settle(
        &self,
        link: EndpointId,
        tag: DeliveryTag,
        outcome: Outcome,
    ) -> Result<Pending<()>, Error> {
        self.command(|responder| Command::Settle {
            link,
            tag,
            outcome,
            responder,
        })
        .await
    }

    /// Grants link credit on a receiver link
    pub async fn grant_credit(
        &self,
        link: EndpointId,
        credit: u32,
    ) -> Result<Pending<()>, Error> {
        self.command(|responder| Command::GrantCredit {
            link,
            credit,
            responder,
        })
        .await
    }

    /// Takes a snapshot of a registry entry
    pub async fn inspect(
        &self,
        endpoint: EndpointId,
    ) -> Result<Pending<Option<ResourceSnapshot>>, Error> {
        self.command(|responder| Command::Inspect {
            endpoint,
            responder,
        })
        .await
    }
}

/// Receiving half of the provider event channel
#[derive(Debug)]
pub struct ProviderEvents {
    rx: mpsc::Receiver<ProviderEvent>,
}

impl ProviderEvents {
    pub(crate) fn new(rx: mpsc::Receiver<ProviderEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event. Returns `None` once the dispatcher has stopped and every
    /// event has been received.
    pub async fn recv(&mut self) -> Option<ProviderEvent> {
        self.rx.recv().await
    }

    /// Takes the next event if one is ready
    pub fn try_recv(&mut self) -> Option<ProviderEvent> {
        self.rx.try_recv().ok()
    }
}
