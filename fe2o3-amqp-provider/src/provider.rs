//! The facade handed to endpoints while they handle an event

use std::{collections::VecDeque, fmt};

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag},
    messaging::Outcome,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{
    control::WorkItem,
    endpoint::{EndpointId, ResourceKind},
    engine::{Engine, EngineAction},
    error::Error,
    Payload,
};

/// Notifications for asynchronous activity that is not tied to a pending command
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// An endpoint failed or was closed by the peer
    Failure {
        /// The endpoint
        endpoint: EndpointId,
        /// What happened
        error: Error,
    },

    /// The peer opened an endpoint and the provider accepted it
    RemoteOpened {
        /// The endpoint
        endpoint: EndpointId,
        /// Kind of the endpoint
        kind: ResourceKind,
        /// Owning endpoint
        parent: Option<EndpointId>,
    },

    /// A message arrived on a receiver link and waits to be settled
    Message {
        /// The link
        link: EndpointId,
        /// Delivery tag to settle with
        tag: DeliveryTag,
        /// Encoded message
        payload: Payload,
    },
}

/// Follow-up work an endpoint asks the dispatcher to run once its handler has returned
#[derive(Debug)]
pub(crate) enum ProviderTask {
    /// Push a work item back to the front of the queue
    Requeue(WorkItem),

    /// Force-close an endpoint and everything below it
    Cascade { endpoint: EndpointId, cause: Error },

    /// Remove the endpoint from the registry if it is closed on both sides
    Release(EndpointId),
}

/// The only channel through which an endpoint causes protocol effects.
///
/// Every action is forwarded to the engine on the dispatcher's own context, and registry
/// mutations are deferred until the running handler returns.
pub struct Provider<'a> {
    engine: &'a mut dyn Engine,
    tasks: &'a mut VecDeque<ProviderTask>,
    events: &'a mpsc::Sender<ProviderEvent>,
    max_blocked_sends: usize,
}

impl<'a> fmt::Debug for Provider<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("tasks", &self.tasks.len())
            .field("max_blocked_sends", &self.max_blocked_sends)
            .finish()
    }
}

impl<'a> Provider<'a> {
    pub(crate) fn new(
        engine: &'a mut dyn Engine,
        tasks: &'a mut VecDeque<ProviderTask>,
        events: &'a mpsc::Sender<ProviderEvent>,
        max_blocked_sends: usize,
    ) -> Self {
        Self {
            engine,
            tasks,
            events,
            max_blocked_sends,
        }
    }

    pub(crate) fn max_blocked_sends(&self) -> usize {
        self.max_blocked_sends
    }

    fn emit(&mut self, action: EngineAction) -> Result<(), Error> {
        self.engine.emit(action).map_err(Into::into)
    }

    /// Open an endpoint (open, begin or attach)
    pub fn open(
        &mut self,
        endpoint: EndpointId,
        kind: ResourceKind,
        parent: Option<EndpointId>,
    ) -> Result<(), Error> {
        self.emit(EngineAction::Open {
            endpoint,
            kind,
            parent,
        })
    }

    /// Detach a link without closing it
    pub fn detach(
        &mut self,
        endpoint: EndpointId,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        self.emit(EngineAction::Detach { endpoint, error })
    }

    /// Close an endpoint
    pub fn close(
        &mut self,
        endpoint: EndpointId,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        self.emit(EngineAction::Close { endpoint, error })
    }

    /// Advertise link credit
    pub fn flow(&mut self, link: EndpointId, credit: u32) -> Result<(), Error> {
        self.emit(EngineAction::Flow { link, credit })
    }

    /// Transfer a message
    pub fn transfer(
        &mut self,
        link: EndpointId,
        tag: DeliveryTag,
        payload: Payload,
    ) -> Result<(), Error> {
        self.emit(EngineAction::Transfer { link, tag, payload })
    }

    /// Send a settled disposition
    pub fn disposition(
        &mut self,
        link: EndpointId,
        tag: DeliveryTag,
        outcome: Outcome,
    ) -> Result<(), Error> {
        self.emit(EngineAction::Disposition { link, tag, outcome })
    }

    /// Release the engine-side resources of a delivery
    pub fn settle(&mut self, link: EndpointId, tag: DeliveryTag) -> Result<(), Error> {
        self.emit(EngineAction::Settle { link, tag })
    }

    /// Hand a work item back to the dispatcher. Requeued items run before anything that is
    /// still waiting in the queue, in the order they were requeued.
    pub(crate) fn requeue(&mut self, item: impl Into<WorkItem>) {
        self.tasks.push_back(ProviderTask::Requeue(item.into()))
    }

    pub(crate) fn cascade(&mut self, endpoint: EndpointId, cause: Error) {
        self.tasks.push_back(ProviderTask::Cascade { endpoint, cause })
    }

    pub(crate) fn release(&mut self, endpoint: EndpointId) {
        self.tasks.push_back(ProviderTask::Release(endpoint))
    }

    /// Report to the application. Never blocks: a notification that does not fit in the
    /// channel is dropped.
    pub fn notify(&mut self, event: ProviderEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "provider event channel is full, dropping notification")
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
