//! The serial event loop
//!
//! Every engine event and every application command is drained from one queue by one task.
//! Handlers run to completion before the next item is taken, so the registry and every
//! endpoint's state are only ever touched from that task.

use std::collections::VecDeque;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    control::{Command, Responder, WorkItem},
    endpoint::{EndpointId, EventSink, LocalState, Resource, ResourceKind},
    engine::{Engine, EngineAction, EngineError, EngineEvent},
    error::Error,
    provider::{Provider, ProviderEvent, ProviderTask},
    registry::Registry,
    util::Running,
};

mod builder;
mod handle;
mod pending;

pub use builder::*;
pub use handle::*;
pub use pending::*;

/// Default bound of the work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default bound of the provider event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Default number of sends a link buffers while it has no credit
pub const DEFAULT_MAX_BLOCKED_SENDS: usize = 1024;

macro_rules! provider {
    ($self:ident) => {
        Provider::new(
            &mut $self.engine,
            &mut $self.tasks,
            &$self.events,
            $self.max_blocked_sends,
        )
    };
}

/// Owns the registry and drains the work queue
#[derive(Debug)]
pub struct Dispatcher<E> {
    engine: E,
    registry: Registry,
    queue: mpsc::Receiver<WorkItem>,

    /// Items handed back by endpoints, drained before the queue
    backlog: VecDeque<WorkItem>,
    tasks: VecDeque<ProviderTask>,
    events: mpsc::Sender<ProviderEvent>,
    max_blocked_sends: usize,
}

impl Dispatcher<()> {
    /// Creates a builder for the dispatcher
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl<E: Engine> Dispatcher<E> {
    pub(crate) fn new(
        engine: E,
        queue: mpsc::Receiver<WorkItem>,
        events: mpsc::Sender<ProviderEvent>,
        max_blocked_sends: usize,
    ) -> Self {
        Self {
            engine,
            registry: Registry::default(),
            queue,
            backlog: VecDeque::new(),
            tasks: VecDeque::new(),
            events,
            max_blocked_sends,
        }
    }

    /// Runs the event loop on a new task.
    ///
    /// The task ends with an error if a connection-fatal failure stopped the loop, and with
    /// `Ok(())` once every [`ProviderHandle`] has been dropped.
    pub fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    #[instrument(name = "Dispatcher::event_loop", skip(self))]
    async fn event_loop(mut self) -> Result<(), Error> {
        let outcome = loop {
            let result = match self.backlog.pop_front() {
                Some(item) => self.on_work_item(item, true),
                None => match self.queue.recv().await {
                    Some(item) => self.on_work_item(item, false),
                    // Every handle is dropped
                    None => Ok(Running::Stop),
                },
            };

            match result {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => break Ok(()),
                Err(error) => {
                    error!(?error, "connection-fatal failure");
                    self.on_fatal(&error);
                    break Err(error);
                }
            }
        };

        self.shutdown(outcome.as_ref().err());
        debug!("event loop stopped");
        outcome
    }

    fn on_work_item(&mut self, item: WorkItem, requeued: bool) -> Result<Running, Error> {
        match item {
            WorkItem::Event(event) => self.on_event(event)?,
            WorkItem::Command(command) => self.on_command(command, requeued)?,
        }
        self.run_tasks();
        Ok(Running::Continue)
    }

    #[instrument(skip_all, fields(endpoint = %event.endpoint()))]
    fn on_event(&mut self, event: EngineEvent) -> Result<(), Error> {
        trace!(?event);
        let endpoint = event.endpoint();

        if let EngineEvent::RemoteOpen { kind, parent, .. } = &event {
            if !self.registry.contains(&endpoint) {
                return self.accept_remote(endpoint, *kind, *parent);
            }
        }

        let resource = match self.registry.get_mut(&endpoint) {
            Some(resource) => resource,
            None => {
                warn!(error = %Error::UnknownResource(endpoint), "dropping event");
                return Ok(());
            }
        };

        let mut provider = provider!(self);
        let result = match event {
            EngineEvent::RemoteOpen { .. } => resource.on_remote_open(&mut provider),
            EngineEvent::RemoteDetach { error, .. } => {
                resource.on_remote_detach(&mut provider, error)
            }
            EngineEvent::RemoteClose { error, .. } => resource.on_remote_close(&mut provider, error),
            EngineEvent::DeliveryUpdate { updates, .. } => {
                resource.on_delivery_updates(&mut provider, updates)
            }
            EngineEvent::FlowUpdate { credit, .. } => resource.on_flow_updates(&mut provider, credit),
            EngineEvent::Transfer { tag, payload, .. } => {
                resource.on_transfer(&mut provider, tag, payload)
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => self.on_handler_error(endpoint, error),
        }
    }

    /// Creates the endpoint the peer opened and answers it
    fn accept_remote(
        &mut self,
        endpoint: EndpointId,
        kind: ResourceKind,
        parent: Option<EndpointId>,
    ) -> Result<(), Error> {
        if let Some(parent) = parent {
            let owner = match self.registry.get(&parent) {
                Some(owner) => owner,
                None => {
                    warn!(%endpoint, error = %Error::UnknownResource(parent), "dropping remote open");
                    return Ok(());
                }
            };
            // Late answer to an open whose endpoint was already closed with its parent
            if !owner.local_state().is_open() {
                debug!(%endpoint, %parent, "dropping remote open under a closing endpoint");
                return Ok(());
            }
            if !kind.accepts_parent(Some(owner.kind())) {
                let error = Error::protocol_violation(
                    parent,
                    format!("remote open of {:?} {} under this endpoint", kind, endpoint),
                );
                return self.on_handler_error(parent, error);
            }
        } else if !kind.accepts_parent(None) {
            warn!(%endpoint, ?kind, "dropping remote open without a parent");
            return Ok(());
        }

        let mut resource = Resource::remote(endpoint, kind, parent);
        let mut provider = provider!(self);
        let result = resource.accept(&mut provider);
        if self.registry.insert(resource).is_err() {
            warn!(%endpoint, "endpoint is already registered");
        }
        result
    }

    /// Handler errors stay with the endpoint unless the endpoint is a connection or the
    /// engine itself failed
    fn on_handler_error(&mut self, endpoint: EndpointId, error: Error) -> Result<(), Error> {
        if let Error::Engine(_) = error {
            return Err(error);
        }
        if !error.is_fatal() {
            warn!(%endpoint, ?error, "handler failed");
            provider!(self).notify(ProviderEvent::Failure { endpoint, error });
            return Ok(());
        }

        let resource = match self.registry.get_mut(&endpoint) {
            Some(resource) => resource,
            None => return Ok(()),
        };
        if resource.kind() == ResourceKind::Connection {
            return Err(error);
        }
        error!(%endpoint, ?error, "closing endpoint");
        let mut provider = provider!(self);
        resource.fail(&mut provider, error)
    }

    #[instrument(skip_all, fields(target = ?command.target()))]
    fn on_command(&mut self, command: Command, requeued: bool) -> Result<(), Error> {
        // A requeued command has already started
        if !requeued && command.is_cancelled() {
            debug!("cancelled before dispatch");
            command.fail(Error::Cancelled);
            return Ok(());
        }
        trace!(?command);

        match command {
            Command::OpenResource {
                kind,
                parent,
                responder,
            } => self.open_resource(kind, parent, responder),
            Command::CloseResource {
                endpoint,
                error,
                responder,
            } => self.with_resource(endpoint, responder, |resource, provider, responder| {
                resource.close(provider, error, responder)
            }),
            Command::Send {
                link,
                payload,
                responder,
            } => self.with_resource(link, responder, |resource, provider, responder| {
                resource.send(provider, payload, responder)
            }),
            Command::Settle {
                link,
                tag,
                outcome,
                responder,
            } => self.with_resource(link, responder, |resource, provider, responder| {
                resource.settle(provider, tag, outcome, responder)
            }),
            Command::GrantCredit {
                link,
                credit,
                responder,
            } => self.with_resource(link, responder, |resource, provider, responder| {
                resource.grant_credit(provider, credit, responder)
            }),
            Command::Inspect {
                endpoint,
                responder,
            } => {
                let snapshot = self.registry.get(&endpoint).map(Resource::snapshot);
                responder.complete(Ok(snapshot));
                Ok(())
            }
        }
    }

    fn with_resource<T>(
        &mut self,
        endpoint: EndpointId,
        responder: Responder<T>,
        f: impl FnOnce(&mut Resource, &mut Provider<'_>, Responder<T>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        match self.registry.get_mut(&endpoint) {
            Some(resource) => {
                let mut provider = provider!(self);
                f(resource, &mut provider, responder)
            }
            None => {
                responder.fail(self.registry.lookup_error(&endpoint));
                Ok(())
            }
        }
    }

    fn open_resource(
        &mut self,
        kind: ResourceKind,
        parent: Option<EndpointId>,
        responder: Responder<EndpointId>,
    ) -> Result<(), Error> {
        let parent_kind = match parent {
            None => None,
            Some(parent) => match self.registry.get(&parent) {
                Some(owner) if owner.local_state().is_open() => Some(owner.kind()),
                Some(owner) => {
                    let cause = owner
                        .closed_with()
                        .cloned()
                        .unwrap_or(Error::ResourceClosed(parent));
                    responder.fail(cause);
                    return Ok(());
                }
                None => {
                    responder.fail(self.registry.lookup_error(&parent));
                    return Ok(());
                }
            },
        };
        if !kind.accepts_parent(parent_kind) {
            responder.fail(Error::illegal_state(
                parent,
                format!("{:?} cannot be owned by {:?}", kind, parent_kind),
            ));
            return Ok(());
        }

        let endpoint = match self.engine.allocate(kind, parent) {
            Ok(endpoint) => endpoint,
            Err(EngineError::HandleMaxReached) => {
                responder.fail(EngineError::HandleMaxReached.into());
                return Ok(());
            }
            Err(err) => {
                responder.fail(err.clone().into());
                return Err(err.into());
            }
        };
        if self.registry.contains(&endpoint) {
            responder.fail(Error::illegal_state(
                endpoint,
                "engine allocated a handle that is still registered",
            ));
            return Ok(());
        }

        let resource = Resource::local(endpoint, kind, parent, responder);
        if let Err(resource) = self.registry.insert(resource) {
            warn!(%endpoint, local = ?resource.local_state(), "endpoint is already registered");
            return Ok(());
        }
        debug!(%endpoint, ?kind, ?parent, "opening");
        self.engine
            .emit(EngineAction::Open {
                endpoint,
                kind,
                parent,
            })
            .map_err(Into::into)
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                ProviderTask::Requeue(item) => self.backlog.push_back(item),
                ProviderTask::Cascade { endpoint, cause } => {
                    debug!(%endpoint, ?cause, "cascading close");
                    self.purge(endpoint, cause);
                }
                ProviderTask::Release(endpoint) => {
                    let released = self
                        .registry
                        .get(&endpoint)
                        .map_or(false, Resource::is_released);
                    if released && self.registry.remove(&endpoint).is_some() {
                        self.engine.release(endpoint);
                    }
                }
            }
        }
    }

    /// Force-closes and removes an endpoint and everything below it, children first
    fn purge(&mut self, endpoint: EndpointId, cause: Error) {
        let mut stack = vec![endpoint];
        let mut closed = Vec::new();
        while let Some(id) = stack.pop() {
            if let Some(resource) = self.registry.get_mut(&id) {
                stack.extend(resource.force_close(cause.clone()));
                closed.push(id);
            }
        }
        for id in closed.into_iter().rev() {
            if self.registry.remove(&id).is_some() {
                self.engine.release(id);
            }
        }
    }

    /// Tears the whole tree down after a connection-fatal failure
    fn on_fatal(&mut self, error: &Error) {
        let condition = match error {
            Error::Engine(_) => None,
            _ => Some(error.to_condition()),
        };
        for root in self.registry.roots() {
            // A root that is closing already sent its close
            let close_sent = self.registry.get(&root).map_or(true, |r| {
                matches!(r.local_state(), LocalState::Closing | LocalState::Closed)
            });
            if let (Some(condition), false) = (&condition, close_sent) {
                let _ = self.engine.emit(EngineAction::Close {
                    endpoint: root,
                    error: Some(condition.clone()),
                });
            }
            provider!(self).notify(ProviderEvent::Failure {
                endpoint: root,
                error: error.clone(),
            });
            self.purge(root, error.clone());
        }
    }

    /// Fails everything that is still pending
    fn shutdown(&mut self, cause: Option<&Error>) {
        let cause = cause.cloned().unwrap_or(Error::DispatcherStopped);
        self.queue.close();

        for root in self.registry.roots() {
            self.purge(root, cause.clone());
        }

        let requeued = self.tasks.drain(..).filter_map(|task| match task {
            ProviderTask::Requeue(item) => Some(item),
            _ => None,
        });
        let mut pending: Vec<WorkItem> = self.backlog.drain(..).chain(requeued).collect();
        while let Ok(item) = self.queue.try_recv() {
            pending.push(item);
        }
        for item in pending {
            if let WorkItem::Command(command) = item {
                command.fail(cause.clone());
            }
        }
    }
}
