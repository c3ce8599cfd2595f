use std::collections::BTreeSet;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag},
    messaging::Outcome,
};
use tracing::{debug, instrument};

use crate::{
    control::Responder,
    endpoint::{
        EndpointId, EventSink, LinkEndpoint, LocalState, RemoteState, ResourceKind,
        ResourceSnapshot,
    },
    engine::DeliveryUpdate,
    error::Error,
    provider::{Provider, ProviderEvent},
    Payload,
};

/// One registry entry: a connection, session or link with its two state axes
#[derive(Debug)]
pub(crate) struct Resource {
    id: EndpointId,
    kind: ResourceKind,
    parent: Option<EndpointId>,
    children: BTreeSet<EndpointId>,
    local: LocalState,
    remote: RemoteState,
    link: Option<LinkEndpoint>,
    open_waiter: Option<Responder<EndpointId>>,
    close_waiters: Vec<Responder<()>>,
    closed_with: Option<Error>,
}

impl Resource {
    fn new(
        id: EndpointId,
        kind: ResourceKind,
        parent: Option<EndpointId>,
        local: LocalState,
        remote: RemoteState,
    ) -> Self {
        let link = match kind {
            ResourceKind::Link(role) => Some(LinkEndpoint::new(id, role)),
            _ => None,
        };
        Self {
            id,
            kind,
            parent,
            children: BTreeSet::new(),
            local,
            remote,
            link,
            open_waiter: None,
            close_waiters: Vec::new(),
            closed_with: None,
        }
    }

    /// An endpoint the application asked to open. It stays `Opening` until the peer answers.
    pub fn local(
        id: EndpointId,
        kind: ResourceKind,
        parent: Option<EndpointId>,
        responder: Responder<EndpointId>,
    ) -> Self {
        let mut resource = Self::new(id, kind, parent, LocalState::Opening, RemoteState::Idle);
        resource.open_waiter = Some(responder);
        resource
    }

    /// An endpoint the peer opened
    pub fn remote(id: EndpointId, kind: ResourceKind, parent: Option<EndpointId>) -> Self {
        Self::new(id, kind, parent, LocalState::Idle, RemoteState::Active)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn parent(&self) -> Option<EndpointId> {
        self.parent
    }

    pub fn local_state(&self) -> LocalState {
        self.local
    }

    pub fn closed_with(&self) -> Option<&Error> {
        self.closed_with.as_ref()
    }

    pub fn add_child(&mut self, child: EndpointId) {
        self.children.insert(child);
    }

    pub fn remove_child(&mut self, child: &EndpointId) {
        self.children.remove(child);
    }

    /// Closed on both sides and ready to leave the registry
    pub fn is_released(&self) -> bool {
        self.local == LocalState::Closed && self.remote.is_terminal()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            endpoint: self.id,
            kind: self.kind,
            parent: self.parent,
            children: self.children.iter().copied().collect(),
            local: self.local,
            remote: self.remote,
            credit: self.link.as_ref().map(LinkEndpoint::credit),
            unsettled: self.link.as_ref().map_or(0, LinkEndpoint::unsettled),
            blocked: self.link.as_ref().map_or(0, LinkEndpoint::blocked),
        }
    }

    /// Answers a peer-initiated open
    pub fn accept(&mut self, provider: &mut Provider<'_>) -> Result<(), Error> {
        provider.open(self.id, self.kind, self.parent)?;
        self.local = LocalState::Active;
        debug!(endpoint = %self.id, kind = ?self.kind, "accepted remote open");
        provider.notify(ProviderEvent::RemoteOpened {
            endpoint: self.id,
            kind: self.kind,
            parent: self.parent,
        });
        Ok(())
    }

    /// Locally initiated close.
    ///
    /// Children are force-closed right away. The endpoint itself stays `Closing` until the
    /// peer's close arrives, which completes `responder`.
    #[instrument(skip_all, fields(endpoint = %self.id))]
    pub fn close(
        &mut self,
        provider: &mut Provider<'_>,
        error: Option<definitions::Error>,
        responder: Responder<()>,
    ) -> Result<(), Error> {
        match self.local {
            LocalState::Closed => {
                responder.complete(Ok(()));
                return Ok(());
            }
            LocalState::Closing => {
                self.close_waiters.push(responder);
                return Ok(());
            }
            LocalState::Idle | LocalState::Opening | LocalState::Active => {}
        }

        let cause = Error::ResourceClosed(self.id);
        if let Some(waiter) = self.open_waiter.take() {
            waiter.fail(cause.clone());
        }
        self.local = LocalState::Closing;
        self.close_waiters.push(responder);
        if let Some(link) = self.link.as_mut() {
            link.fail_pending(&cause);
        }
        for child in std::mem::take(&mut self.children) {
            provider.cascade(child, cause.clone());
        }
        self.closed_with = Some(cause);
        debug!(local = ?self.local, "closing");

        provider.close(self.id, error)
    }

    /// Closes the endpoint without any protocol exchange because its parent is gone.
    /// Returns the children that have to follow.
    pub fn force_close(&mut self, cause: Error) -> Vec<EndpointId> {
        if let Some(waiter) = self.open_waiter.take() {
            waiter.fail(cause.clone());
        }
        for waiter in self.close_waiters.drain(..) {
            waiter.complete(Ok(()));
        }
        if let Some(link) = self.link.as_mut() {
            link.fail_pending(&cause);
        }
        self.local = LocalState::Closed;
        self.remote = RemoteState::Closed;
        self.closed_with.get_or_insert(cause);
        self.children.iter().copied().collect()
    }

    /// Closes the endpoint towards the peer after a fatal error raised on it
    #[instrument(skip_all, fields(endpoint = %self.id))]
    pub fn fail(&mut self, provider: &mut Provider<'_>, cause: Error) -> Result<(), Error> {
        if let Some(waiter) = self.open_waiter.take() {
            waiter.fail(cause.clone());
        }
        for waiter in self.close_waiters.drain(..) {
            waiter.fail(cause.clone());
        }
        if let Some(link) = self.link.as_mut() {
            link.fail_pending(&cause);
        }
        for child in std::mem::take(&mut self.children) {
            provider.cascade(child, cause.clone());
        }
        provider.notify(ProviderEvent::Failure {
            endpoint: self.id,
            error: cause.clone(),
        });

        // A close already went out with the local close
        let close_sent = matches!(self.local, LocalState::Closing | LocalState::Closed);
        self.local = LocalState::Closed;
        self.closed_with = Some(cause.clone());
        if self.remote.is_terminal() {
            provider.release(self.id);
        }
        match close_sent {
            true => Ok(()),
            false => provider.close(self.id, Some(cause.to_condition())),
        }
    }

    /// Shared tail of a remote detach or close
    fn on_remote_end(
        &mut self,
        provider: &mut Provider<'_>,
        cause: Error,
        detach: bool,
    ) -> Result<(), Error> {
        let reply = match self.local {
            LocalState::Idle | LocalState::Opening => {
                if let Some(waiter) = self.open_waiter.take() {
                    waiter.fail(cause.clone());
                }
                true
            }
            LocalState::Active => {
                self.local = LocalState::Closing;
                provider.notify(ProviderEvent::Failure {
                    endpoint: self.id,
                    error: cause.clone(),
                });
                true
            }
            LocalState::Closing => {
                for waiter in self.close_waiters.drain(..) {
                    waiter.complete(Ok(()));
                }
                false
            }
            LocalState::Closed => false,
        };

        if let Some(link) = self.link.as_mut() {
            link.fail_pending(&cause);
        }
        for child in std::mem::take(&mut self.children) {
            provider.cascade(child, cause.clone());
        }
        self.local = LocalState::Closed;
        self.closed_with.get_or_insert(cause);
        debug!(endpoint = %self.id, remote = ?self.remote, "closed");
        provider.release(self.id);

        match (reply, detach) {
            (false, _) => Ok(()),
            (true, true) => provider.detach(self.id, None),
            (true, false) => provider.close(self.id, None),
        }
    }

    fn link_mut(&mut self, event: &str) -> Result<&mut LinkEndpoint, Error> {
        let id = self.id;
        self.link.as_mut().ok_or_else(|| {
            Error::protocol_violation(id, format!("{} on a non-link endpoint", event))
        })
    }

    /// Looks up the link a command targets. A command the endpoint cannot take is completed
    /// here and `None` is returned.
    fn command_link<T>(
        &mut self,
        responder: Responder<T>,
    ) -> Option<(&mut LinkEndpoint, Responder<T>)> {
        if !self.local.is_open() {
            let cause = self
                .closed_with
                .clone()
                .unwrap_or(Error::ResourceClosed(self.id));
            responder.fail(cause);
            return None;
        }
        match self.link.as_mut() {
            Some(link) => Some((link, responder)),
            None => {
                responder.fail(Error::illegal_state(self.id, "not a link"));
                None
            }
        }
    }

    pub fn send(
        &mut self,
        provider: &mut Provider<'_>,
        payload: Payload,
        responder: Responder<Outcome>,
    ) -> Result<(), Error> {
        match self.command_link(responder) {
            Some((link, responder)) => link.send(provider, payload, responder),
            None => Ok(()),
        }
    }

    pub fn settle(
        &mut self,
        provider: &mut Provider<'_>,
        tag: DeliveryTag,
        outcome: Outcome,
        responder: Responder<()>,
    ) -> Result<(), Error> {
        match self.command_link(responder) {
            Some((link, responder)) => link.settle(provider, tag, outcome, responder),
            None => Ok(()),
        }
    }

    pub fn grant_credit(
        &mut self,
        provider: &mut Provider<'_>,
        credit: u32,
        responder: Responder<()>,
    ) -> Result<(), Error> {
        match self.command_link(responder) {
            Some((link, responder)) => link.grant_credit(provider, credit, responder),
            None => Ok(()),
        }
    }
}

impl EventSink for Resource {
    #[instrument(skip_all, fields(endpoint = %self.id))]
    fn on_remote_open(&mut self, _provider: &mut Provider<'_>) -> Result<(), Error> {
        if self.remote != RemoteState::Idle {
            return Err(Error::protocol_violation(self.id, "duplicate remote open"));
        }
        match self.local {
            LocalState::Idle | LocalState::Active => {
                return Err(Error::protocol_violation(
                    self.id,
                    "remote open without a local open",
                ))
            }
            LocalState::Opening => {
                self.local = LocalState::Active;
                if let Some(waiter) = self.open_waiter.take() {
                    waiter.complete(Ok(self.id));
                }
            }
            // The peer's close follows
            LocalState::Closing | LocalState::Closed => {}
        }
        self.remote = RemoteState::Active;
        debug!(local = ?self.local, "remote opened");
        Ok(())
    }

    #[instrument(skip_all, fields(endpoint = %self.id))]
    fn on_remote_detach(
        &mut self,
        provider: &mut Provider<'_>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        if !self.kind.is_link() {
            return Err(Error::protocol_violation(
                self.id,
                "detach on a non-link endpoint",
            ));
        }
        if self.remote.is_terminal() {
            return Err(Error::protocol_violation(self.id, "duplicate remote detach"));
        }
        self.remote = RemoteState::Detached;
        let cause = Error::remotely_closed(self.kind, self.id, error);
        self.on_remote_end(provider, cause, true)
    }

    #[instrument(skip_all, fields(endpoint = %self.id))]
    fn on_remote_close(
        &mut self,
        provider: &mut Provider<'_>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        if self.remote == RemoteState::Closed {
            return Err(Error::protocol_violation(self.id, "duplicate remote close"));
        }
        self.remote = RemoteState::Closed;
        let cause = Error::remotely_closed(self.kind, self.id, error);
        self.on_remote_end(provider, cause, false)
    }

    fn on_delivery_updates(
        &mut self,
        provider: &mut Provider<'_>,
        updates: Vec<DeliveryUpdate>,
    ) -> Result<(), Error> {
        self.link_mut("disposition")?
            .on_delivery_updates(provider, updates)
    }

    fn on_flow_updates(&mut self, provider: &mut Provider<'_>, credit: u32) -> Result<(), Error> {
        self.link_mut("flow")?.on_flow(provider, credit)
    }

    fn on_transfer(
        &mut self,
        provider: &mut Provider<'_>,
        tag: DeliveryTag,
        payload: Payload,
    ) -> Result<(), Error> {
        self.link_mut("transfer")?.on_transfer(provider, tag, payload)
    }
}
