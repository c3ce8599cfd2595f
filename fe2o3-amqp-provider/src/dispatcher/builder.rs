use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{engine::Engine, error::Error};

use super::{
    Dispatcher, ProviderEvents, ProviderHandle, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_BLOCKED_SENDS,
    DEFAULT_QUEUE_CAPACITY,
};

/// Builder for a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct Builder {
    /// Bound of the work queue shared by engine events and application commands
    pub queue_capacity: usize,

    /// Bound of the provider event channel. Notifications that do not fit are dropped.
    pub event_capacity: usize,

    /// Timeout applied to every [`Pending`](super::Pending) the handle returns
    pub command_timeout: Option<Duration>,

    /// Number of sends a link buffers while it has no credit
    pub max_blocked_sends: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_timeout: None,
            max_blocked_sends: DEFAULT_MAX_BLOCKED_SENDS,
        }
    }
}

impl Builder {
    /// Creates a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound of the work queue
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Bound of the provider event channel
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Stop waiting for a command's completion after `timeout`
    pub fn command_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.command_timeout = timeout.into();
        self
    }

    /// Number of sends a link buffers while it has no credit
    pub fn max_blocked_sends(mut self, max: usize) -> Self {
        self.max_blocked_sends = max;
        self
    }

    /// Creates the dispatcher and its application-side halves without starting the loop
    pub fn build<E: Engine>(self, engine: E) -> (Dispatcher<E>, ProviderHandle, ProviderEvents) {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity.max(1));

        let dispatcher = Dispatcher::new(engine, queue_rx, events_tx, self.max_blocked_sends);
        let handle = ProviderHandle::new(queue_tx, self.command_timeout);
        (dispatcher, handle, ProviderEvents::new(events_rx))
    }

    /// Creates the dispatcher and runs its loop on a new task
    pub fn spawn<E: Engine>(
        self,
        engine: E,
    ) -> (ProviderHandle, ProviderEvents, JoinHandle<Result<(), Error>>) {
        let (dispatcher, handle, events) = self.build(engine);
        (handle, events, dispatcher.spawn())
    }
}
