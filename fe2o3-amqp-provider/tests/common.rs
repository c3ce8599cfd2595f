#![allow(dead_code)]

use std::time::Duration;

use fe2o3_amqp_provider::{
    Builder, ChannelEngine, Dispatcher, EndpointId, EngineAction, EngineEvent, Error,
    ProviderEvent, ProviderEvents, ProviderHandle, ResourceKind, ResourceSnapshot, Role,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(1);

pub struct Harness {
    pub handle: ProviderHandle,
    pub events: ProviderEvents,
    pub actions: UnboundedReceiver<EngineAction>,
    pub join: JoinHandle<Result<(), Error>>,
}

pub fn spawn() -> Harness {
    spawn_with(Dispatcher::builder())
}

pub fn spawn_with(builder: Builder) -> Harness {
    let (engine, actions) = ChannelEngine::new();
    let (handle, events, join) = builder.spawn(engine);
    Harness {
        handle,
        events,
        actions,
        join,
    }
}

impl Harness {
    /// Feeds an event as if the engine had decoded it
    pub async fn remote(&self, event: EngineEvent) {
        self.handle.submit(event).await.unwrap();
    }

    pub async fn next_action(&mut self) -> EngineAction {
        timeout(WAIT, self.actions.recv())
            .await
            .expect("no engine action")
            .expect("engine action channel closed")
    }

    pub async fn next_event(&mut self) -> ProviderEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("no provider event")
            .expect("provider event channel closed")
    }

    pub async fn inspect(&self, endpoint: EndpointId) -> Option<ResourceSnapshot> {
        self.handle
            .inspect(endpoint)
            .await
            .unwrap()
            .await
            .unwrap()
    }

    /// Opens an endpoint and answers it from the peer
    pub async fn open_active(
        &mut self,
        kind: ResourceKind,
        parent: Option<EndpointId>,
    ) -> EndpointId {
        let pending = self.handle.open(kind, parent).await.unwrap();
        let endpoint = match self.next_action().await {
            EngineAction::Open {
                endpoint,
                kind: k,
                parent: p,
            } => {
                assert_eq!(k, kind);
                assert_eq!(p, parent);
                endpoint
            }
            other => panic!("expected open, got {:?}", other),
        };
        self.remote(EngineEvent::RemoteOpen {
            endpoint,
            kind,
            parent,
        })
        .await;
        assert_eq!(pending.await.unwrap(), endpoint);
        endpoint
    }

    /// Connection, session and one link of the given role, all active
    pub async fn open_tree(&mut self, role: Role) -> (EndpointId, EndpointId, EndpointId) {
        let connection = self.open_active(ResourceKind::Connection, None).await;
        let session = self
            .open_active(ResourceKind::Session, Some(connection))
            .await;
        let link = self
            .open_active(ResourceKind::Link(role), Some(session))
            .await;
        (connection, session, link)
    }
}
