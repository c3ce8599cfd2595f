//! Boundary with the AMQP engine collaborator
//!
//! The engine decodes bytes read off the transport into [`EngineEvent`]s and encodes the
//! [`EngineAction`]s emitted by the dispatcher. Frame encoding, SASL and TLS all live on the
//! far side of this boundary.

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag},
    messaging::{DeliveryState, Outcome},
};
use slab::Slab;
use tokio::sync::mpsc;

use crate::{
    endpoint::{EndpointId, ResourceKind},
    Payload,
};

/// Handles at or above this value are reserved for endpoints the peer initiates.
///
/// [`ChannelEngine`] only allocates handles below it, so the transport side can report
/// peer-initiated endpoints without coordinating with the allocator.
pub const PEER_ENDPOINT_BASE: u32 = 0x8000_0000;

/// Errors associated with the engine collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine, or the transport behind it, is gone
    #[error("Engine is closed")]
    Closed,

    /// No endpoint handle is left to allocate
    #[error("Reached engine handle max")]
    HandleMaxReached,

    /// The engine failed to encode an action
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Change of state of one delivery, as reported by the peer
#[derive(Debug, Clone)]
pub struct DeliveryUpdate {
    /// Tag of the delivery
    pub tag: DeliveryTag,

    /// The delivery state carried by the peer's disposition, if any
    pub state: Option<DeliveryState>,

    /// Whether the peer settled the delivery
    pub settled: bool,
}

/// Events produced by the engine from bytes read off the transport
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The peer opened an endpoint (open, begin or attach)
    RemoteOpen {
        /// Endpoint handle
        endpoint: EndpointId,
        /// Kind of the endpoint
        kind: ResourceKind,
        /// Owning endpoint
        parent: Option<EndpointId>,
    },

    /// The peer detached a link without closing it
    RemoteDetach {
        /// Link handle
        endpoint: EndpointId,
        /// Error condition carried by the detach
        error: Option<definitions::Error>,
    },

    /// The peer closed an endpoint (close, end or closing detach)
    RemoteClose {
        /// Endpoint handle
        endpoint: EndpointId,
        /// Error condition carried by the performative
        error: Option<definitions::Error>,
    },

    /// The peer changed the state of one or more deliveries on a link
    DeliveryUpdate {
        /// Link handle
        link: EndpointId,
        /// The deliveries named by the disposition
        updates: Vec<DeliveryUpdate>,
    },

    /// The engine computed a new link-credit value for a link
    FlowUpdate {
        /// Link handle
        link: EndpointId,
        /// Link credit
        credit: u32,
    },

    /// A complete transfer arrived on a receiver link
    Transfer {
        /// Link handle
        link: EndpointId,
        /// Delivery tag chosen by the peer
        tag: DeliveryTag,
        /// Encoded message
        payload: Payload,
    },
}

impl EngineEvent {
    /// The endpoint the event targets
    pub fn endpoint(&self) -> EndpointId {
        match self {
            EngineEvent::RemoteOpen { endpoint, .. }
            | EngineEvent::RemoteDetach { endpoint, .. }
            | EngineEvent::RemoteClose { endpoint, .. } => *endpoint,
            EngineEvent::DeliveryUpdate { link, .. }
            | EngineEvent::FlowUpdate { link, .. }
            | EngineEvent::Transfer { link, .. } => *link,
        }
    }

    /// Convenience constructor for a disposition naming a single delivery
    pub fn delivery_update(
        link: EndpointId,
        tag: DeliveryTag,
        state: impl Into<Option<DeliveryState>>,
        settled: bool,
    ) -> Self {
        EngineEvent::DeliveryUpdate {
            link,
            updates: vec![DeliveryUpdate {
                tag,
                state: state.into(),
                settled,
            }],
        }
    }
}

/// Protocol actions emitted towards the engine
#[derive(Debug, Clone)]
pub enum EngineAction {
    /// Open an endpoint (open, begin or attach)
    Open {
        /// Endpoint handle
        endpoint: EndpointId,
        /// Kind of the endpoint
        kind: ResourceKind,
        /// Owning endpoint
        parent: Option<EndpointId>,
    },

    /// Detach a link without closing it
    Detach {
        /// Link handle
        endpoint: EndpointId,
        /// Error condition
        error: Option<definitions::Error>,
    },

    /// Close an endpoint (close, end or closing detach)
    Close {
        /// Endpoint handle
        endpoint: EndpointId,
        /// Error condition
        error: Option<definitions::Error>,
    },

    /// Advertise link credit on a receiver link
    Flow {
        /// Link handle
        link: EndpointId,
        /// Link credit
        credit: u32,
    },

    /// Transfer a message on a sender link
    Transfer {
        /// Link handle
        link: EndpointId,
        /// Delivery tag
        tag: DeliveryTag,
        /// Encoded message
        payload: Payload,
    },

    /// Send a settled disposition with the given outcome
    Disposition {
        /// Link handle
        link: EndpointId,
        /// Delivery tag
        tag: DeliveryTag,
        /// Outcome
        outcome: Outcome,
    },

    /// Release the engine-side resources of a settled delivery
    Settle {
        /// Link handle
        link: EndpointId,
        /// Delivery tag
        tag: DeliveryTag,
    },
}

/// The engine collaborator as seen from the dispatcher.
///
/// Every method is called from the dispatcher's serial context and must not block: an
/// action is encoded into the engine's buffers and flushed by the transport elsewhere.
pub trait Engine: Send + 'static {
    /// Assign the handle of a locally initiated endpoint
    fn allocate(
        &mut self,
        kind: ResourceKind,
        parent: Option<EndpointId>,
    ) -> Result<EndpointId, EngineError>;

    /// Free the handle of an endpoint that left the registry
    fn release(&mut self, endpoint: EndpointId);

    /// Encode and queue an outbound protocol action
    fn emit(&mut self, action: EngineAction) -> Result<(), EngineError>;
}

/// An [`Engine`] that forwards every action over a channel, for a transport task that owns
/// the actual encoder (or for tests).
#[derive(Debug)]
pub struct ChannelEngine {
    endpoints: Slab<ResourceKind>,
    handle_max: u32,
    outgoing: mpsc::UnboundedSender<EngineAction>,
}

impl ChannelEngine {
    /// Creates the engine and the receiving half of its action channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineAction>) {
        Self::with_handle_max(PEER_ENDPOINT_BASE - 1)
    }

    /// Creates the engine with at most `handle_max + 1` concurrently allocated handles.
    /// `handle_max` is capped below [`PEER_ENDPOINT_BASE`].
    pub fn with_handle_max(handle_max: u32) -> (Self, mpsc::UnboundedReceiver<EngineAction>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let engine = Self {
            endpoints: Slab::new(),
            handle_max: handle_max.min(PEER_ENDPOINT_BASE - 1),
            outgoing,
        };
        (engine, rx)
    }
}

impl Engine for ChannelEngine {
    fn allocate(
        &mut self,
        kind: ResourceKind,
        _parent: Option<EndpointId>,
    ) -> Result<EndpointId, EngineError> {
        let entry = self.endpoints.vacant_entry();
        let key = u32::try_from(entry.key()).map_err(|_| EngineError::HandleMaxReached)?;
        if key > self.handle_max {
            return Err(EngineError::HandleMaxReached);
        }
        entry.insert(kind);
        Ok(EndpointId(key))
    }

    fn release(&mut self, endpoint: EndpointId) {
        let key = endpoint.0 as usize;
        if endpoint.0 < PEER_ENDPOINT_BASE && self.endpoints.contains(key) {
            self.endpoints.remove(key);
        }
    }

    fn emit(&mut self, action: EngineAction) -> Result<(), EngineError> {
        self.outgoing.send(action).map_err(|_| EngineError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use crate::endpoint::{EndpointId, ResourceKind};

    use super::{ChannelEngine, Engine, EngineAction, EngineError, PEER_ENDPOINT_BASE};

    #[test]
    fn released_handles_are_reused() {
        let (mut engine, _rx) = ChannelEngine::new();
        let a = engine.allocate(ResourceKind::Connection, None).unwrap();
        let b = engine.allocate(ResourceKind::Session, Some(a)).unwrap();
        assert_eq!(a, EndpointId(0));
        assert_eq!(b, EndpointId(1));

        engine.release(a);
        let c = engine.allocate(ResourceKind::Connection, None).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn handle_max_is_enforced() {
        let (mut engine, _rx) = ChannelEngine::with_handle_max(1);
        engine.allocate(ResourceKind::Connection, None).unwrap();
        engine.allocate(ResourceKind::Session, None).unwrap();
        assert_eq!(
            engine.allocate(ResourceKind::Session, None),
            Err(EngineError::HandleMaxReached)
        );
    }

    #[test]
    fn releasing_a_peer_handle_is_a_no_op() {
        let (mut engine, _rx) = ChannelEngine::new();
        engine.release(EndpointId(PEER_ENDPOINT_BASE + 7));
        let a = engine.allocate(ResourceKind::Connection, None).unwrap();
        assert_eq!(a, EndpointId(0));
    }

    #[test]
    fn emit_fails_once_receiver_is_dropped() {
        let (mut engine, rx) = ChannelEngine::new();
        drop(rx);
        let result = engine.emit(EngineAction::Flow {
            link: EndpointId(0),
            credit: 1,
        });
        assert_eq!(result, Err(EngineError::Closed));
    }
}
