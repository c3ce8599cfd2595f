use std::collections::{BTreeMap, VecDeque};

use fe2o3_amqp_types::{
    definitions::DeliveryTag,
    messaging::{Accepted, DeliveryState, Outcome},
};
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::{
    control::{Command, Responder},
    endpoint::{EndpointId, Role},
    engine::DeliveryUpdate,
    error::Error,
    provider::{Provider, ProviderEvent},
    Payload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Insufficient link credit")]
pub(crate) struct InsufficientCredit {}

/// Link credit and the delivery count it is consumed against
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CreditWindow {
    link_credit: u32,
    delivery_count: u32,
}

impl CreditWindow {
    pub fn link_credit(&self) -> u32 {
        self.link_credit
    }

    /// Replaces the credit with the value computed by the engine and returns the previous one
    pub fn set(&mut self, link_credit: u32) -> u32 {
        std::mem::replace(&mut self.link_credit, link_credit)
    }

    /// Consumes one credit. The returned bytes are the delivery count before consumption,
    /// which locally initiated deliveries use as their tag.
    pub fn consume(&mut self) -> Result<[u8; 4], InsufficientCredit> {
        if self.link_credit == 0 {
            return Err(InsufficientCredit {});
        }
        let tag = self.delivery_count.to_be_bytes();
        self.delivery_count = self.delivery_count.wrapping_add(1);
        self.link_credit -= 1;
        Ok(tag)
    }
}

/// One transfer tracked until settlement. A settled delivery leaves its link's map.
#[derive(Debug)]
pub(crate) struct Delivery {
    link: EndpointId,
    tag: DeliveryTag,
    state: Option<DeliveryState>,
    responder: Option<Responder<Outcome>>,
}

impl Delivery {
    fn new(link: EndpointId, tag: DeliveryTag, responder: Option<Responder<Outcome>>) -> Self {
        Self {
            link,
            tag,
            state: None,
            responder,
        }
    }

    /// Records the final outcome and wakes the sender waiting on it, if any
    fn settle(mut self, outcome: Outcome) {
        debug!(link = %self.link, tag = ?self.tag, ?outcome, "delivery settled");
        if let Some(responder) = self.responder.take() {
            responder.complete(Ok(outcome));
        }
    }

    fn fail(&mut self, cause: Error) {
        if let Some(responder) = self.responder.take() {
            responder.fail(cause);
        }
    }
}

#[derive(Debug)]
struct BlockedSend {
    payload: Payload,
    responder: Responder<Outcome>,
}

/// Credit and delivery bookkeeping of one link
#[derive(Debug)]
pub(crate) struct LinkEndpoint {
    id: EndpointId,
    role: Role,
    credit: CreditWindow,
    unsettled: BTreeMap<DeliveryTag, Delivery>,
    blocked: VecDeque<BlockedSend>,
}

impl LinkEndpoint {
    pub fn new(id: EndpointId, role: Role) -> Self {
        Self {
            id,
            role,
            credit: CreditWindow::default(),
            unsettled: BTreeMap::new(),
            blocked: VecDeque::new(),
        }
    }

    pub fn credit(&self) -> u32 {
        self.credit.link_credit()
    }

    pub fn unsettled(&self) -> usize {
        self.unsettled.len()
    }

    pub fn blocked(&self) -> usize {
        self.blocked.len()
    }

    /// Transfers a message, or holds it back until the peer grants credit.
    ///
    /// Only an engine failure is returned, everything else completes the responder.
    pub fn send(
        &mut self,
        provider: &mut Provider<'_>,
        payload: Payload,
        responder: Responder<Outcome>,
    ) -> Result<(), Error> {
        if self.role != Role::Sender {
            responder.fail(Error::illegal_state(self.id, "send on a receiver link"));
            return Ok(());
        }

        // Earlier sends waiting for credit go first
        if !self.blocked.is_empty() {
            return self.block(provider, payload, responder);
        }

        let tag = match self.credit.consume() {
            Ok(tag) => ByteBuf::from(tag.to_vec()),
            Err(_) => return self.block(provider, payload, responder),
        };
        trace!(link = %self.id, ?tag, credit = self.credit.link_credit(), "transfer");
        self.unsettled.insert(
            tag.clone(),
            Delivery::new(self.id, tag.clone(), Some(responder)),
        );
        provider.transfer(self.id, tag, payload)
    }

    fn block(
        &mut self,
        provider: &mut Provider<'_>,
        payload: Payload,
        responder: Responder<Outcome>,
    ) -> Result<(), Error> {
        if self.blocked.len() >= provider.max_blocked_sends() {
            responder.fail(Error::resource_exhausted(
                self.id,
                "too many sends blocked on link credit",
            ));
            return Ok(());
        }
        trace!(link = %self.id, blocked = self.blocked.len() + 1, "send blocked on credit");
        self.blocked.push_back(BlockedSend { payload, responder });
        Ok(())
    }

    pub fn on_flow(&mut self, provider: &mut Provider<'_>, credit: u32) -> Result<(), Error> {
        let previous = self.credit.set(credit);
        debug!(link = %self.id, previous, credit, "credit updated");

        if credit > previous && !self.blocked.is_empty() {
            // Requeued sends keep their order and run before anything still in the queue
            for BlockedSend { payload, responder } in self.blocked.drain(..) {
                provider.requeue(Command::Send {
                    link: self.id,
                    payload,
                    responder,
                });
            }
        }
        Ok(())
    }

    pub fn on_delivery_updates(
        &mut self,
        provider: &mut Provider<'_>,
        updates: Vec<DeliveryUpdate>,
    ) -> Result<(), Error> {
        for DeliveryUpdate {
            tag,
            state,
            settled,
        } in updates
        {
            let delivery = match self.unsettled.get_mut(&tag) {
                Some(delivery) => delivery,
                None => {
                    trace!(link = %self.id, ?tag, "update for unknown delivery");
                    continue;
                }
            };

            let terminal = settled || state.as_ref().map_or(false, DeliveryState::is_terminal);
            if !terminal {
                if state.is_some() {
                    delivery.state = state;
                }
                continue;
            }

            // A peer that settles without a state has implicitly accepted the delivery
            let outcome = state
                .or_else(|| delivery.state.take())
                .and_then(outcome_of)
                .unwrap_or(Outcome::Accepted(Accepted {}));
            if let Some(delivery) = self.unsettled.remove(&tag) {
                delivery.settle(outcome);
            }
            provider.settle(self.id, tag)?;
        }
        Ok(())
    }

    pub fn on_transfer(
        &mut self,
        provider: &mut Provider<'_>,
        tag: DeliveryTag,
        payload: Payload,
    ) -> Result<(), Error> {
        if self.role != Role::Receiver {
            return Err(Error::protocol_violation(
                self.id,
                "transfer received on a sender link",
            ));
        }
        if self.unsettled.contains_key(&tag) {
            return Err(Error::protocol_violation(
                self.id,
                "transfer reuses an unsettled delivery tag",
            ));
        }
        self.credit
            .consume()
            .map_err(|err| Error::resource_exhausted(self.id, err.to_string()))?;

        self.unsettled
            .insert(tag.clone(), Delivery::new(self.id, tag.clone(), None));
        provider.notify(ProviderEvent::Message {
            link: self.id,
            tag,
            payload,
        });
        Ok(())
    }

    /// Settles a delivery locally and tells the peer
    pub fn settle(
        &mut self,
        provider: &mut Provider<'_>,
        tag: DeliveryTag,
        outcome: Outcome,
        responder: Responder<()>,
    ) -> Result<(), Error> {
        if !self.unsettled.contains_key(&tag) {
            responder.fail(Error::illegal_state(self.id, "unknown delivery tag"));
            return Ok(());
        }

        let result = provider
            .disposition(self.id, tag.clone(), outcome.clone())
            .and_then(|_| provider.settle(self.id, tag.clone()));
        if let Some(delivery) = self.unsettled.remove(&tag) {
            delivery.settle(outcome);
        }
        complete(responder, result)
    }

    pub fn grant_credit(
        &mut self,
        provider: &mut Provider<'_>,
        credit: u32,
        responder: Responder<()>,
    ) -> Result<(), Error> {
        if self.role != Role::Receiver {
            responder.fail(Error::illegal_state(
                self.id,
                "credit can only be granted on a receiver link",
            ));
            return Ok(());
        }
        self.credit.set(credit);
        let result = provider.flow(self.id, credit);
        complete(responder, result)
    }

    /// Fails every send that is blocked or waiting for its outcome
    pub fn fail_pending(&mut self, cause: &Error) {
        for BlockedSend { responder, .. } in self.blocked.drain(..) {
            responder.fail(cause.clone());
        }
        for (_, mut delivery) in std::mem::take(&mut self.unsettled) {
            delivery.fail(cause.clone());
        }
    }
}

fn complete(responder: Responder<()>, result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Ok(()) => {
            responder.complete(Ok(()));
            Ok(())
        }
        Err(err) => {
            responder.fail(err.clone());
            Err(err)
        }
    }
}

fn outcome_of(state: DeliveryState) -> Option<Outcome> {
    match state {
        DeliveryState::Accepted(accepted) => Some(Outcome::Accepted(accepted)),
        DeliveryState::Rejected(rejected) => Some(Outcome::Rejected(rejected)),
        DeliveryState::Released(released) => Some(Outcome::Released(released)),
        DeliveryState::Modified(modified) => Some(Outcome::Modified(modified)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::CreditWindow;

    #[test]
    fn consume_never_underflows() {
        let mut window = CreditWindow::default();
        assert!(window.consume().is_err());
        assert_eq!(window.link_credit(), 0);

        assert_eq!(window.set(2), 0);
        assert_eq!(window.consume().unwrap(), 0u32.to_be_bytes());
        assert_eq!(window.consume().unwrap(), 1u32.to_be_bytes());
        assert!(window.consume().is_err());
        assert_eq!(window.link_credit(), 0);
    }

    #[test]
    fn delivery_count_survives_credit_reset() {
        let mut window = CreditWindow::default();
        window.set(1);
        window.consume().unwrap();
        window.set(1);
        assert_eq!(window.consume().unwrap(), 1u32.to_be_bytes());
    }
}
