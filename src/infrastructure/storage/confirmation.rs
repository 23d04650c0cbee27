//! In-memory confirmation channel
//!
//! One `watch` channel per payer. A newer request for the same payer
//! replaces the older one, whose waiter then resolves as rejected.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{
    ChargingConfirmationRequest, ConfirmationChannel, ConfirmationStatus, DomainError,
    DomainResult,
};

struct Slot {
    request: ChargingConfirmationRequest,
    status: watch::Sender<ConfirmationStatus>,
}

#[derive(Default)]
pub struct InMemoryConfirmationChannel {
    slots: DashMap<String, Slot>,
    published: DashMap<String, usize>,
}

impl InMemoryConfirmationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the user's answer. Returns `false` when nothing is pending.
    pub fn respond(&self, user_id: &str, accepted: bool) -> bool {
        let Some(mut slot) = self.slots.get_mut(user_id) else {
            return false;
        };
        let status = if accepted {
            ConfirmationStatus::Accepted
        } else {
            ConfirmationStatus::Rejected
        };
        slot.request.status = status;
        slot.status.send_replace(status);
        info!(user_id, ?status, "Charging confirmation answered");
        true
    }

    pub fn pending_request(&self, user_id: &str) -> Option<ChargingConfirmationRequest> {
        self.slots.get(user_id).map(|s| s.request.clone())
    }

    pub fn has_pending(&self, user_id: &str) -> bool {
        self.slots
            .get(user_id)
            .map(|s| s.request.status == ConfirmationStatus::Pending)
            .unwrap_or(false)
    }

    /// How many requests were ever published for `user_id`.
    pub fn published_count(&self, user_id: &str) -> usize {
        self.published.get(user_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ConfirmationChannel for InMemoryConfirmationChannel {
    async fn publish_pending(&self, request: ChargingConfirmationRequest) -> DomainResult<()> {
        let user_id = request.user_id.clone();
        let (status, _) = watch::channel(ConfirmationStatus::Pending);
        if self.slots.insert(user_id.clone(), Slot { request, status }).is_some() {
            debug!(user_id = user_id.as_str(), "Superseded pending confirmation");
        }
        *self.published.entry(user_id).or_insert(0) += 1;
        Ok(())
    }

    async fn wait_for_decision(
        &self,
        request: &ChargingConfirmationRequest,
    ) -> DomainResult<ConfirmationStatus> {
        let user_id = request.user_id.as_str();
        let mut receiver = match self.slots.get(user_id) {
            Some(slot) if slot.request.id == request.id => slot.status.subscribe(),
            Some(_) => return Ok(ConfirmationStatus::Rejected),
            None => {
                return Err(DomainError::not_found("ConfirmationRequest", "user_id", user_id))
            }
        };

        let decision = receiver
            .wait_for(|status| *status != ConfirmationStatus::Pending)
            .await
            .map(|status| *status);
        // Sender dropped: the request was replaced or discarded
        Ok(decision.unwrap_or(ConfirmationStatus::Rejected))
    }

    async fn discard(&self, request: &ChargingConfirmationRequest) -> DomainResult<()> {
        self.slots
            .remove_if(&request.user_id, |_, slot| slot.request.id == request.id);
        Ok(())
    }
}
