//! Outbound ports
//!
//! Trait contracts for the external collaborators the charging core talks to.
//! Store ports live next to their aggregates (`SessionStore`, `WalletStore`).

use async_trait::async_trait;

use crate::domain::confirmation::{ChargingConfirmationRequest, ConfirmationStatus};
use crate::domain::events::{LiveStateUpdate, UserNotification};
use crate::domain::DomainResult;

/// Fire-and-forget mirror of live station state.
pub trait LiveStateMirror: Send + Sync {
    fn publish(&self, update: LiveStateUpdate);
}

/// Fire-and-forget user notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, notification: UserNotification);
}

/// Pub/sub channel carrying the user's answer to a charging request.
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    /// Write a `pending` record keyed by the payer id, replacing any previous one.
    async fn publish_pending(&self, request: ChargingConfirmationRequest) -> DomainResult<()>;

    /// Resolve once `request` leaves `pending`. A request replaced by a newer
    /// one for the same payer resolves as rejected. Callers bound this with
    /// their own timeout.
    async fn wait_for_decision(
        &self,
        request: &ChargingConfirmationRequest,
    ) -> DomainResult<ConfirmationStatus>;

    /// Drop `request` unless a newer one has replaced it.
    async fn discard(&self, request: &ChargingConfirmationRequest) -> DomainResult<()>;
}
