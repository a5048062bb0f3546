//! Domain events
//!
//! Emitted on a broadcast channel strictly after the owning transaction has
//! committed. The notification side (email dispatch) subscribes
//! fire-and-forget; delivery never participates in financial state.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{CommissionType, Side};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    MemberRegistered {
        member_id: i64,
        introducer_id: i64,
        parent_member_id: i64,
        side: Side,
        email: String,
    },
    MemberVerified {
        member_id: i64,
    },
    MemberActivated {
        member_id: i64,
        plan_id: i64,
        total_paid: f64,
    },
    CommissionPaid {
        member_id: i64,
        commission_type: CommissionType,
        amount: f64,
    },
    CashBackAwarded {
        member_id: i64,
        amount: f64,
    },
    WithdrawalRequested {
        withdrawal_id: i64,
        member_id: i64,
        amount: f64,
    },
    WithdrawalCompleted {
        withdrawal_id: i64,
        member_id: i64,
    },
}

/// Post-commit event fan-out. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Send without caring whether anyone listens. Lagging or absent
    /// subscribers must never fail the caller.
    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(?event, "domain event dropped (no subscribers)");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(DomainEvent::MemberVerified { member_id: 7500 });
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(DomainEvent::MemberVerified { member_id: 1 });
        bus.emit(DomainEvent::CashBackAwarded {
            member_id: 1,
            amount: 45.6,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            DomainEvent::MemberVerified { member_id: 1 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DomainEvent::CashBackAwarded { member_id: 1, .. }
        ));
    }
}
