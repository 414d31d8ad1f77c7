//! Billing event emission
//!
//! The orchestrator and scheduler publish notification-worthy facts here.
//! Delivery (email, webhooks) is an independent consumer; emission never
//! blocks and never fails a billing operation.

use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    SubscriptionActivated {
        customer_id: Uuid,
        customer_key: String,
        next_billing_date: Option<Date>,
    },
    SubscriptionCanceled {
        customer_id: Uuid,
        customer_key: String,
        #[serde(with = "time::serde::rfc3339")]
        canceled_at: OffsetDateTime,
    },
    PaymentApproved {
        customer_id: Uuid,
        order_id: String,
        amount: i64,
    },
    RecurringChargeSucceeded {
        customer_id: Uuid,
        order_id: String,
        amount: i64,
        next_billing_date: Option<Date>,
    },
    ChargeFailed {
        customer_id: Uuid,
        order_id: String,
        amount: i64,
        reason: String,
        recurring: bool,
    },
    PaymentRefunded {
        customer_id: Uuid,
        order_id: String,
        refunded: i64,
        fully_refunded: bool,
    },
}

impl BillingEvent {
    pub fn customer_id(&self) -> Uuid {
        match self {
            BillingEvent::SubscriptionActivated { customer_id, .. }
            | BillingEvent::SubscriptionCanceled { customer_id, .. }
            | BillingEvent::PaymentApproved { customer_id, .. }
            | BillingEvent::RecurringChargeSucceeded { customer_id, .. }
            | BillingEvent::ChargeFailed { customer_id, .. }
            | BillingEvent::PaymentRefunded { customer_id, .. } => *customer_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::SubscriptionActivated { .. } => "subscription_activated",
            BillingEvent::SubscriptionCanceled { .. } => "subscription_canceled",
            BillingEvent::PaymentApproved { .. } => "payment_approved",
            BillingEvent::RecurringChargeSucceeded { .. } => "recurring_charge_succeeded",
            BillingEvent::ChargeFailed { .. } => "charge_failed",
            BillingEvent::PaymentRefunded { .. } => "payment_refunded",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BillingEvent);
}

/// Logs events and drops them
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BillingEvent) {
        tracing::info!(
            event = event.name(),
            customer_id = %event.customer_id(),
            "Billing event"
        );
    }
}

/// Pushes events onto an unbounded queue for an out-of-band consumer
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<BillingEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BillingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: BillingEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::warn!(event = name, "Billing event consumer gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new();
        let customer_id = Uuid::new_v4();

        sink.emit(BillingEvent::PaymentApproved {
            customer_id,
            order_id: "a".into(),
            amount: 100,
        });
        sink.emit(BillingEvent::ChargeFailed {
            customer_id,
            order_id: "b".into(),
            amount: 100,
            reason: "declined".into(),
            recurring: true,
        });

        assert_eq!(rx.try_recv().unwrap().name(), "payment_approved");
        assert_eq!(rx.try_recv().unwrap().name(), "charge_failed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.emit(BillingEvent::PaymentApproved {
            customer_id: Uuid::new_v4(),
            order_id: "a".into(),
            amount: 100,
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BillingEvent::PaymentRefunded {
            customer_id: Uuid::nil(),
            order_id: "x".into(),
            refunded: 500,
            fully_refunded: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "payment_refunded");
        assert_eq!(json["refunded"], 500);
    }
}
